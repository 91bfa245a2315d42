//! The file-handle variants.

mod cached;
pub use cached::CachedHandle;

mod local;
pub use local::{LocalFileHandle, LocalHandle, MmapFileHandle};

mod relocatable;
pub use relocatable::RelocatableHandle;

mod remote;
pub use remote::RemoteHandle;

mod s3;
pub use s3::S3Handle;
