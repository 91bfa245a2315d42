pub mod concurrent;
pub mod names;
pub mod path;
pub mod stats;

mod error;
pub use error::{Error, Result};

mod file_status;
pub use file_status::FileStatus;

/// Marker appended after a delimiter to represent an empty folder in a flat
/// key space.
pub const DIRECTORY_MARKER: &str = "_$DirectoryMarker_";

/// Key prefix under which locally hydrated cache blocks are registered.
pub const CACHE_BLOCK_MARKER: &str = "_$cachedblock$/";

/// Default folder delimiter for listings.
pub const FOLDER_DELIMITER: char = '/';
