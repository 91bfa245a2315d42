mod endpoint;
pub use endpoint::Endpoint;

mod stores;
pub use stores::{ObjectStoreConfig, ObjectStoreConfigs, ObjectStores};
