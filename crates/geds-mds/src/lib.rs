pub mod http;
pub mod kvs;
pub mod nodes;
pub mod pubsub;
pub mod service;

use geds_proto::rpc::metadata_service_server::MetadataServiceServer;
use geds_s3::ObjectStoreConfigs;
use geds_util::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;

/// Default port of the metadata service.
pub const DEFAULT_METADATA_SERVER_PORT: u16 = 4380;
/// Default port of the HTTP admin server.
pub const DEFAULT_HTTP_SERVER_PORT: u16 = 4384;

/// Shared state of a running metadata service.
pub struct Mds {
    pub kvs: Arc<kvs::Kvs>,
    pub nodes: Arc<nodes::Nodes>,
    pub object_stores: Arc<ObjectStoreConfigs>,
    pub pubsub: Arc<pubsub::PubSub>,
}

impl Default for Mds {
    fn default() -> Self {
        Self::new()
    }
}

impl Mds {
    pub fn new() -> Self {
        Self {
            kvs: Arc::new(kvs::Kvs::new()),
            nodes: Arc::new(nodes::Nodes::new()),
            object_stores: Arc::new(ObjectStoreConfigs::new()),
            pubsub: Arc::new(pubsub::PubSub::new()),
        }
    }

    pub fn grpc_service(&self) -> MetadataServiceServer<service::MetadataServiceImpl> {
        MetadataServiceServer::new(service::MetadataServiceImpl::new(
            self.kvs.clone(),
            self.nodes.clone(),
            self.object_stores.clone(),
            self.pubsub.clone(),
        ))
    }

    /// Serve the gRPC service until the process is interrupted. Failing to
    /// bind is fatal.
    pub async fn serve(&self, address: SocketAddr) -> Result<()> {
        tracing::info!(%address, "metadata service listening");
        tonic::transport::Server::builder()
            .add_service(self.grpc_service())
            .serve(address)
            .await
            .map_err(|err| Error::Unavailable(format!("metadata server failed: {err}")))
    }

    /// Serve the HTTP admin endpoint.
    pub async fn serve_http(&self, address: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|err| Error::Unavailable(format!("unable to bind {address}: {err}")))?;
        tracing::info!(%address, "http admin listening");
        axum::serve(listener, http::router(self.nodes.clone()))
            .await
            .map_err(|err| Error::Unavailable(format!("http server failed: {err}")))
    }
}
