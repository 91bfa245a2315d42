//! The node control service: endpoint advertisement and relocation
//! downloads.

use crate::GedsCore;
use geds_proto::rpc;
use geds_proto::rpc::node_service_server::NodeService;
use geds_util::Error;
use std::sync::Weak;
use tonic::{Request, Response, Status};

pub struct NodeServiceImpl {
    core: Weak<GedsCore>,
}

impl NodeServiceImpl {
    pub fn new(core: Weak<GedsCore>) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    async fn get_avail_endpoints(
        &self,
        _request: Request<rpc::EmptyParams>,
    ) -> Result<Response<rpc::AvailTransportEndpoints>, Status> {
        let Some(core) = self.core.upgrade() else {
            return Err(Status::unavailable("node is shutting down"));
        };
        let endpoint = core.transport_endpoints();
        tracing::debug!(count = endpoint.len(), "reporting transfer endpoints");
        Ok(Response::new(rpc::AvailTransportEndpoints { endpoint }))
    }

    async fn download_objects(
        &self,
        request: Request<rpc::MultiObjectId>,
    ) -> Result<Response<rpc::StatusResponse>, Status> {
        let Some(core) = self.core.upgrade() else {
            return Err(Status::unavailable("node is shutting down"));
        };
        let objects = request.into_inner().objects;
        tracing::info!(count = objects.len(), "downloading objects");

        let mut first_error: Option<Error> = None;
        for id in objects {
            if let Err(err) = core.download_object(&id.bucket, &id.key).await {
                tracing::error!(bucket = %id.bucket, key = %id.key, %err, "download failed");
                first_error.get_or_insert(err);
            }
        }
        let result = match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        };
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }
}
