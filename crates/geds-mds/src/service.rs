//! The metadata gRPC service.

use crate::kvs::Kvs;
use crate::nodes::{HeartbeatStats, Nodes};
use crate::pubsub::{PubSub, Subscription};
use geds_proto::rpc;
use geds_proto::rpc::metadata_service_server::MetadataService;
use geds_proto::{Object, ObjectId};
use geds_s3::{ObjectStoreConfig, ObjectStoreConfigs};
use geds_util::{names, Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// Strip the `ipv4:`/`ipv6:` prefix from a gRPC peer identity and drop the
/// port, preserving IPv6 brackets. Multi-address peers are rejected.
pub fn address_from_grpc_peer(peer: &str) -> Result<String> {
    if peer.contains(',') {
        return Err(Error::Unknown(format!(
            "peer information {peer} contains multiple IP addresses"
        )));
    }
    if let Some(rest) = peer.strip_prefix("ipv4:") {
        // Format: `ipv4:address[:port]`.
        let address = rest.split(':').next().unwrap_or_default();
        if address.is_empty() {
            return Err(Error::Unknown(format!(
                "unable to parse ip from peer {peer}"
            )));
        }
        return Ok(address.to_string());
    }
    if let Some(rest) = peer.strip_prefix("ipv6:") {
        // Format: `ipv6:[address][:port]`, e.g. `ipv6:[2607:f8b0::ef]:443`.
        if rest.is_empty() || rest.starts_with(']') {
            return Err(Error::Unknown(format!("invalid IPv6 peer {peer}")));
        }
        return Ok(match rest.find(']') {
            Some(at) => rest[..=at].to_string(),
            None => rest.to_string(),
        });
    }
    Err(Error::Unknown(format!(
        "unable to parse peer {peer} (unknown gRPC peer format)"
    )))
}

/// Peer identity string for a socket address, in the gRPC textual format.
pub fn grpc_peer_string(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(SocketAddr::V4(v4)) => format!("ipv4:{}:{}", v4.ip(), v4.port()),
        Some(SocketAddr::V6(v6)) => format!("ipv6:[{}]:{}", v6.ip(), v6.port()),
        None => String::new(),
    }
}

pub struct MetadataServiceImpl {
    kvs: Arc<Kvs>,
    nodes: Arc<Nodes>,
    object_stores: Arc<ObjectStoreConfigs>,
    pubsub: Arc<PubSub>,
}

impl MetadataServiceImpl {
    pub fn new(
        kvs: Arc<Kvs>,
        nodes: Arc<Nodes>,
        object_stores: Arc<ObjectStoreConfigs>,
        pubsub: Arc<PubSub>,
    ) -> Self {
        Self {
            kvs,
            nodes,
            object_stores,
            pubsub,
        }
    }

    fn convert_object(&self, request: rpc::Object) -> Result<Object> {
        let object = Object::try_from(request)?;
        names::validate_object_name(&object.id.bucket, &object.id.key)?;
        Ok(object)
    }
}

#[tonic::async_trait]
impl MetadataService for MetadataServiceImpl {
    async fn get_connection_information(
        &self,
        request: Request<rpc::EmptyParams>,
    ) -> std::result::Result<Response<rpc::ConnectionInformation>, Status> {
        let peer = grpc_peer_string(request.remote_addr());
        tracing::debug!(%peer, "get connection information");
        let response = match address_from_grpc_peer(&peer) {
            Ok(remote_address) => rpc::ConnectionInformation {
                remote_address,
                error: None,
            },
            Err(err) => rpc::ConnectionInformation {
                remote_address: String::new(),
                error: Some(rpc::StatusResponse::from_error(&err)),
            },
        };
        Ok(Response::new(response))
    }

    async fn register_object_store(
        &self,
        request: Request<rpc::ObjectStoreConfig>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let config = request.into_inner();
        tracing::info!(bucket = %config.bucket, endpoint = %config.endpoint_url, "register object store");
        let result = self.object_stores.insert(ObjectStoreConfig::new(
            config.bucket,
            config.endpoint_url,
            config.access_key,
            config.secret_key,
        ));
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn list_object_stores(
        &self,
        _request: Request<rpc::EmptyParams>,
    ) -> std::result::Result<Response<rpc::AvailableObjectStoreConfigs>, Status> {
        tracing::debug!("list object stores");
        let mappings = self
            .object_stores
            .list()
            .into_iter()
            .map(|config| rpc::ObjectStoreConfig {
                bucket: config.bucket,
                endpoint_url: config.endpoint_url,
                access_key: config.access_key,
                secret_key: config.secret_key,
            })
            .collect();
        Ok(Response::new(rpc::AvailableObjectStoreConfigs { mappings }))
    }

    async fn create_bucket(
        &self,
        request: Request<rpc::Bucket>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let bucket = request.into_inner().bucket;
        tracing::debug!(%bucket, "create bucket");
        let result =
            names::validate_bucket_name(&bucket).and_then(|_| self.kvs.create_bucket(&bucket));
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn delete_bucket(
        &self,
        request: Request<rpc::Bucket>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let bucket = request.into_inner().bucket;
        tracing::debug!(%bucket, "delete bucket");
        let result = self.kvs.delete_bucket(&bucket);
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn list_buckets(
        &self,
        _request: Request<rpc::EmptyParams>,
    ) -> std::result::Result<Response<rpc::BucketListResponse>, Status> {
        tracing::debug!("list buckets");
        Ok(Response::new(rpc::BucketListResponse {
            results: self.kvs.list_buckets(),
            error: None,
        }))
    }

    async fn lookup_bucket(
        &self,
        request: Request<rpc::Bucket>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let bucket = request.into_inner().bucket;
        tracing::debug!(%bucket, "lookup bucket");
        let result = self.kvs.bucket_status(&bucket);
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn create(
        &self,
        request: Request<rpc::Object>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let result = self.convert_object(request.into_inner()).and_then(|obj| {
            tracing::debug!(
                id = %obj.id,
                location = %obj.info.location,
                size = obj.info.size,
                sealed = obj.info.sealed_offset,
                "create object"
            );
            self.kvs.create_object(obj.clone(), false)?;
            self.pubsub.publish(&obj);
            Ok(())
        });
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn update(
        &self,
        request: Request<rpc::Object>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let result = self.convert_object(request.into_inner()).and_then(|obj| {
            tracing::debug!(
                id = %obj.id,
                location = %obj.info.location,
                size = obj.info.size,
                "update object"
            );
            self.kvs.update_object(obj.clone())?;
            self.pubsub.publish(&obj);
            Ok(())
        });
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn delete(
        &self,
        request: Request<rpc::ObjectId>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let id = ObjectId::from(request.into_inner());
        tracing::debug!(%id, "delete object");
        let result = self.kvs.delete_object(&id);
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn delete_prefix(
        &self,
        request: Request<rpc::ObjectId>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let id = ObjectId::from(request.into_inner());
        tracing::debug!(%id, "delete prefix");
        let result = self.kvs.delete_prefix(&id);
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn lookup(
        &self,
        request: Request<rpc::ObjectId>,
    ) -> std::result::Result<Response<rpc::ObjectResponse>, Status> {
        let id = ObjectId::from(request.into_inner());
        tracing::debug!(%id, "lookup object");
        let response = match self.kvs.lookup(&id) {
            Ok(object) => rpc::ObjectResponse {
                result: Some(object.into()),
                error: None,
            },
            Err(err) => rpc::ObjectResponse {
                result: None,
                error: Some(rpc::StatusResponse::from_error(&err)),
            },
        };
        Ok(Response::new(response))
    }

    async fn list(
        &self,
        request: Request<rpc::ObjectListRequest>,
    ) -> std::result::Result<Response<rpc::ObjectListResponse>, Status> {
        let request = request.into_inner();
        let delimiter = match request.delimiter() {
            0 => None,
            d => char::from_u32(d as u32),
        };
        let prefix = request.prefix.unwrap_or_default();
        tracing::debug!(bucket = %prefix.bucket, prefix = %prefix.key, ?delimiter, "list objects");
        let response = match self.kvs.list(&prefix.bucket, &prefix.key, delimiter) {
            Ok((objects, common_prefixes)) => rpc::ObjectListResponse {
                results: objects.into_iter().map(Into::into).collect(),
                common_prefixes,
                error: None,
            },
            Err(err) => rpc::ObjectListResponse {
                results: Vec::new(),
                common_prefixes: Vec::new(),
                error: Some(rpc::StatusResponse::from_error(&err)),
            },
        };
        Ok(Response::new(response))
    }

    async fn register_node(
        &self,
        request: Request<rpc::NodeRegistration>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let registration = request.into_inner();
        tracing::info!(
            identifier = %registration.identifier,
            host = %registration.host,
            port = registration.port,
            "register node"
        );
        let result = if registration.identifier.is_empty()
            || registration.host.is_empty()
            || registration.port == 0
            || registration.port > u16::MAX as u32
        {
            Err(Error::InvalidArgument(
                "node registration requires identifier, host and port".to_string(),
            ))
        } else {
            self.nodes.register(
                &registration.identifier,
                &registration.host,
                registration.port as u16,
            )
        };
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn heartbeat(
        &self,
        request: Request<rpc::NodeHeartbeat>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let heartbeat = request.into_inner();
        tracing::trace!(identifier = %heartbeat.identifier, "heartbeat");
        let result = self.nodes.heartbeat(
            &heartbeat.identifier,
            HeartbeatStats {
                storage_allocated: heartbeat.storage_allocated,
                storage_used: heartbeat.storage_used,
                memory_allocated: heartbeat.memory_allocated,
                memory_used: heartbeat.memory_used,
            },
        );
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn decommission_nodes(
        &self,
        request: Request<rpc::NodeList>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let identifiers = request.into_inner().identifiers;
        tracing::info!(?identifiers, "decommission nodes");
        let result = self.nodes.decommission(&identifiers, &self.kvs).await;
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    async fn subscribe(
        &self,
        request: Request<rpc::SubscriptionEvent>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let event = request.into_inner();
        tracing::debug!(subscriber = %event.subscriber_id, bucket = %event.bucket_id, "subscribe");
        self.pubsub.subscribe(
            &event.subscriber_id,
            Subscription {
                bucket: event.bucket_id.clone(),
                key: event.key.clone(),
                kind: event.subscription_type(),
            },
        );
        Ok(Response::new(rpc::StatusResponse::ok()))
    }

    async fn unsubscribe(
        &self,
        request: Request<rpc::SubscriptionEvent>,
    ) -> std::result::Result<Response<rpc::StatusResponse>, Status> {
        let event = request.into_inner();
        tracing::debug!(subscriber = %event.subscriber_id, bucket = %event.bucket_id, "unsubscribe");
        let result = self.pubsub.unsubscribe(
            &event.subscriber_id,
            &Subscription {
                bucket: event.bucket_id.clone(),
                key: event.key.clone(),
                kind: event.subscription_type(),
            },
        );
        Ok(Response::new(rpc::StatusResponse::from_result(result)))
    }

    type SubscribeStreamStream = ReceiverStream<std::result::Result<rpc::Object, Status>>;

    async fn subscribe_stream(
        &self,
        request: Request<rpc::SubscriptionStreamEvent>,
    ) -> std::result::Result<Response<Self::SubscribeStreamStream>, Status> {
        let event = request.into_inner();
        tracing::debug!(subscriber = %event.subscriber_id, "subscription stream opened");
        let receiver = self.pubsub.open_stream(&event.subscriber_id);
        Ok(Response::new(ReceiverStream::new(receiver)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_peers() {
        assert_eq!(address_from_grpc_peer("ipv4:127.0.0.1").unwrap(), "127.0.0.1");
        assert_eq!(
            address_from_grpc_peer("ipv4:127.0.0.1:1234").unwrap(),
            "127.0.0.1"
        );
        assert_eq!(
            address_from_grpc_peer("ipv4:www.example.com").unwrap(),
            "www.example.com"
        );
        assert!(address_from_grpc_peer("ipv4:149.112.112.112,9.9.9.9").is_err());
        assert!(address_from_grpc_peer("ipv4:149.112.112.112:53,9.9.9.9:53").is_err());
    }

    #[test]
    fn parses_ipv6_peers_with_brackets() {
        assert_eq!(
            address_from_grpc_peer("ipv6:[2620:fe::fe]:53").unwrap(),
            "[2620:fe::fe]"
        );
        assert_eq!(address_from_grpc_peer("ipv6:[::]:443").unwrap(), "[::]");
        assert_eq!(
            address_from_grpc_peer("ipv6:[2620:fe::fe]").unwrap(),
            "[2620:fe::fe]"
        );
        assert_eq!(address_from_grpc_peer("ipv6:[::]").unwrap(), "[::]");
        assert!(address_from_grpc_peer("ipv6:[2620:fe::9],[2620:fe::fe]").is_err());
        assert!(address_from_grpc_peer("ipv6:[2620:fe::9]:53,[2620:fe::fe]:53").is_err());
    }

    #[test]
    fn rejects_unknown_peer_formats() {
        assert!(address_from_grpc_peer("149.112.112.112").is_err());
        assert!(address_from_grpc_peer("ipv7:149.112.112.112:53").is_err());
        assert!(address_from_grpc_peer("").is_err());
    }

    #[test]
    fn formats_socket_addrs_as_peers() {
        let v4: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(grpc_peer_string(Some(v4)), "ipv4:127.0.0.1:8080");
        assert_eq!(
            address_from_grpc_peer(&grpc_peer_string(Some(v4))).unwrap(),
            "127.0.0.1"
        );

        let v6: SocketAddr = "[2620:fe::fe]:53".parse().unwrap();
        assert_eq!(grpc_peer_string(Some(v6)), "ipv6:[2620:fe::fe]:53");
        assert_eq!(
            address_from_grpc_peer(&grpc_peer_string(Some(v6))).unwrap(),
            "[2620:fe::fe]"
        );
    }
}
