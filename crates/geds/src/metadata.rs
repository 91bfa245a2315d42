//! Client for the metadata service. Thin typed wrappers over the generated
//! stubs with connected-state checking and status unwrapping.

use geds_proto::rpc;
use geds_proto::rpc::metadata_service_client::MetadataServiceClient;
use geds_proto::{check_error, Object, ObjectId};
use geds_s3::ObjectStoreConfig;
use geds_util::{Error, Result};
use std::time::Duration;
use tonic::transport::Channel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_DEADLINE: Duration = Duration::from_secs(10);

pub struct MetadataClient {
    server_address: String,
    client: tokio::sync::Mutex<Option<MetadataServiceClient<Channel>>>,
}

impl MetadataClient {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            client: tokio::sync::Mutex::new(None),
        }
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub async fn connect(&self) -> Result<()> {
        let mut client = self.client.lock().await;
        if client.is_some() {
            return Err(Error::Unknown("cannot reinitialize service".to_string()));
        }
        let address = format!("http://{}", self.server_address);
        let channel = Channel::from_shared(address)
            .map_err(|err| Error::InvalidArgument(err.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .map_err(|err| {
                Error::Unavailable(format!(
                    "could not connect to {}: {err}",
                    self.server_address
                ))
            })?;
        *client = Some(MetadataServiceClient::new(channel));
        tracing::debug!(address = %self.server_address, "connected to metadata service");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut client = self.client.lock().await;
        if client.take().is_none() {
            return Err(Error::FailedPrecondition("not connected".to_string()));
        }
        Ok(())
    }

    async fn client(&self) -> Result<MetadataServiceClient<Channel>> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::FailedPrecondition("not connected".to_string()))
    }

    fn rpc_error(command: &str) -> impl FnOnce(tonic::Status) -> Error + '_ {
        move |status| Error::Unavailable(format!("unable to execute {command}: {status}"))
    }

    /// Unary calls carry the default 10 second deadline. The subscription
    /// stream is exempt: it lives until either side hangs up.
    fn with_deadline<T>(message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(RPC_DEADLINE);
        request
    }

    pub async fn get_connection_information(&self) -> Result<String> {
        let response = self
            .client()
            .await?
            .get_connection_information(Self::with_deadline(rpc::EmptyParams {}))
            .await
            .map_err(Self::rpc_error("GetConnectionInformation"))?
            .into_inner();
        check_error(response.error)?;
        Ok(response.remote_address)
    }

    pub async fn register_object_store(&self, config: &ObjectStoreConfig) -> Result<()> {
        let response = self
            .client()
            .await?
            .register_object_store(Self::with_deadline(rpc::ObjectStoreConfig {
                bucket: config.bucket.clone(),
                endpoint_url: config.endpoint_url.clone(),
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
            }))
            .await
            .map_err(Self::rpc_error("RegisterObjectStore"))?;
        response.into_inner().into_result()
    }

    pub async fn list_object_store_configs(&self) -> Result<Vec<ObjectStoreConfig>> {
        let response = self
            .client()
            .await?
            .list_object_stores(Self::with_deadline(rpc::EmptyParams {}))
            .await
            .map_err(Self::rpc_error("ListObjectStores"))?
            .into_inner();
        Ok(response
            .mappings
            .into_iter()
            .map(|m| ObjectStoreConfig::new(m.bucket, m.endpoint_url, m.access_key, m.secret_key))
            .collect())
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let response = self
            .client()
            .await?
            .create_bucket(Self::with_deadline(rpc::Bucket {
                bucket: bucket.to_string(),
            }))
            .await
            .map_err(Self::rpc_error("CreateBucket"))?;
        response.into_inner().into_result()
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let response = self
            .client()
            .await?
            .delete_bucket(Self::with_deadline(rpc::Bucket {
                bucket: bucket.to_string(),
            }))
            .await
            .map_err(Self::rpc_error("DeleteBucket"))?;
        response.into_inner().into_result()
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .client()
            .await?
            .list_buckets(Self::with_deadline(rpc::EmptyParams {}))
            .await
            .map_err(Self::rpc_error("ListBuckets"))?
            .into_inner();
        check_error(response.error)?;
        Ok(response.results)
    }

    pub async fn lookup_bucket(&self, bucket: &str) -> Result<()> {
        let response = self
            .client()
            .await?
            .lookup_bucket(Self::with_deadline(rpc::Bucket {
                bucket: bucket.to_string(),
            }))
            .await
            .map_err(Self::rpc_error("LookupBucket"))?;
        response.into_inner().into_result()
    }

    pub async fn create_object(&self, object: Object) -> Result<()> {
        let response = self
            .client()
            .await?
            .create(Self::with_deadline(rpc::Object::from(object)))
            .await
            .map_err(Self::rpc_error("Create"))?;
        response.into_inner().into_result()
    }

    pub async fn update_object(&self, object: Object) -> Result<()> {
        let response = self
            .client()
            .await?
            .update(Self::with_deadline(rpc::Object::from(object)))
            .await
            .map_err(Self::rpc_error("Update"))?;
        response.into_inner().into_result()
    }

    pub async fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let response = self
            .client()
            .await?
            .delete(Self::with_deadline(rpc::ObjectId::from(id.clone())))
            .await
            .map_err(Self::rpc_error("Delete"))?;
        response.into_inner().into_result()
    }

    pub async fn delete_prefix(&self, id: &ObjectId) -> Result<()> {
        let response = self
            .client()
            .await?
            .delete_prefix(Self::with_deadline(rpc::ObjectId::from(id.clone())))
            .await
            .map_err(Self::rpc_error("DeletePrefix"))?;
        response.into_inner().into_result()
    }

    pub async fn lookup(&self, id: &ObjectId) -> Result<Object> {
        let response = self
            .client()
            .await?
            .lookup(Self::with_deadline(rpc::ObjectId::from(id.clone())))
            .await
            .map_err(Self::rpc_error("Lookup"))?
            .into_inner();
        check_error(response.error)?;
        let object = response
            .result
            .ok_or_else(|| Error::Unknown("lookup response is missing its result".to_string()))?;
        Object::try_from(object)
    }

    pub async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<(Vec<Object>, Vec<String>)> {
        let response = self
            .client()
            .await?
            .list(Self::with_deadline(rpc::ObjectListRequest {
                prefix: Some(rpc::ObjectId {
                    bucket: bucket.to_string(),
                    key: prefix.to_string(),
                }),
                delimiter: delimiter.map(|d| d as i32),
            }))
            .await
            .map_err(Self::rpc_error("List"))?
            .into_inner();
        check_error(response.error)?;
        let objects = response
            .results
            .into_iter()
            .map(Object::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((objects, response.common_prefixes))
    }

    pub async fn register_node(&self, identifier: &str, host: &str, port: u16) -> Result<()> {
        let response = self
            .client()
            .await?
            .register_node(Self::with_deadline(rpc::NodeRegistration {
                identifier: identifier.to_string(),
                host: host.to_string(),
                port: port as u32,
            }))
            .await
            .map_err(Self::rpc_error("RegisterNode"))?;
        response.into_inner().into_result()
    }

    pub async fn heartbeat(&self, heartbeat: rpc::NodeHeartbeat) -> Result<()> {
        let response = self
            .client()
            .await?
            .heartbeat(Self::with_deadline(heartbeat))
            .await
            .map_err(Self::rpc_error("Heartbeat"))?;
        response.into_inner().into_result()
    }

    pub async fn decommission_nodes(&self, identifiers: Vec<String>) -> Result<()> {
        let response = self
            .client()
            .await?
            .decommission_nodes(Self::with_deadline(rpc::NodeList { identifiers }))
            .await
            .map_err(Self::rpc_error("DecommissionNodes"))?;
        response.into_inner().into_result()
    }

    pub async fn subscribe(&self, event: rpc::SubscriptionEvent) -> Result<()> {
        let response = self
            .client()
            .await?
            .subscribe(Self::with_deadline(event))
            .await
            .map_err(Self::rpc_error("Subscribe"))?;
        response.into_inner().into_result()
    }

    pub async fn unsubscribe(&self, event: rpc::SubscriptionEvent) -> Result<()> {
        let response = self
            .client()
            .await?
            .unsubscribe(Self::with_deadline(event))
            .await
            .map_err(Self::rpc_error("Unsubscribe"))?;
        response.into_inner().into_result()
    }

    /// Long-lived subscription event stream for this subscriber.
    pub async fn subscribe_stream(
        &self,
        subscriber_id: &str,
    ) -> Result<tonic::Streaming<rpc::Object>> {
        let response = self
            .client()
            .await?
            .subscribe_stream(rpc::SubscriptionStreamEvent {
                subscriber_id: subscriber_id.to_string(),
            })
            .await
            .map_err(Self::rpc_error("SubscribeStream"))?;
        Ok(response.into_inner())
    }
}
