//! Per-peer file transfer: resolve the peer's advertised data-plane
//! endpoints over its control channel, then read ranges through the
//! multiplexed transport, falling back to the pooled simple-plane client.

use crate::transport::client::TcpClientPool;
use crate::transport::mux::MuxPeer;
use crate::transport::CONNECTIONS_PER_PEER;
use crate::GedsCore;
use geds_proto::rpc;
use geds_proto::rpc::node_service_client::NodeServiceClient;
use geds_util::{Error, Result};
use std::sync::Arc;

enum Mode {
    Multiplex(Arc<MuxPeer>),
    Socket(TcpClientPool),
}

pub struct FileTransferService {
    node_address: String,
    mode: Mode,
}

impl FileTransferService {
    /// Connect to the peer at `node_address` (`host:port` of its control
    /// service) and pick the best advertised transfer endpoint.
    pub async fn connect(core: &Arc<GedsCore>, node_address: &str) -> Result<Arc<Self>> {
        let mut client = NodeServiceClient::connect(format!("http://{node_address}"))
            .await
            .map_err(|err| {
                Error::Unavailable(format!("could not connect to {node_address}: {err}"))
            })?;
        let endpoints = client
            .get_avail_endpoints(rpc::EmptyParams {})
            .await
            .map_err(|status| {
                Error::Unavailable(format!("unable to obtain available endpoints: {status}"))
            })?
            .into_inner()
            .endpoint;

        let pick = |protocol: rpc::TransportProtocol| {
            endpoints
                .iter()
                .find(|ep| ep.protocol() == protocol && !ep.address.is_empty())
        };

        let mode = if let Some(endpoint) = pick(rpc::TransportProtocol::Multiplex) {
            tracing::debug!(
                address = %endpoint.address,
                port = endpoint.port,
                "using multiplex endpoint"
            );
            let peer = core
                .mux()
                .connect(
                    &endpoint.address,
                    endpoint.port as u16,
                    CONNECTIONS_PER_PEER,
                )
                .await?;
            Mode::Multiplex(peer)
        } else if let Some(endpoint) = pick(rpc::TransportProtocol::Socket) {
            tracing::debug!(
                address = %endpoint.address,
                port = endpoint.port,
                "using socket endpoint"
            );
            let address = tokio::net::lookup_host((endpoint.address.as_str(), endpoint.port as u16))
                .await
                .map_err(|err| Error::Unavailable(format!("unable to resolve peer: {err}")))?
                .next()
                .ok_or_else(|| {
                    Error::Unavailable(format!("{} did not resolve", endpoint.address))
                })?;
            Mode::Socket(TcpClientPool::new(address, CONNECTIONS_PER_PEER))
        } else {
            return Err(Error::Unavailable(format!(
                "{node_address} advertises no usable transfer endpoint"
            )));
        };

        Ok(Arc::new(Self {
            node_address: node_address.to_string(),
            mode,
        }))
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    /// Ranged read of `bucket/key` from the peer into `buf`.
    pub async fn read_bytes(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize> {
        match &self.mode {
            Mode::Multiplex(peer) => {
                let name = format!("{bucket}/{key}");
                let bytes = peer.read(&name, position, buf.len() as u64).await?;
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Mode::Socket(pool) => pool.read_bytes(bucket, key, buf, position).await,
        }
    }
}
