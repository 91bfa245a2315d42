//! Pooled client for the simple data plane. The fallback transport when a
//! peer advertises no multiplex endpoint.

use crate::transport::request::{create_get_request, Response, RESPONSE_HEADER_SIZE};
use crate::transport::IDLE_TIMEOUT;
use geds_util::concurrent::ConcurrentQueue;
use geds_util::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// One lazily (re)connected connection.
struct TcpConnection {
    address: SocketAddr,
    stream: Option<BufStream<TcpStream>>,
}

impl TcpConnection {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            stream: None,
        }
    }

    async fn stream(&mut self) -> Result<&mut BufStream<TcpStream>> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.address).await.map_err(|err| {
                Error::Unavailable(format!("unable to connect to {}: {err}", self.address))
            })?;
            let _ = stream.set_nodelay(true);
            self.stream = Some(BufStream::new(stream));
        }
        Ok(self.stream.as_mut().expect("connected above"))
    }

    async fn read_bytes(
        &mut self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize> {
        let result = self.read_bytes_inner(bucket, key, buf, position).await;
        // Errors carried in a response header leave the stream aligned on a
        // message boundary; transport-level failures force a reconnect.
        if matches!(
            result,
            Err(Error::Unavailable(_)) | Err(Error::Unknown(_)) | Err(Error::Internal(_))
        ) {
            self.stream = None;
        }
        result
    }

    async fn read_bytes_inner(
        &mut self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize> {
        let request = create_get_request(bucket, key, position, buf.len() as u64);
        let address = self.address;
        let stream = self.stream().await?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(&[0u8]).await?;
        stream.flush().await?;

        let mut header = [0u8; RESPONSE_HEADER_SIZE];
        tokio::time::timeout(IDLE_TIMEOUT, stream.read_exact(&mut header))
            .await
            .map_err(|_| Error::Unavailable(format!("timeout reading from {address}")))??;
        let response = Response::decode(&header);

        if response.status_code != 0 {
            let mut message = vec![0u8; response.length as usize];
            stream.read_exact(&mut message).await?;
            let message = String::from_utf8_lossy(&message).into_owned();
            return Err(Error::from_code(
                tonic::Code::from(response.status_code),
                message,
            ));
        }

        let n = response.length as usize;
        if n > buf.len() {
            return Err(Error::Internal(format!(
                "peer announced {n} bytes for a {} byte read",
                buf.len()
            )));
        }
        stream.read_exact(&mut buf[..n]).await?;
        Ok(n)
    }
}

/// Fixed-size pool of connections to one peer's data plane.
pub struct TcpClientPool {
    connections: ConcurrentQueue<TcpConnection>,
    available: Semaphore,
}

impl TcpClientPool {
    pub fn new(address: SocketAddr, size: usize) -> Self {
        let connections = ConcurrentQueue::new();
        for _ in 0..size {
            connections.push(TcpConnection::new(address));
        }
        Self {
            connections,
            available: Semaphore::new(size),
        }
    }

    /// Read up to `buf.len()` bytes of `bucket/key` at `position`, borrowing
    /// a pooled connection for the exchange.
    pub async fn read_bytes(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize> {
        let _permit = self
            .available
            .acquire()
            .await
            .map_err(|_| Error::Unavailable("connection pool is closed".to_string()))?;
        let mut connection = self
            .connections
            .pop()
            .expect("permit guarantees a pooled connection");
        let result = connection.read_bytes(bucket, key, buf, position).await;
        self.connections.push(connection);
        result
    }
}
