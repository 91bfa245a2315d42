//! The simple data-plane listener.
//!
//! Every connection runs as its own task cycling through
//! await-request/parse/serve. Parse failures answer with an error response
//! and keep the connection open; an idle timeout closes it.

use crate::transport::request::{parse_get_request, Response};
use crate::transport::{BufferPool, IDLE_TIMEOUT, MIN_SENDFILE_SIZE};
use crate::GedsCore;
use geds_util::stats::{Histogram, IntCounter};
use geds_util::{Error, Result};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream, Interest};
use tokio::net::{TcpListener, TcpStream};

pub struct TcpServer {
    core: Weak<GedsCore>,
    buffers: Arc<BufferPool>,
    bytes_sent: IntCounter,
    request_sizes: Histogram,
}

impl TcpServer {
    pub fn new(core: Weak<GedsCore>) -> Arc<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8)
            .max(8);
        Arc::new(Self {
            core,
            buffers: Arc::new(BufferPool::new(workers)),
            bytes_sent: geds_util::stats::counter("geds tcp server: bytes sent"),
            request_sizes: geds_util::stats::io_histogram("geds tcp server: request size"),
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "data plane connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            tracing::debug!(%peer, %err, "connection closed");
                        }
                    });
                }
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let mut stream = BufStream::new(stream);
        let mut request = Vec::new();
        loop {
            request.clear();
            let read = tokio::time::timeout(IDLE_TIMEOUT, stream.read_until(0, &mut request)).await;
            let n = match read {
                // Idle or closed by the peer.
                Err(_) => return Ok(()),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
            };
            debug_assert!(n == request.len());
            if request.last() == Some(&0) {
                request.pop();
            }
            let text = String::from_utf8_lossy(&request).into_owned();
            tracing::debug!(request = %text, "parsed request");
            match parse_get_request(&text) {
                Err(err) => self.send_error(&mut stream, &err).await?,
                Ok((bucket, key, position, length)) => {
                    self.serve_get(&mut stream, &bucket, &key, position, length)
                        .await?
                }
            }
        }
    }

    async fn send_error(&self, stream: &mut BufStream<TcpStream>, err: &Error) -> Result<()> {
        tracing::debug!(%err, "answering with error");
        stream.write_all(&Response::error(err).encode()).await?;
        stream.write_all(err.message().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn serve_get(
        &self,
        stream: &mut BufStream<TcpStream>,
        bucket: &str,
        key: &str,
        position: u64,
        length: u64,
    ) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return self
                .send_error(stream, &Error::Unavailable("node is shutting down".to_string()))
                .await;
        };
        // Only locally held objects are served; the data plane never proxies.
        let file = match core.local_open(bucket, key) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!(bucket, key, %err, "unable to open object");
                return self.send_error(stream, &err).await;
            }
        };

        let size = file.size();
        let length = if position > size {
            0
        } else {
            (size - position).min(length)
        };
        self.request_sizes.observe(length as f64);
        let header = Response::ok(length).encode();

        if length == 0 {
            stream.write_all(&header).await?;
            stream.flush().await?;
            return Ok(());
        }

        // Sealed mappings go out as one gathered write.
        if let Ok(view) = file.file_handle().raw_view() {
            let (start, end) = (position as usize, (position + length) as usize);
            if end <= view.as_slice().len() {
                stream.write_all(&header).await?;
                stream.write_all(&view.as_slice()[start..end]).await?;
                stream.flush().await?;
                self.bytes_sent.inc_by(length);
                return Ok(());
            }
        }

        // Large reads with a raw descriptor bypass userspace entirely.
        if length >= MIN_SENDFILE_SIZE {
            if let Ok(fd) = file.file_handle().raw_fd() {
                stream.write_all(&header).await?;
                stream.flush().await?;
                sendfile_exact(stream.get_ref(), fd, position, length).await?;
                self.bytes_sent.inc_by(length);
                return Ok(());
            }
        }

        // Fallback: copy through a pooled page-aligned buffer.
        stream.write_all(&header).await?;
        let mut buffer = self.buffers.get();
        let mut sent = 0u64;
        let result = loop {
            if sent == length {
                break Ok(());
            }
            let chunk = buffer.len().min((length - sent) as usize);
            match file.read(&mut buffer[..chunk], position + sent).await {
                // The header already promised `length` bytes; a short source
                // tears down the connection instead of lying to the peer.
                Ok(0) => {
                    break Err(Error::Internal(format!(
                        "unexpected end of {} at {}",
                        file.identifier(),
                        position + sent
                    )))
                }
                Ok(n) => {
                    stream.write_all(&buffer[..n]).await?;
                    sent += n as u64;
                }
                Err(err) => break Err(err),
            }
        };
        self.buffers.put(buffer);
        result?;
        stream.flush().await?;
        self.bytes_sent.inc_by(length);
        Ok(())
    }
}

/// Transfer exactly `length` bytes of `fd` starting at `offset` through
/// `sendfile`, yielding back to the reactor on EAGAIN.
async fn sendfile_exact(stream: &TcpStream, fd: RawFd, offset: u64, length: u64) -> Result<()> {
    let mut off: libc::off_t = offset as libc::off_t;
    let mut remaining = length as usize;
    while remaining > 0 {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            // SAFETY: both descriptors outlive the call; sendfile maintains
            // `off` itself and leaves the file's own offset untouched.
            let sent = unsafe { libc::sendfile(stream.as_raw_fd(), fd, &mut off, remaining) };
            if sent < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(sent as usize)
            }
        });
        match result {
            Ok(0) => {
                return Err(Error::Internal(
                    "sendfile reached EOF before the promised length".to_string(),
                ))
            }
            Ok(sent) => remaining -= sent,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
