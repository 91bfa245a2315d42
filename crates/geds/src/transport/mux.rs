//! Multiplexed peer-to-peer transport.
//!
//! Each peer owns a set of endpoints (sockets). Requests carry a unique id
//! and are enqueued on the least-loaded open endpoint; responses arrive in
//! any order and are matched back by id, while the bytes of any single
//! request are delivered in file-offset order by the single reader task.
//! Readiness-driven TX/RX tasks replace dedicated epoll threads.

use crate::GedsCore;
use bytes::Bytes;
use geds_util::concurrent::ConcurrentMap;
use geds_util::stats::IntGauge;
use geds_util::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

pub const MSG_HEADER_SIZE: usize = 32;

/// Object names on the wire are bounded.
pub const MAX_OBJECT_NAME_LENGTH: usize = 4096;

const SEND_QUEUE_DEPTH: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const TX_CLOSED: u8 = 0x01;
const RX_CLOSED: u8 = 0x02;
const ALL_CLOSED: u8 = TX_CLOSED | RX_CLOSED;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgOp {
    GetReq = 1,
    GetReply = 2,
    InfoReq = 3,
    InfoReply = 4,
}

impl TryFrom<u8> for MsgOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::GetReq),
            2 => Ok(Self::GetReply),
            3 => Ok(Self::InfoReq),
            4 => Ok(Self::InfoReply),
            other => Err(Error::InvalidArgument(format!(
                "unsupported rpc operation {other}"
            ))),
        }
    }
}

/// Fixed 32-byte little-endian message header. `hdrlen` bytes beyond the
/// struct carry the object name; `error` is a POSIX errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub reqid: u64,
    pub datalen: u64,
    pub offset: u64,
    pub hdrlen: u16,
    pub op: MsgOp,
    pub error: u8,
}

impl MsgHeader {
    pub fn encode(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.reqid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.datalen.to_le_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_le_bytes());
        buf[24..26].copy_from_slice(&self.hdrlen.to_le_bytes());
        buf[26] = self.op as u8;
        buf[27] = self.error;
        // Bytes 28..32 are padding.
        buf
    }

    pub fn decode(buf: &[u8; MSG_HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            reqid: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
            datalen: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            offset: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
            hdrlen: u16::from_le_bytes(buf[24..26].try_into().expect("2 bytes")),
            op: MsgOp::try_from(buf[26])?,
            error: buf[27],
        };
        if (header.hdrlen as usize) < MSG_HEADER_SIZE
            || header.hdrlen as usize > MSG_HEADER_SIZE + MAX_OBJECT_NAME_LENGTH
        {
            return Err(Error::InvalidArgument(format!(
                "invalid header length {}",
                header.hdrlen
            )));
        }
        Ok(header)
    }

    pub fn name_length(&self) -> usize {
        self.hdrlen as usize - MSG_HEADER_SIZE
    }
}

struct SendWork {
    header: MsgHeader,
    name: Bytes,
    payload: Bytes,
}

impl SendWork {
    fn wire_size(&self) -> u64 {
        (MSG_HEADER_SIZE + self.name.len() + self.payload.len()) as u64
    }
}

pub struct MuxEndpoint {
    sender: Mutex<Option<mpsc::Sender<SendWork>>>,
    inflight: AtomicU64,
    closed: AtomicU8,
}

impl MuxEndpoint {
    fn is_open(&self) -> bool {
        self.closed.load(Ordering::SeqCst) == 0
    }

    fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, work: SendWork) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| Error::Unavailable("endpoint is closing".to_string()))?;
        let size = work.wire_size();
        self.inflight.fetch_add(size, Ordering::SeqCst);
        if sender.send(work).await.is_err() {
            self.inflight.fetch_sub(size, Ordering::SeqCst);
            return Err(Error::Unavailable("endpoint is closed".to_string()));
        }
        Ok(())
    }

    /// Mark one direction closed. Returns true once both directions are
    /// closed.
    fn close(&self, flag: u8) -> bool {
        // Dropping the sender drains and stops the TX task.
        *self.sender.lock() = None;
        (self.closed.fetch_or(flag, Ordering::SeqCst) | flag) == ALL_CLOSED
    }
}

pub struct MuxPeer {
    pub name: String,
    core: Weak<GedsCore>,
    transport: Weak<MuxTransport>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>,
    endpoints: RwLock<Vec<Arc<MuxEndpoint>>>,
    send_queue_depth: IntGauge,
    recv_queue_depth: IntGauge,
}

impl MuxPeer {
    fn new(name: String, core: Weak<GedsCore>, transport: Weak<MuxTransport>) -> Arc<Self> {
        Arc::new(Self {
            name,
            core,
            transport,
            next_request: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            endpoints: RwLock::new(Vec::new()),
            send_queue_depth: geds_util::stats::gauge("geds mux: send queue length"),
            recv_queue_depth: geds_util::stats::gauge("geds mux: receive queue length"),
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Lowest in-flight-bytes open endpoint, idle endpoints first.
    fn least_loaded(&self) -> Result<Arc<MuxEndpoint>> {
        let endpoints = self.endpoints.read();
        let mut best: Option<(u64, &Arc<MuxEndpoint>)> = None;
        for endpoint in endpoints.iter().filter(|ep| ep.is_open()) {
            let inflight = endpoint.inflight();
            if inflight == 0 {
                return Ok(endpoint.clone());
            }
            match best {
                Some((min, _)) if min <= inflight => {}
                _ => best = Some((inflight, endpoint)),
            }
        }
        best.map(|(_, ep)| ep.clone())
            .ok_or_else(|| Error::Unavailable(format!("no active endpoint for {}", self.name)))
    }

    /// Issue a ranged read of `name` against the peer. Bytes of the reply are
    /// delivered in offset order; distinct requests may complete out of
    /// order.
    pub async fn read(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        if name.len() > MAX_OBJECT_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "object name of {} bytes exceeds the wire limit",
                name.len()
            )));
        }
        let reqid = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(reqid, tx);
        self.recv_queue_depth.inc();

        let work = SendWork {
            header: MsgHeader {
                reqid,
                datalen: length,
                offset,
                hdrlen: (MSG_HEADER_SIZE + name.len()) as u16,
                op: MsgOp::GetReq,
                error: 0,
            },
            name: Bytes::copy_from_slice(name.as_bytes()),
            payload: Bytes::new(),
        };

        let result = async {
            let endpoint = self.least_loaded()?;
            self.send_queue_depth.inc();
            let enqueued = endpoint.enqueue(work).await;
            self.send_queue_depth.dec();
            enqueued
        }
        .await;
        if let Err(err) = result {
            self.take_pending(reqid);
            return Err(err);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Unavailable(format!(
                "connection to {} was lost",
                self.name
            ))),
            Err(_) => {
                self.take_pending(reqid);
                Err(Error::Unavailable(format!(
                    "request {reqid} to {} timed out",
                    self.name
                )))
            }
        }
    }

    fn take_pending(&self, reqid: u64) -> Option<oneshot::Sender<Result<Bytes>>> {
        let taken = self.pending.lock().remove(&reqid);
        if taken.is_some() {
            self.recv_queue_depth.dec();
        }
        taken
    }

    async fn send_reply(&self, reqid: u64, result: Result<Bytes>) {
        let (payload, error) = match result {
            Ok(payload) => (payload, 0u8),
            Err(err) => {
                tracing::debug!(peer = %self.name, reqid, %err, "answering request with error");
                (Bytes::new(), errno_for(&err))
            }
        };
        let work = SendWork {
            header: MsgHeader {
                reqid,
                datalen: payload.len() as u64,
                offset: 0,
                hdrlen: MSG_HEADER_SIZE as u16,
                op: MsgOp::GetReply,
                error,
            },
            name: Bytes::new(),
            payload,
        };
        let send = async {
            let endpoint = self.least_loaded()?;
            endpoint.enqueue(work).await
        }
        .await;
        if let Err(err) = send {
            tracing::error!(peer = %self.name, reqid, %err, "unable to send reply");
        }
    }

    /// One direction of `endpoint` closed. Once both are, the endpoint is
    /// dropped; once the peer has no endpoints left, outstanding requests
    /// fail and the peer is removed from the transport.
    fn on_endpoint_closed(&self, endpoint: &Arc<MuxEndpoint>, flag: u8) {
        if !endpoint.close(flag) {
            return;
        }
        let remaining = {
            let mut endpoints = self.endpoints.write();
            endpoints.retain(|ep| !Arc::ptr_eq(ep, endpoint));
            endpoints.len()
        };
        tracing::debug!(peer = %self.name, remaining, "endpoint closed");
        if remaining == 0 {
            let pending: Vec<_> = {
                let mut pending = self.pending.lock();
                pending.drain().collect()
            };
            for (_, tx) in pending {
                self.recv_queue_depth.dec();
                let _ = tx.send(Err(Error::Unavailable(format!(
                    "all endpoints to {} are closed",
                    self.name
                ))));
            }
            if let Some(transport) = self.transport.upgrade() {
                transport.remove_peer_if_empty(&self.name);
            }
        }
    }
}

fn errno_for(err: &Error) -> u8 {
    match err {
        Error::NotFound(_) => libc::ENOENT as u8,
        Error::PermissionDenied(_) => libc::EACCES as u8,
        Error::InvalidArgument(_) => libc::EINVAL as u8,
        Error::Unavailable(_) => libc::EAGAIN as u8,
        _ => libc::EIO as u8,
    }
}

fn error_for_errno(errno: u8) -> Error {
    match errno as i32 {
        libc::ENOENT => Error::NotFound("peer reported a missing object".to_string()),
        libc::EACCES => Error::PermissionDenied("peer denied the request".to_string()),
        libc::EINVAL => Error::InvalidArgument("peer rejected the request".to_string()),
        libc::EAGAIN => Error::Unavailable("peer is unavailable".to_string()),
        other => Error::Unknown(format!("peer reported errno {other}")),
    }
}

pub struct MuxTransport {
    core: Weak<GedsCore>,
    peers: ConcurrentMap<String, Arc<MuxPeer>>,
}

impl MuxTransport {
    pub fn new(core: Weak<GedsCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            peers: ConcurrentMap::new(),
        })
    }

    fn peer(self: &Arc<Self>, name: &str) -> Arc<MuxPeer> {
        if let Some(peer) = self.peers.get(&name.to_string()) {
            return peer;
        }
        let peer = MuxPeer::new(name.to_string(), self.core.clone(), Arc::downgrade(self));
        self.peers.insert_or_exists(name.to_string(), peer)
    }

    fn remove_peer_if_empty(&self, name: &str) {
        self.peers
            .retain(|key, peer| key != name || peer.endpoint_count() > 0);
    }

    /// Accept loop for passive endpoints: incoming sockets attach to the
    /// peer keyed by their remote address.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "mux endpoint accepted");
                    let peer = self.peer(&remote.ip().to_string());
                    attach_endpoint(&peer, stream);
                }
                Err(err) => {
                    tracing::error!(%err, "mux accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Dial `connections` sockets towards a peer's multiplex listener.
    /// Returns the existing peer when already connected.
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        connections: usize,
    ) -> Result<Arc<MuxPeer>> {
        let peer = self.peer(host);
        if peer.endpoint_count() > 0 {
            return Ok(peer);
        }
        for i in 0..connections.max(1) {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => attach_endpoint(&peer, stream),
                Err(err) if i == 0 => {
                    return Err(Error::Unavailable(format!(
                        "cannot connect to {host}:{port}: {err}"
                    )))
                }
                Err(err) => {
                    tracing::debug!(host, port, %err, "stopping endpoint fan-out early");
                    break;
                }
            }
        }
        tracing::debug!(host, endpoints = peer.endpoint_count(), "connected to peer");
        Ok(peer)
    }
}

/// Wire a socket into the peer: split it and spawn the TX and RX tasks.
fn attach_endpoint(peer: &Arc<MuxPeer>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let endpoint = Arc::new(MuxEndpoint {
        sender: Mutex::new(Some(tx)),
        inflight: AtomicU64::new(0),
        closed: AtomicU8::new(0),
    });
    peer.endpoints.write().push(endpoint.clone());

    tokio::spawn(tx_task(peer.clone(), endpoint.clone(), write_half, rx));
    tokio::spawn(rx_task(peer.clone(), endpoint, read_half));
}

async fn tx_task(
    peer: Arc<MuxPeer>,
    endpoint: Arc<MuxEndpoint>,
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<SendWork>,
) {
    while let Some(work) = queue.recv().await {
        let size = work.wire_size();
        let result = async {
            write_half.write_all(&work.header.encode()).await?;
            if !work.name.is_empty() {
                write_half.write_all(&work.name).await?;
            }
            if !work.payload.is_empty() {
                write_half.write_all(&work.payload).await?;
            }
            std::io::Result::Ok(())
        }
        .await;
        endpoint.inflight.fetch_sub(size, Ordering::SeqCst);
        if let Err(err) = result {
            tracing::debug!(peer = %peer.name, %err, "send failed");
            break;
        }
    }
    peer.on_endpoint_closed(&endpoint, TX_CLOSED);
}

async fn rx_task(peer: Arc<MuxPeer>, endpoint: Arc<MuxEndpoint>, mut read_half: OwnedReadHalf) {
    loop {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        if read_half.read_exact(&mut buf).await.is_err() {
            break;
        }
        let header = match MsgHeader::decode(&buf) {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(peer = %peer.name, %err, "protocol failure");
                break;
            }
        };
        let mut name = vec![0u8; header.name_length()];
        if !name.is_empty() && read_half.read_exact(&mut name).await.is_err() {
            break;
        }

        match header.op {
            MsgOp::GetReq => {
                let name = String::from_utf8_lossy(&name).into_owned();
                tokio::spawn(serve_request(peer.clone(), header, name));
            }
            MsgOp::GetReply => {
                let pending = peer.take_pending(header.reqid);
                if header.error != 0 {
                    // No payload accompanies an error reply.
                    if let Some(tx) = pending {
                        let _ = tx.send(Err(error_for_errno(header.error)));
                    }
                    continue;
                }
                let mut payload = vec![0u8; header.datalen as usize];
                if read_half.read_exact(&mut payload).await.is_err() {
                    if let Some(tx) = pending {
                        let _ = tx.send(Err(Error::Unavailable(
                            "connection failed mid-reply".to_string(),
                        )));
                    }
                    break;
                }
                match pending {
                    Some(tx) => {
                        let _ = tx.send(Ok(Bytes::from(payload)));
                    }
                    None => {
                        tracing::error!(
                            peer = %peer.name,
                            reqid = header.reqid,
                            "no corresponding receive for reply"
                        );
                    }
                }
            }
            MsgOp::InfoReq | MsgOp::InfoReply => {
                tracing::error!(peer = %peer.name, op = ?header.op, "unsupported rpc operation");
                break;
            }
        }
    }
    peer.on_endpoint_closed(&endpoint, RX_CLOSED);
}

/// Server side of a GET: open the object locally, read the requested range,
/// and send the reply over the least-loaded endpoint.
async fn serve_request(peer: Arc<MuxPeer>, header: MsgHeader, name: String) {
    let result: Result<Bytes> = async {
        let core = peer
            .core
            .upgrade()
            .ok_or_else(|| Error::Unavailable("node is shutting down".to_string()))?;
        let (bucket, key) = name.split_once('/').ok_or_else(|| {
            Error::InvalidArgument(format!("invalid object name '{name}'"))
        })?;
        let file = core.local_open(bucket, key)?;
        let size = file.size();
        let length = if header.offset > size {
            0
        } else {
            (size - header.offset).min(header.datalen)
        };
        let mut buf = vec![0u8; length as usize];
        let n = file.read(&mut buf, header.offset).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
    .await;
    peer.send_reply(header.reqid, result).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MsgHeader {
            reqid: 7,
            datalen: 1 << 30,
            offset: 4096,
            hdrlen: (MSG_HEADER_SIZE + 11) as u16,
            op: MsgOp::GetReq,
            error: 0,
        };
        let encoded = header.encode();
        assert_eq!(MsgHeader::decode(&encoded).unwrap(), header);
        assert_eq!(header.name_length(), 11);
    }

    #[test]
    fn header_is_little_endian_on_the_wire() {
        let header = MsgHeader {
            reqid: 0x0102030405060708,
            datalen: 1,
            offset: 2,
            hdrlen: MSG_HEADER_SIZE as u16,
            op: MsgOp::GetReply,
            error: 5,
        };
        let encoded = header.encode();
        assert_eq!(encoded[0], 0x08);
        assert_eq!(encoded[7], 0x01);
        assert_eq!(encoded[24], MSG_HEADER_SIZE as u8);
        assert_eq!(encoded[26], 2);
        assert_eq!(encoded[27], 5);
        assert_eq!(&encoded[28..], &[0, 0, 0, 0]);
    }

    #[test]
    fn decode_rejects_bad_headers() {
        let mut buf = MsgHeader {
            reqid: 1,
            datalen: 0,
            offset: 0,
            hdrlen: MSG_HEADER_SIZE as u16,
            op: MsgOp::GetReq,
            error: 0,
        }
        .encode();

        // Unsupported op.
        buf[26] = 9;
        assert!(MsgHeader::decode(&buf).is_err());
        buf[26] = MsgOp::GetReq as u8;

        // Header length below the fixed size.
        buf[24..26].copy_from_slice(&8u16.to_le_bytes());
        assert!(MsgHeader::decode(&buf).is_err());
    }

    #[test]
    fn errno_mapping_round_trips_the_kind() {
        let err = Error::NotFound("x".to_string());
        assert!(error_for_errno(errno_for(&err)).is_not_found());
        assert!(matches!(
            error_for_errno(errno_for(&Error::PermissionDenied("x".to_string()))),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            error_for_errno(errno_for(&Error::Internal("x".to_string()))),
            Error::Unknown(_)
        ));
    }
}
