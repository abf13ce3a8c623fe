//! Per-client connection
//!
//! A [`Connection`] is the shared handle other components use to reach a
//! client: it holds the bounded outbound queue, the cancellation signal and
//! the session attributes. The transport itself is owned by three tasks:
//!
//! - the inbound loop (the accepting task) reads frames, decodes them and
//!   hands them to the dispatcher;
//! - the writer task drains the outbound queue onto the socket and is the
//!   only code that writes to it;
//! - the keep-alive supervisor fires the cancellation signal when no frame
//!   arrives within the configured period.
//!
//! Whichever task notices a failure fires the signal; the inbound loop then
//! runs teardown exactly once.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{Request, Shared};
use crate::codec::{FrameReader, PacketDecoder, PacketEncoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, EncodeError, FrameError, Packet, PacketType,
    ProtocolError, ProtocolVersion, ReasonCode,
};

/// How long teardown waits for the writer to flush queued frames
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a takeover waits for the replaced connection's teardown
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection ended
#[derive(Debug)]
pub enum ConnectionError {
    /// Raw framing failed; closed without a response
    Frame(FrameError),
    /// Well-framed but invalid packet
    Protocol(ProtocolError),
    /// Runtime protocol rule broken by the peer
    Violation(&'static str),
    /// Socket read or write failed
    Transport(io::Error),
    /// Connection is closed or closing
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Violation(rule) => write!(f, "protocol violation: {}", rule),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Transport(e),
            other => Self::Frame(other),
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        Self::Protocol(e.into())
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        Self::Protocol(e.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<SendError> for ConnectionError {
    fn from(_: SendError) -> Self {
        Self::Closed
    }
}

/// Enqueue onto a connection that is closed or closing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection is closed")
    }
}

impl std::error::Error for SendError {}

/// Shared handle to one client connection
pub struct Connection {
    id: u64,
    addr: SocketAddr,
    client_id: OnceLock<Arc<str>>,
    version: OnceLock<ProtocolVersion>,
    clean_start: AtomicBool,
    closed: AtomicBool,
    outbound: mpsc::Sender<Bytes>,
    cancel: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    activity: Notify,
    attributes: RwLock<HashMap<String, String>>,
}

impl Connection {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(id: u64, addr: SocketAddr, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (cancel, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            addr,
            client_id: OnceLock::new(),
            version: OnceLock::new(),
            clean_start: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            outbound,
            cancel,
            finished,
            activity: Notify::new(),
            attributes: RwLock::new(HashMap::new()),
        });
        (conn, rx)
    }

    /// Broker-unique connection number
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client identifier, set once CONNECT is accepted
    pub fn client_id(&self) -> Option<&Arc<str>> {
        self.client_id.get()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version.get().copied().unwrap_or_default()
    }

    pub fn clean_start(&self) -> bool {
        self.clean_start.load(Ordering::Acquire)
    }

    /// Assign the client identity. Only the first call has any effect.
    pub fn bind(&self, client_id: Arc<str>, version: ProtocolVersion, clean_start: bool) -> bool {
        if self.client_id.set(client_id).is_err() {
            return false;
        }
        let _ = self.version.set(version);
        self.clean_start.store(clean_start, Ordering::Release);
        true
    }

    pub fn is_bound(&self) -> bool {
        self.client_id.get().is_some()
    }

    /// Enqueue pre-encoded bytes, waiting while the queue is full
    pub async fn send(&self, bytes: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError);
        }
        self.outbound.send(bytes).await.map_err(|_| SendError)
    }

    /// Encode `packet` for this client's protocol version and enqueue it
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        let bytes = PacketEncoder::new(self.protocol_version()).to_bytes(packet)?;
        self.send(bytes).await?;
        Ok(())
    }

    /// Fire the cancellation signal. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.send_replace(true) {
            debug!("stopping connection {} ({})", self.id, self.addr);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Whether teardown has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once teardown has released everything the client held
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn touch(&self) {
        self.activity.notify_one();
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.write().insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.read().get(key).cloned()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<String> {
        self.attributes.write().remove(key)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("client_id", &self.client_id.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Handshake {
    Bound,
    Refused(ReasonCode),
}

/// Drive one accepted transport from CONNECT to teardown
pub(crate) async fn serve(stream: TcpStream, addr: SocketAddr, conn_id: u64, shared: Arc<Shared>) {
    let config = &shared.config;
    if let Err(e) = stream.set_nodelay(true) {
        trace!("set_nodelay failed for {}: {}", addr, e);
    }
    let (read_half, write_half) = stream.into_split();
    let (conn, outbound) = Connection::new(conn_id, addr, config.outbound_queue_capacity);
    let writer = tokio::spawn(write_loop(write_half, outbound, conn.clone()));

    let mut reader = FrameReader::new(read_half, config.max_packet_size);
    let mut decoder = PacketDecoder::new();

    let outcome = tokio::select! {
        _ = conn.cancelled() => Err(ConnectionError::Closed),
        result = timeout(config.connect_timeout, handshake(&conn, &mut reader, &mut decoder, &shared)) => {
            result.unwrap_or_else(|_| {
                debug!("no CONNECT from {} within {:?}", addr, config.connect_timeout);
                Err(ConnectionError::Closed)
            })
        }
    };

    match outcome {
        Ok(Handshake::Bound) => {
            let supervisor = tokio::spawn(keep_alive(conn.clone(), config.keep_alive));
            let result = read_loop(&conn, &mut reader, &mut decoder, &shared).await;
            report_read_error(&conn, result).await;
            conn.stop();
            let _ = supervisor.await;
        }
        Ok(Handshake::Refused(code)) => {
            info!("refused connection from {}: {}", addr, code);
        }
        Err(e) => debug!("handshake with {} failed: {}", addr, e),
    }

    teardown(&conn, &shared, writer).await;
}

/// Read and validate CONNECT, then bind and register the connection
async fn handshake(
    conn: &Arc<Connection>,
    reader: &mut FrameReader<OwnedReadHalf>,
    decoder: &mut PacketDecoder,
    shared: &Shared,
) -> Result<Handshake, ConnectionError> {
    let frame = reader.read_frame().await?.ok_or(ConnectionError::Closed)?;
    if frame.packet_type() != Some(PacketType::Connect) {
        return Err(ConnectionError::Violation("first packet must be CONNECT"));
    }

    let connect = match decoder.decode_frame(&frame) {
        Ok(Packet::Connect(connect)) => connect,
        Ok(_) => return Err(ConnectionError::Violation("first packet must be CONNECT")),
        Err(DecodeError::ConnectRejected(code)) => {
            refuse(conn, decoder.version().unwrap_or_default(), code).await;
            return Ok(Handshake::Refused(code));
        }
        Err(e) => return Err(e.into()),
    };
    let version = connect.protocol_version;

    let code = shared.verifier().verify(&connect).await;
    if !code.is_success() {
        refuse(conn, version, code).await;
        return Ok(Handshake::Refused(code));
    }

    let registry = &shared.connections;
    if !registry.contains(&connect.client_id) && registry.len() >= shared.config.max_connections {
        warn!(
            "connection limit {} reached, refusing {}",
            shared.config.max_connections, connect.client_id
        );
        refuse(conn, version, ReasonCode::ServerUnavailable).await;
        return Ok(Handshake::Refused(ReasonCode::ServerUnavailable));
    }

    bind(conn, *connect, shared).await?;
    Ok(Handshake::Bound)
}

async fn bind(conn: &Arc<Connection>, connect: Connect, shared: &Shared) -> Result<(), ConnectionError> {
    let client_id: Arc<str> = Arc::from(connect.client_id.as_str());
    conn.bind(client_id.clone(), connect.protocol_version, connect.clean_start);

    if let Some(old) = shared.connections.get(&client_id) {
        info!("{} taken over by a new connection from {}", client_id, conn.addr());
        old.stop();
        if timeout(TAKEOVER_TIMEOUT, old.finished()).await.is_err() {
            warn!("replaced connection of {} did not finish teardown in time", client_id);
        }
    }
    // A clean start never inherits subscriptions or unreleased QoS 2 ids
    if connect.clean_start {
        shared.topics.release_qos2_ids(&client_id);
        shared.topics.unsubscribe_all(&client_id);
    }

    conn.send_packet(&Packet::ConnAck(ConnAck::new(ReasonCode::Success)))
        .await?;

    if let Some(old) = shared.connections.insert(client_id.clone(), conn.clone()) {
        old.stop();
    }
    if let Some(will) = connect.will {
        shared.topics.set_will(&client_id, conn.id(), will);
    }

    info!(
        "{} connected from {} ({:?}, keep-alive {}s)",
        client_id,
        conn.addr(),
        connect.protocol_version,
        connect.keep_alive
    );
    Ok(())
}

/// Answer a refused CONNECT with exactly one CONNACK, then close
async fn refuse(conn: &Connection, version: ProtocolVersion, code: ReasonCode) {
    match PacketEncoder::new(version).to_bytes(&Packet::ConnAck(ConnAck::new(code))) {
        Ok(bytes) => {
            let _ = conn.send(bytes).await;
        }
        Err(e) => debug!("cannot encode CONNACK: {}", e),
    }
    conn.stop();
}

async fn read_loop(
    conn: &Arc<Connection>,
    reader: &mut FrameReader<OwnedReadHalf>,
    decoder: &mut PacketDecoder,
    shared: &Shared,
) -> Result<(), ConnectionError> {
    loop {
        let frame = tokio::select! {
            _ = conn.cancelled() => return Ok(()),
            frame = reader.read_frame() => frame?,
        };
        let Some(frame) = frame else {
            return Err(ConnectionError::Closed);
        };
        conn.touch();

        let packet = decoder.decode_frame(&frame)?;
        trace!("{:?} from {}", packet.packet_type(), conn.addr());
        shared.dispatcher.dispatch(Request::new(conn.clone(), packet)).await;
    }
}

/// Log why the inbound loop ended. A 5.0 client that sent an invalid packet
/// gets a DISCONNECT with the reason before the transport closes.
async fn report_read_error(conn: &Connection, result: Result<(), ConnectionError>) {
    match result {
        Ok(()) => {}
        Err(ConnectionError::Closed) => debug!("peer {} closed the transport", conn.addr()),
        Err(ConnectionError::Protocol(ProtocolError::Decode(e))) => {
            debug!("invalid packet from {}: {}", conn.addr(), e);
            if conn.protocol_version() == ProtocolVersion::V5 {
                let disconnect = Packet::Disconnect(Disconnect {
                    reason_code: e.reason_code(),
                    ..Default::default()
                });
                let _ = conn.send_packet(&disconnect).await;
            }
        }
        Err(e) => debug!("connection {} failed: {}", conn.addr(), e),
    }
}

/// Sole writer to the socket. Drains whatever is queued before observing
/// cancellation, then shuts the write half down.
async fn write_loop(mut stream: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, conn: Arc<Connection>) {
    loop {
        tokio::select! {
            biased;
            bytes = rx.recv() => {
                let Some(bytes) = bytes else { break };
                if let Err(e) = stream.write_all(&bytes).await {
                    debug!("write to {} failed: {}", conn.addr(), e);
                    conn.stop();
                    break;
                }
            }
            _ = conn.cancelled() => break,
        }
    }
    drop(rx);
    let _ = stream.shutdown().await;
}

/// Cancel the connection when no frame arrives for `period`. Zero disables.
async fn keep_alive(conn: Arc<Connection>, period: Duration) {
    if period.is_zero() {
        conn.cancelled().await;
        return;
    }
    loop {
        tokio::select! {
            _ = conn.cancelled() => return,
            _ = conn.activity.notified() => continue,
            _ = tokio::time::sleep(period) => {
                info!(
                    "keep-alive of {:?} expired for {}",
                    period,
                    conn.client_id().map(|id| id.as_ref()).unwrap_or("-")
                );
                conn.stop();
                return;
            }
        }
    }
}

/// Exactly-once cleanup: close the queue and transport, publish the will,
/// then release everything the client held in the registries.
async fn teardown(conn: &Arc<Connection>, shared: &Shared, writer: JoinHandle<()>) {
    if conn.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    release(conn, shared, writer).await;
    conn.finished.send_replace(true);
}

async fn release(conn: &Arc<Connection>, shared: &Shared, mut writer: JoinHandle<()>) {
    conn.stop();
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("writer for {} did not drain in time", conn.addr());
        writer.abort();
    }

    let Some(client_id) = conn.client_id().cloned() else {
        debug!("closed unbound connection from {}", conn.addr());
        return;
    };

    // Requests already queued for this client run before the will decision
    shared.dispatcher.flush(&client_id).await;
    let will_sent = shared.topics.send_client_will(&client_id, conn.id()).await;

    if shared.connections.remove_if_current(&client_id, conn.id()) {
        let released = shared.topics.release_qos2_ids(&client_id);
        if released > 0 {
            debug!("released {} QoS 2 identifiers of {}", released, client_id);
        }
        if conn.clean_start() {
            shared.topics.unsubscribe_all(&client_id);
        }
    }

    info!(
        "{} disconnected from {}{}",
        client_id,
        conn.addr(),
        if will_sent { ", will published" } else { "" }
    );
}
