//! One framed TCP connection with acknowledged message exchange.
//!
//! A [`Connection`] is a cheap clonable handle. Each established link runs a
//! receive loop that decodes incoming envelopes, queues decoded messages and
//! answers them with an acknowledgement, plus a small writer task that sends
//! those acknowledgements so the loop never blocks on the socket.
//!
//! Outgoing frames share one FIFO write slot per link: `emit` callers are
//! served in arrival order and at most one frame is written at a time.

use crate::error::SessionError;
use crate::options::ProtocolOptions;
use crate::transport::connect_tcp;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mesh_wire::{read_chunk, write_chunk, Envelope, Message, PackReader, WireError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side created the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Dialled out with [`Connection::connect`]; may reconnect
    Client,
    /// Accepted by a server; discarded once closed
    Server,
}

/// A decoded message taken from an incoming queue
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Connection the message arrived on
    pub connection: Connection,
    /// Decoded message
    pub message: Arc<dyn Message>,
    /// Local receive time
    pub received_at: DateTime<Utc>,
    /// Generation of the link the message arrived on
    pub link: u64,
}

impl IncomingMessage {
    /// Borrow the message as a `T` if it is one
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }
}

/// Outcome of a successful emit
#[derive(Debug, Clone)]
pub struct EmitResult {
    /// Remote address the message was delivered to
    pub destination: SocketAddr,
    /// Time the acknowledgement was received
    pub timestamp: DateTime<Utc>,
    /// The message that was sent
    pub message: Arc<dyn Message>,
}

/// Link lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link was established
    Connected {
        /// Connection id
        id: ConnectionId,
        /// Remote address
        remote: SocketAddr,
    },
    /// The link ended; raised once per link
    Disconnected {
        /// Connection id
        id: ConnectionId,
        /// Remote address
        remote: SocketAddr,
    },
}

/// Snapshot of per-connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Message frames written
    pub frames_sent: u64,
    /// Frames read of any kind
    pub frames_received: u64,
    /// Positive acknowledgements written
    pub acks_sent: u64,
    /// Negative acknowledgements written
    pub nacks_sent: u64,
    /// Highest number of simultaneous frame writers observed
    pub peak_concurrent_writes: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    acks_sent: AtomicU64,
    nacks_sent: AtomicU64,
    active_writers: AtomicUsize,
    peak_writers: AtomicUsize,
}

#[derive(Clone)]
struct Link {
    writer: Writer,
    remote: SocketAddr,
    cancel: CancellationToken,
    generation: u64,
}

/// A link whose transport is installed but whose receive loop is not running yet
pub(crate) struct Installed {
    reader: OwnedReadHalf,
    writer: Writer,
    cancel: CancellationToken,
    generation: u64,
}

struct Shared {
    id: ConnectionId,
    mode: ConnectionMode,
    options: Arc<ProtocolOptions>,
    queue_tx: mpsc::Sender<IncomingMessage>,
    private_rx: Option<tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>>,
    link: Mutex<Option<Link>>,
    last_remote: Mutex<Option<SocketAddr>>,
    connected: AtomicBool,
    generation: AtomicU64,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
    state: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    events: broadcast::Sender<ConnectionEvent>,
    stats: StatCounters,
}

/// Handle to one framed connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a client connection with its own incoming queue
    pub fn new(options: Arc<ProtocolOptions>) -> Self {
        Self::build(options, ConnectionMode::Client, None)
    }

    /// Create a client connection that feeds a caller-owned queue
    pub fn with_queue(options: Arc<ProtocolOptions>, queue: mpsc::Sender<IncomingMessage>) -> Self {
        Self::build(options, ConnectionMode::Client, Some(queue))
    }

    pub(crate) fn server(options: Arc<ProtocolOptions>, queue: Option<mpsc::Sender<IncomingMessage>>) -> Self {
        Self::build(options, ConnectionMode::Server, queue)
    }

    fn build(
        options: Arc<ProtocolOptions>,
        mode: ConnectionMode,
        queue: Option<mpsc::Sender<IncomingMessage>>,
    ) -> Self {
        let (queue_tx, private_rx) = match queue {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(options.queue_capacity);
                (tx, Some(tokio::sync::Mutex::new(rx)))
            }
        };
        let (events, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                mode,
                options,
                queue_tx,
                private_rx,
                link: Mutex::new(None),
                last_remote: Mutex::new(None),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                state: RwLock::new(None),
                events,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Client or server mode
    pub fn mode(&self) -> ConnectionMode {
        self.shared.mode
    }

    /// Protocol options in effect
    pub fn options(&self) -> &Arc<ProtocolOptions> {
        &self.shared.options
    }

    /// Whether a link is currently established
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Generation of the current link, if any; every new link gets a higher one
    pub fn link_generation(&self) -> Option<u64> {
        lock(&self.shared.link).as_ref().map(|link| link.generation)
    }

    /// Remote address of the current or most recent link
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.last_remote)
    }

    /// Subscribe to link lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Counter snapshot
    pub fn stats(&self) -> ConnectionStats {
        let stats = &self.shared.stats;
        ConnectionStats {
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            acks_sent: stats.acks_sent.load(Ordering::Relaxed),
            nacks_sent: stats.nacks_sent.load(Ordering::Relaxed),
            peak_concurrent_writes: stats.peak_writers.load(Ordering::Relaxed),
        }
    }

    /// Attach user state to this connection, replacing any previous value
    pub fn set_state<T: Any + Send + Sync>(&self, state: Arc<T>) {
        let mut slot = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(state);
    }

    /// Attached user state if it is a `T`
    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.shared.state.read().unwrap_or_else(PoisonError::into_inner);
        slot.clone().and_then(|state| state.downcast::<T>().ok())
    }

    /// Detach user state
    pub fn clear_state(&self) {
        let mut slot = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// Dial `addr` and start the receive loop.
    ///
    /// Returns `Ok(false)` if the stream could not be opened within
    /// `timeout`. Fails with [`SessionError::AlreadyConnected`] if a link is
    /// already up.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<bool, SessionError> {
        if self.shared.mode == ConnectionMode::Server {
            return Err(SessionError::ServerMode);
        }
        if self.is_connected() {
            return Err(SessionError::AlreadyConnected);
        }

        let stream = match connect_tcp(addr, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{} failed to connect to {}: {}", self.shared.id, addr, e);
                return Ok(false);
            }
        };

        let installed = self.install(stream)?;
        self.start_receiving(installed);
        Ok(true)
    }

    /// Install a stream as the current link without starting the receive loop
    pub(crate) fn install(&self, stream: TcpStream) -> Result<Installed, SessionError> {
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
        let cancel = CancellationToken::new();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut slot = lock(&self.shared.link);
            if slot.is_some() {
                return Err(SessionError::AlreadyConnected);
            }
            *slot = Some(Link {
                writer: writer.clone(),
                remote,
                cancel: cancel.clone(),
                generation,
            });
        }
        *lock(&self.shared.last_remote) = Some(remote);
        self.shared.connected.store(true, Ordering::SeqCst);

        info!("{} connected to {} ({:?} mode)", self.shared.id, remote, self.shared.mode);
        let _ = self.shared.events.send(ConnectionEvent::Connected {
            id: self.shared.id,
            remote,
        });

        Ok(Installed {
            reader,
            writer,
            cancel,
            generation,
        })
    }

    /// Spawn the receive loop and acknowledgement writer for an installed link
    pub(crate) fn start_receiving(&self, installed: Installed) {
        let Installed {
            reader,
            writer,
            cancel,
            generation,
        } = installed;
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        tokio::spawn(self.clone().ack_writer(writer, ack_rx, cancel.clone()));

        let connection = self.clone();
        tokio::spawn(async move {
            connection.receive_loop(reader, ack_tx, cancel, generation).await;
            connection.finish(generation);
        });
    }

    async fn receive_loop(
        &self,
        mut reader: OwnedReadHalf,
        acks: mpsc::UnboundedSender<(Bytes, bool)>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let options = self.shared.options.clone();
        let config = options.pack_config();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = read_chunk(&mut reader, options.max_chunk_size) => chunk,
            };

            let payload = match chunk {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!("{} stream closed by remote", self.shared.id);
                    break;
                }
                Err(WireError::Size(len)) => {
                    warn!("{} chunk of {} bytes exceeds limit, closing", self.shared.id, len);
                    break;
                }
                Err(e) => {
                    debug!("{} read failed: {}", self.shared.id, e);
                    break;
                }
            };
            self.shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);

            match Envelope::decode(payload, config) {
                Ok(Envelope::Message {
                    corr_id,
                    type_name,
                    body,
                }) => {
                    let accepted = self.accept_message(&type_name, body, generation);
                    trace!("{} received '{}' {} (accepted: {})", self.shared.id, type_name, corr_id, accepted);
                    if acks.send((Envelope::encode_ack(corr_id, accepted, config), accepted)).is_err() {
                        break;
                    }
                }
                Ok(Envelope::Ack { corr_id, success }) => self.resolve_ack(corr_id, success),
                Err(e) => {
                    warn!("{} malformed envelope, closing: {}", self.shared.id, e);
                    break;
                }
            }
        }
    }

    fn accept_message(&self, type_name: &str, body: Bytes, generation: u64) -> bool {
        let options = &self.shared.options;
        let mut reader = PackReader::new(body, options.pack_config());
        let message = match options.registry.decode(type_name, &mut reader) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} rejecting '{}': {}", self.shared.id, type_name, e);
                return false;
            }
        };

        let incoming = IncomingMessage {
            connection: self.clone(),
            message,
            received_at: Utc::now(),
            link: generation,
        };
        match self.shared.queue_tx.try_send(incoming) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("{} incoming queue full, rejecting '{}'", self.shared.id, type_name);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} incoming queue closed, rejecting '{}'", self.shared.id, type_name);
                false
            }
        }
    }

    fn resolve_ack(&self, corr_id: Uuid, success: bool) {
        let waiter = lock(&self.shared.pending).remove(&corr_id);
        match waiter {
            // oneshot send never blocks, so the waiter resumes on its own task
            Some(waiter) => {
                let _ = waiter.send(success);
            }
            None => trace!("{} dropping unmatched ack {}", self.shared.id, corr_id),
        }
    }

    async fn ack_writer(
        self,
        writer: Writer,
        mut acks: mpsc::UnboundedReceiver<(Bytes, bool)>,
        cancel: CancellationToken,
    ) {
        loop {
            let (frame, success) = tokio::select! {
                _ = cancel.cancelled() => break,
                next = acks.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let mut guard = writer.lock().await;
            if let Err(e) = self.write_frame(&mut guard, &frame).await {
                debug!("{} failed to write ack: {}", self.shared.id, e);
                break;
            }
            let counter = if success {
                &self.shared.stats.acks_sent
            } else {
                &self.shared.stats.nacks_sent
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), WireError> {
        let stats = &self.shared.stats;
        let active = stats.active_writers.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_writers.fetch_max(active, Ordering::SeqCst);
        let result = write_chunk(writer, payload).await;
        stats.active_writers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn current_link(&self) -> Option<Link> {
        lock(&self.shared.link).clone()
    }

    /// Send a message and wait for its acknowledgement
    pub async fn emit<M: Message>(&self, message: M, timeout: Duration) -> Result<EmitResult, SessionError> {
        self.emit_shared(Arc::new(message), timeout).await
    }

    /// Send an already shared message and wait for its acknowledgement.
    ///
    /// `timeout` bounds the whole operation: waiting for the write slot,
    /// writing and waiting for the acknowledgement. Once a frame has started
    /// being written it is always finished, even if the caller gives up.
    /// A frame that was written keeps its correlation slot until the
    /// acknowledgement arrives or the link is torn down.
    pub async fn emit_shared(
        &self,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> Result<EmitResult, SessionError> {
        let link = self.current_link().ok_or(SessionError::NotConnected)?;
        let options = &self.shared.options;
        let corr_id = Uuid::new_v4();
        let frame = Envelope::encode_message(corr_id, message.as_ref(), &options.registry, options.pack_config())?;
        let deadline = Instant::now() + timeout;

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.shared.pending).insert(corr_id, ack_tx);
        if link.cancel.is_cancelled() {
            lock(&self.shared.pending).remove(&corr_id);
            return Err(SessionError::ConnectionLost);
        }

        let guard = match tokio::time::timeout_at(deadline, link.writer.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                lock(&self.shared.pending).remove(&corr_id);
                return Err(SessionError::Timeout);
            }
        };

        let connection = self.clone();
        let write = tokio::spawn(async move {
            let mut guard = guard;
            connection.write_frame(&mut guard, &frame).await
        });

        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(Ok(()))) => {
                self.shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                trace!("{} sent {} to {}", self.shared.id, corr_id, link.remote);
            }
            Ok(Ok(Err(e))) => {
                lock(&self.shared.pending).remove(&corr_id);
                debug!("{} write to {} failed: {}", self.shared.id, link.remote, e);
                self.finish(link.generation);
                return Err(e.into());
            }
            Ok(Err(_)) => {
                lock(&self.shared.pending).remove(&corr_id);
                return Err(SessionError::ConnectionLost);
            }
            Err(_) => return Err(SessionError::Timeout),
        }

        match tokio::time::timeout_at(deadline, ack_rx).await {
            Ok(Ok(true)) => Ok(EmitResult {
                destination: link.remote,
                timestamp: Utc::now(),
                message,
            }),
            Ok(Ok(false)) => Err(SessionError::Rejected),
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Take the next message from this connection's own queue
    pub async fn wait(&self, timeout: Duration) -> Result<IncomingMessage, SessionError> {
        let queue = self
            .shared
            .private_rx
            .as_ref()
            .ok_or(SessionError::SharedQueueUnavailable)?;

        let deadline = Instant::now() + timeout;
        let mut rx = tokio::time::timeout_at(deadline, queue.lock())
            .await
            .map_err(|_| SessionError::Timeout)?;
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(SessionError::QueueClosed),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Resolves once the current link ends; immediately if there is none
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = lock(&self.shared.link).as_ref().map(|link| link.cancel.clone());
        async move {
            if let Some(token) = token {
                token.cancelled().await;
            }
        }
    }

    /// Close the link, fail pending emits and raise `Disconnected` once
    pub async fn disconnect(&self) {
        let link = lock(&self.shared.link).take();
        if let Some(link) = link {
            if let Ok(mut writer) = link.writer.try_lock() {
                let _ = writer.shutdown().await;
            }
            self.teardown(link);
        }
    }

    fn finish(&self, generation: u64) {
        let link = {
            let mut slot = lock(&self.shared.link);
            match slot.as_ref() {
                Some(link) if link.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(link) = link {
            self.teardown(link);
        }
    }

    fn teardown(&self, link: Link) {
        self.shared.connected.store(false, Ordering::SeqCst);
        link.cancel.cancel();

        let abandoned: Vec<_> = lock(&self.shared.pending).drain().collect();
        if !abandoned.is_empty() {
            debug!("{} failing {} pending emits", self.shared.id, abandoned.len());
        }
        drop(abandoned);

        info!("{} disconnected from {}", self.shared.id, link.remote);
        let _ = self.shared.events.send(ConnectionEvent::Disconnected {
            id: self.shared.id,
            remote: link.remote,
        });
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("connected", &self.is_connected())
            .field("remote", &self.remote_addr())
            .finish()
    }
}
