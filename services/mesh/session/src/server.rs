//! Listener that promotes accepted streams into server-mode connections.
//!
//! The server tracks its active connections for broadcast and feeds their
//! decoded messages into one of three queue arrangements:
//!
//! - a server-owned shared queue drained with [`Server::wait`]
//! - a caller-owned sink ([`Server::with_sink`])
//! - a private queue per connection ([`Server::per_connection`])

use crate::connection::{lock, Connection, ConnectionId, IncomingMessage};
use crate::error::SessionError;
use crate::options::ProtocolOptions;
use crate::transport::listen_tcp;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mesh_wire::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called for every accepted connection after its transport is installed
/// and before its receive loop starts
pub trait AcceptHook: Send + Sync {
    /// Inspect or decorate a freshly accepted connection
    fn accepted(&self, connection: &Connection);
}

impl<F> AcceptHook for F
where
    F: Fn(&Connection) + Send + Sync,
{
    fn accepted(&self, connection: &Connection) {
        self(connection)
    }
}

/// Active-set notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection was accepted
    Connected {
        /// Connection id
        id: ConnectionId,
        /// Remote address
        remote: SocketAddr,
    },
    /// An accepted connection closed and left the active set
    Disconnected {
        /// Connection id
        id: ConnectionId,
        /// Remote address
        remote: Option<SocketAddr>,
    },
}

/// Outcome of a broadcast
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    /// Time the broadcast started
    pub timestamp: DateTime<Utc>,
    /// Connections that acknowledged the message
    pub destinations: Vec<Connection>,
}

enum QueueMode {
    Shared {
        tx: Mutex<mpsc::Sender<IncomingMessage>>,
        rx: tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>,
    },
    Sink(mpsc::Sender<IncomingMessage>),
    PerConnection,
}

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ServerInner {
    options: Arc<ProtocolOptions>,
    queue: QueueMode,
    hook: RwLock<Option<Arc<dyn AcceptHook>>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    events: broadcast::Sender<ServerEvent>,
    running: Mutex<Option<Running>>,
}

/// TCP listener with connection tracking and broadcast
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server whose connections share one server-owned queue
    pub fn new(options: Arc<ProtocolOptions>) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity);
        Self::build(
            options,
            QueueMode::Shared {
                tx: Mutex::new(tx),
                rx: tokio::sync::Mutex::new(rx),
            },
        )
    }

    /// Server whose connections feed a caller-owned queue
    pub fn with_sink(options: Arc<ProtocolOptions>, sink: mpsc::Sender<IncomingMessage>) -> Self {
        Self::build(options, QueueMode::Sink(sink))
    }

    /// Server whose connections each own a private queue
    pub fn per_connection(options: Arc<ProtocolOptions>) -> Self {
        Self::build(options, QueueMode::PerConnection)
    }

    fn build(options: Arc<ProtocolOptions>, queue: QueueMode) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ServerInner {
                options,
                queue,
                hook: RwLock::new(None),
                connections: Mutex::new(HashMap::new()),
                events,
                running: Mutex::new(None),
            }),
        }
    }

    /// Register the accept hook
    pub fn with_accept_hook(self, hook: Arc<dyn AcceptHook>) -> Self {
        *self.inner.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
        self
    }

    /// Protocol options in effect
    pub fn options(&self) -> &Arc<ProtocolOptions> {
        &self.inner.options
    }

    /// Bind `addr` and start accepting; returns the bound address.
    ///
    /// A stopped server may be started again. Its shared queue is then
    /// replaced by a fresh one and anything left in the old queue is dropped.
    pub fn start(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr, SessionError> {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        self.reopen_queue()?;
        let listener = listen_tcp(addr, backlog)?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(self.inner.clone(), listener, cancel.clone()));

        *running = Some(Running {
            cancel,
            accept_task,
            local_addr,
        });
        info!("Mesh listener started on {}", local_addr);
        Ok(local_addr)
    }

    fn reopen_queue(&self) -> Result<(), SessionError> {
        let QueueMode::Shared { tx, rx } = &self.inner.queue else {
            return Ok(());
        };
        let mut tx = lock(tx);
        if !tx.is_closed() {
            return Ok(());
        }
        let mut rx = rx.try_lock().map_err(|_| SessionError::QueueBusy)?;
        let (fresh_tx, fresh_rx) = mpsc::channel(self.inner.options.queue_capacity);
        *tx = fresh_tx;
        *rx = fresh_rx;
        debug!("Shared queue reopened");
        Ok(())
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.running).as_ref().map(|running| running.local_addr)
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Stop accepting and close the shared queue.
    ///
    /// Established connections stay up until they close on their own or
    /// [`Server::disconnect_all`] is called.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let running = lock(&self.inner.running).take().ok_or(SessionError::NotStarted)?;
        running.cancel.cancel();
        let _ = running.accept_task.await;

        if let QueueMode::Shared { rx, .. } = &self.inner.queue {
            rx.lock().await.close();
        }
        info!("Mesh listener on {} stopped", running.local_addr);
        Ok(())
    }

    /// Take the next message from the shared queue
    pub async fn wait(&self, timeout: Duration) -> Result<IncomingMessage, SessionError> {
        let rx = match &self.inner.queue {
            QueueMode::Shared { rx, .. } => rx,
            _ => return Err(SessionError::SharedQueueUnavailable),
        };

        let deadline = Instant::now() + timeout;
        let mut rx = tokio::time::timeout_at(deadline, rx.lock())
            .await
            .map_err(|_| SessionError::Timeout)?;
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(SessionError::QueueClosed),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Snapshot of the active connections, oldest first
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = lock(&self.inner.connections).values().cloned().collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    /// Subscribe to active-set events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Emit `message` to every connected member, best effort.
    ///
    /// Succeeds with an empty destination list when there is nobody to send
    /// to, and fails with [`SessionError::BroadcastFailed`] only when every
    /// attempted emit failed.
    pub async fn broadcast(
        &self,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> Result<BroadcastResult, SessionError> {
        let timestamp = Utc::now();
        let targets: Vec<Connection> = self
            .connections()
            .into_iter()
            .filter(Connection::is_connected)
            .collect();
        if targets.is_empty() {
            return Ok(BroadcastResult {
                timestamp,
                destinations: Vec::new(),
            });
        }

        let attempted = targets.len();
        let results = join_all(
            targets
                .iter()
                .map(|connection| connection.emit_shared(message.clone(), timeout)),
        )
        .await;

        let destinations: Vec<Connection> = targets
            .into_iter()
            .zip(results)
            .filter_map(|(connection, result)| match result {
                Ok(_) => Some(connection),
                Err(e) => {
                    debug!("Broadcast to {} failed: {}", connection.id(), e);
                    None
                }
            })
            .collect();

        if destinations.is_empty() {
            return Err(SessionError::BroadcastFailed { attempted });
        }
        Ok(BroadcastResult {
            timestamp,
            destinations,
        })
    }

    /// Disconnect every active connection
    pub async fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.disconnect().await;
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => adopt(&inner, stream, remote),
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("Accept loop exited");
}

fn adopt(inner: &Arc<ServerInner>, stream: TcpStream, remote: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set nodelay for {}: {}", remote, e);
    }

    let queue = match &inner.queue {
        QueueMode::Shared { tx, .. } => Some(lock(tx).clone()),
        QueueMode::Sink(tx) => Some(tx.clone()),
        QueueMode::PerConnection => None,
    };
    let connection = Connection::server(inner.options.clone(), queue);
    let installed = match connection.install(stream) {
        Ok(installed) => installed,
        Err(e) => {
            warn!("Failed to adopt connection from {}: {}", remote, e);
            return;
        }
    };
    let id = connection.id();

    lock(&inner.connections).insert(id, connection.clone());
    let _ = inner.events.send(ServerEvent::Connected { id, remote });

    let hook = inner.hook.read().unwrap_or_else(PoisonError::into_inner).clone();
    if let Some(hook) = hook {
        hook.accepted(&connection);
    }

    let closed = connection.closed();
    connection.start_receiving(installed);

    let inner = inner.clone();
    tokio::spawn(async move {
        closed.await;
        let removed = lock(&inner.connections).remove(&id);
        if let Some(connection) = removed {
            let _ = inner.events.send(ServerEvent::Disconnected {
                id,
                remote: connection.remote_addr(),
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{echo_options, Text};
    use crate::transport::DEFAULT_BACKLOG;

    const WAIT: Duration = Duration::from_secs(5);

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn dial(addr: SocketAddr, options: Arc<ProtocolOptions>) -> Connection {
        let client = Connection::new(options);
        assert!(client.connect(addr, WAIT).await.unwrap());
        client
    }

    async fn wait_for_count(server: &Server, count: usize) {
        tokio::time::timeout(WAIT, async {
            while server.connections().len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shared_queue_receives_from_all_clients() {
        let options = echo_options();
        let server = Server::new(options.clone());
        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();

        let a = dial(addr, options.clone()).await;
        let b = dial(addr, options).await;
        a.emit(Text::new("from a"), WAIT).await.unwrap();
        b.emit(Text::new("from b"), WAIT).await.unwrap();

        let mut texts = Vec::new();
        for _ in 0..2 {
            let incoming = server.wait(WAIT).await.unwrap();
            assert!(server.connections().contains(&incoming.connection));
            texts.push(incoming.downcast_ref::<Text>().unwrap().0.clone());
        }
        texts.sort();
        assert_eq!(texts, vec!["from a", "from b"]);
        assert_eq!(server.connections().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_skips_killed_client() {
        let options = echo_options();
        let server = Server::new(options.clone());
        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();

        let clients = vec![
            dial(addr, options.clone()).await,
            dial(addr, options.clone()).await,
            dial(addr, options).await,
        ];
        wait_for_count(&server, 3).await;

        clients[1].disconnect().await;
        let result = server.broadcast(Arc::new(Text::new("all")), WAIT).await.unwrap();
        assert_eq!(result.destinations.len(), 2);

        for index in [0, 2] {
            let incoming = clients[index].wait(WAIT).await.unwrap();
            assert_eq!(incoming.downcast_ref::<Text>().unwrap().0, "all");
        }
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections() {
        let server = Server::new(echo_options());
        server.start(any_port(), DEFAULT_BACKLOG).unwrap();
        let result = server.broadcast(Arc::new(Text::new("nobody")), WAIT).await.unwrap();
        assert!(result.destinations.is_empty());
    }

    #[tokio::test]
    async fn test_queue_modes() {
        let options = echo_options();

        let per_connection = Server::per_connection(options.clone());
        let addr = per_connection.start(any_port(), DEFAULT_BACKLOG).unwrap();
        assert!(matches!(
            per_connection.wait(WAIT).await,
            Err(SessionError::SharedQueueUnavailable)
        ));
        let client = dial(addr, options.clone()).await;
        client.emit(Text::new("private"), WAIT).await.unwrap();
        let accepted = per_connection.connections().remove(0);
        assert_eq!(accepted.wait(WAIT).await.unwrap().downcast_ref::<Text>().unwrap().0, "private");

        let (sink, mut rx) = mpsc::channel(8);
        let sinked = Server::with_sink(options.clone(), sink);
        let addr = sinked.start(any_port(), DEFAULT_BACKLOG).unwrap();
        assert!(matches!(
            sinked.wait(WAIT).await,
            Err(SessionError::SharedQueueUnavailable)
        ));
        let client = dial(addr, options).await;
        client.emit(Text::new("sink"), WAIT).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().downcast_ref::<Text>().unwrap().0, "sink");
    }

    #[tokio::test]
    async fn test_accept_hook_state_visible_to_first_message() {
        let options = echo_options();
        let (sink, mut rx) = mpsc::channel(8);
        let hook = |connection: &Connection| connection.set_state(Arc::new(String::from("tagged")));
        let server = Server::with_sink(options.clone(), sink).with_accept_hook(Arc::new(hook));
        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();

        let client = dial(addr, options).await;
        client.emit(Text::new("first"), WAIT).await.unwrap();
        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.connection.state::<String>().unwrap().as_str(), "tagged");
    }

    #[tokio::test]
    async fn test_events_and_disconnect_all() {
        let options = echo_options();
        let server = Server::new(options.clone());
        let mut events = server.subscribe();
        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();

        let client = dial(addr, options).await;
        let connected = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        let id = match connected {
            ServerEvent::Connected { id, .. } => id,
            other => panic!("unexpected event {:?}", other),
        };

        server.disconnect_all().await;
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::Disconnected { id: closed, .. } => assert_eq!(closed, id),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(server.connections().is_empty());
        tokio::time::timeout(WAIT, client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_listener_and_queue() {
        let options = echo_options();
        let server = Server::new(options.clone());
        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();
        assert!(matches!(
            server.start(any_port(), DEFAULT_BACKLOG),
            Err(SessionError::AlreadyStarted)
        ));

        let client = dial(addr, options.clone()).await;
        client.emit(Text::new("before stop"), WAIT).await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());

        assert!(server.wait(WAIT).await.is_ok());
        assert!(matches!(server.wait(WAIT).await, Err(SessionError::QueueClosed)));
        assert!(matches!(
            client.emit(Text::new("after stop"), WAIT).await,
            Err(SessionError::Rejected)
        ));

        let late = Connection::new(options);
        assert!(!late.connect(addr, Duration::from_millis(500)).await.unwrap());
        assert!(matches!(server.stop().await, Err(SessionError::NotStarted)));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let options = echo_options();
        let server = Server::new(options.clone());
        server.start(any_port(), DEFAULT_BACKLOG).unwrap();
        server.stop().await.unwrap();
        assert!(matches!(server.wait(WAIT).await, Err(SessionError::QueueClosed)));

        let addr = server.start(any_port(), DEFAULT_BACKLOG).unwrap();
        assert!(server.is_running());
        let client = dial(addr, options).await;
        client.emit(Text::new("second run"), WAIT).await.unwrap();
        let incoming = server.wait(WAIT).await.unwrap();
        assert_eq!(incoming.downcast_ref::<Text>().unwrap().0, "second run");
        server.stop().await.unwrap();
    }
}
