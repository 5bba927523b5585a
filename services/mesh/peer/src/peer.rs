//! One mesh participant reachable through a single connection.

use crate::error::{HandshakeError, PeerError};
use crate::handshake::{Handshake, Step};
use crate::options::MeshOptions;
use crate::token::MeshToken;
use mesh_session::{Connection, EmitResult};
use mesh_wire::Message;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Peer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Known but never attempted
    Pending,
    /// Opening the transport
    Connecting,
    /// Transport up, authenticating
    Handshaking,
    /// Authenticated; application traffic flows
    Connected,
    /// Link lost; a local peer will be retried
    Disconnected,
    /// Dropped for good
    Removed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Pending => "pending",
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Published by a peer manager whenever one of its peers changes state
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// The peer
    pub peer: Arc<Peer>,
    /// State before the change
    pub previous: PeerState,
    /// State after the change
    pub current: PeerState,
}

struct PeerInner {
    state: PeerState,
    remote_token: Option<MeshToken>,
    advertised: Option<SocketAddr>,
    handshake: Handshake,
    retries: u32,
    next_attempt: Option<Instant>,
    // Bumped for every link; stale handshake tasks compare against it
    epoch: u64,
}

/// A mesh participant
pub struct Peer {
    is_local: bool,
    address: SocketAddr,
    connection: Connection,
    options: Arc<MeshOptions>,
    inner: Mutex<PeerInner>,
    events: broadcast::Sender<PeerEvent>,
}

impl Peer {
    pub(crate) fn new(
        is_local: bool,
        address: SocketAddr,
        connection: Connection,
        local_token: Arc<MeshToken>,
        options: Arc<MeshOptions>,
        events: broadcast::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let handshake = Handshake::new(local_token, options.network_id.clone(), options.advertised_address);
        Arc::new(Self {
            is_local,
            address,
            connection,
            options,
            inner: Mutex::new(PeerInner {
                state: PeerState::Pending,
                remote_token: None,
                advertised: None,
                handshake,
                retries: 0,
                next_attempt: None,
                epoch: 0,
            }),
            events,
        })
    }

    /// Current state
    pub fn state(&self) -> PeerState {
        lock(&self.inner).state
    }

    /// Whether this node dialled the peer
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Configured address for local peers, observed address for remote ones
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Remote token, set once the handshake completes
    pub fn remote_token(&self) -> Option<MeshToken> {
        lock(&self.inner).remote_token.clone()
    }

    /// Address the remote advertised in its Hello
    pub fn advertised_address(&self) -> Option<SocketAddr> {
        lock(&self.inner).advertised
    }

    /// Failed attempts since the last successful handshake
    pub fn retries(&self) -> u32 {
        lock(&self.inner).retries
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send an application message to this peer
    pub async fn emit<M: Message>(&self, message: M, timeout: Duration) -> Result<EmitResult, PeerError> {
        self.emit_shared(Arc::new(message), timeout).await
    }

    /// Send an already shared application message to this peer
    pub async fn emit_shared(&self, message: Arc<dyn Message>, timeout: Duration) -> Result<EmitResult, PeerError> {
        if self.state() != PeerState::Connected {
            return Err(PeerError::NotConnected);
        }
        Ok(self.connection.emit_shared(message, timeout).await?)
    }

    /// Move to `next` and publish the change; `Removed` is never left
    pub(crate) fn set_state(self: &Arc<Self>, next: PeerState) -> bool {
        let previous = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            if previous == next || previous == PeerState::Removed {
                return false;
            }
            inner.state = next;
            previous
        };

        self.publish(previous, next);
        true
    }

    fn publish(self: &Arc<Self>, previous: PeerState, current: PeerState) {
        debug!("Peer {} {} -> {}", self.address, previous, current);
        let _ = self.events.send(PeerEvent {
            peer: self.clone(),
            previous,
            current,
        });
    }

    /// Reset handshake state for a new link; call before the link exists
    pub(crate) fn prepare_link(&self) {
        let mut inner = lock(&self.inner);
        inner.epoch += 1;
        inner.handshake.reset();
        inner.remote_token = None;
        inner.advertised = None;
    }

    /// Send our Hello and arm the handshake deadline
    pub(crate) fn begin_handshake(self: &Arc<Self>) {
        let (epoch, steps) = {
            let mut inner = lock(&self.inner);
            (inner.epoch, inner.handshake.start())
        };
        if !self.set_state(PeerState::Handshaking) {
            return;
        }
        self.execute(epoch, steps);

        let peer = Arc::downgrade(self);
        let deadline = self.options.connection_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(peer) = peer.upgrade() {
                if peer.state() == PeerState::Handshaking {
                    peer.abort_link(epoch, &"handshake timed out");
                }
            }
        });
    }

    /// Feed a handshake message received on the current link
    pub(crate) fn handle_handshake(self: &Arc<Self>, message: &dyn Message) {
        let (epoch, result) = {
            let mut inner = lock(&self.inner);
            (inner.epoch, inner.handshake.receive(message))
        };
        match result {
            Ok(steps) => self.execute(epoch, steps),
            Err(e) => self.abort_link(epoch, &e),
        }
    }

    /// The remote has proven its identity and finished its side
    pub(crate) fn is_remote_complete(&self) -> bool {
        lock(&self.inner).handshake.is_remote_complete()
    }

    /// Drop the current link after a protocol violation
    pub(crate) fn abort(self: &Arc<Self>, reason: HandshakeError) {
        let epoch = lock(&self.inner).epoch;
        self.abort_link(epoch, &reason);
    }

    /// Count a failed attempt and return the new total
    pub(crate) fn record_failure(&self) -> u32 {
        let mut inner = lock(&self.inner);
        inner.retries += 1;
        inner.retries
    }

    pub(crate) fn schedule_attempt(&self, at: Instant) {
        lock(&self.inner).next_attempt = Some(at);
    }

    /// Whether a recovery attempt may start at `now`
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        let inner = lock(&self.inner);
        matches!(inner.state, PeerState::Pending | PeerState::Disconnected)
            && inner.next_attempt.map_or(true, |at| now >= at)
    }

    fn execute(self: &Arc<Self>, epoch: u64, steps: Vec<Step>) {
        for step in steps {
            match step {
                Step::Send { message, ack } => {
                    let peer = self.clone();
                    tokio::spawn(async move {
                        let timeout = peer.options.connection_timeout;
                        match peer.connection.emit_shared(message, timeout).await {
                            Ok(_) => {
                                if let Some(ack) = ack {
                                    let steps = {
                                        let mut inner = lock(&peer.inner);
                                        if inner.epoch != epoch {
                                            return;
                                        }
                                        inner.handshake.acknowledged(ack)
                                    };
                                    peer.execute(epoch, steps);
                                }
                            }
                            Err(e) => peer.abort_link(epoch, &e),
                        }
                    });
                }
                Step::Complete { token, advertised } => {
                    let completed = {
                        let mut inner = lock(&self.inner);
                        if inner.epoch != epoch
                            || inner.state != PeerState::Handshaking
                            || !self.connection.is_connected()
                        {
                            false
                        } else {
                            inner.remote_token = Some(token.clone());
                            inner.advertised = advertised;
                            inner.retries = 0;
                            inner.next_attempt = None;
                            inner.state = PeerState::Connected;
                            true
                        }
                    };
                    if !completed {
                        debug!("Peer {} finished a handshake on a link that is gone", self.address);
                        return;
                    }
                    info!("Peer {} authenticated as {}", self.address, token);
                    self.publish(PeerState::Handshaking, PeerState::Connected);
                }
            }
        }
    }

    fn abort_link(&self, epoch: u64, reason: &dyn fmt::Display) {
        if lock(&self.inner).epoch != epoch {
            return;
        }
        warn!("Dropping link to peer {}: {}", self.address, reason);
        let connection = self.connection.clone();
        tokio::spawn(async move { connection.disconnect().await });
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("is_local", &self.is_local)
            .field("state", &self.state())
            .field("connection", &self.connection.id())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{fast_options, Note};
    use mesh_session::Server;

    pub(crate) fn detached_peer() -> Arc<Peer> {
        let options = fast_options().build().expect("options");
        let (events, _) = broadcast::channel(8);
        Peer::new(
            true,
            "127.0.0.1:1".parse().expect("addr"),
            Connection::new(options.protocol.clone()),
            Arc::new(MeshToken::generate()),
            options,
            events,
        )
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let options = fast_options().build().unwrap();
        let (events, mut rx) = broadcast::channel(8);
        let peer = Peer::new(
            true,
            "127.0.0.1:1".parse().unwrap(),
            Connection::new(options.protocol.clone()),
            Arc::new(MeshToken::generate()),
            options,
            events,
        );

        assert_eq!(peer.state(), PeerState::Pending);
        assert!(peer.set_state(PeerState::Connecting));
        assert!(!peer.set_state(PeerState::Connecting));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.previous, PeerState::Pending);
        assert_eq!(event.current, PeerState::Connecting);
        assert!(Arc::ptr_eq(&event.peer, &peer));
    }

    #[tokio::test]
    async fn test_removed_is_terminal() {
        let peer = detached_peer();
        assert!(peer.set_state(PeerState::Removed));
        assert!(!peer.set_state(PeerState::Pending));
        assert!(!peer.set_state(PeerState::Connected));
        assert_eq!(peer.state(), PeerState::Removed);
        assert!(!peer.is_due(Instant::now()));
    }

    #[tokio::test]
    async fn test_emit_requires_connected() {
        let peer = detached_peer();
        assert!(matches!(
            peer.emit(Note::new("early"), Duration::from_millis(50)).await,
            Err(PeerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_retry_bookkeeping() {
        let peer = detached_peer();
        let now = Instant::now();
        assert!(peer.is_due(now));

        assert_eq!(peer.record_failure(), 1);
        assert_eq!(peer.record_failure(), 2);
        assert_eq!(peer.retries(), 2);

        peer.schedule_attempt(now + Duration::from_secs(60));
        assert!(!peer.is_due(now));
        assert!(peer.is_due(now + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn test_completion_after_link_loss_is_ignored() {
        let options = fast_options().build().unwrap();
        let server = Server::per_connection(options.protocol.clone());
        let addr = server.start("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        let connection = Connection::new(options.protocol.clone());
        let (events, _) = broadcast::channel(8);
        let peer = Peer::new(
            true,
            addr,
            connection.clone(),
            Arc::new(MeshToken::generate()),
            options,
            events,
        );
        peer.prepare_link();
        assert!(connection.connect(addr, Duration::from_secs(1)).await.unwrap());
        peer.begin_handshake();
        let epoch = lock(&peer.inner).epoch;
        let complete = || {
            vec![Step::Complete {
                token: MeshToken::generate().public_only(),
                advertised: None,
            }]
        };

        // Done acknowledged just as the stream closed
        connection.disconnect().await;
        peer.execute(epoch, complete());
        assert_eq!(peer.state(), PeerState::Handshaking);

        // The close watcher already ran
        peer.set_state(PeerState::Disconnected);
        peer.execute(epoch, complete());
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(peer.remote_token().is_none());
        assert!(peer.is_due(Instant::now()));
        server.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_remote_times_out_handshake() {
        let options = fast_options()
            .connection_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        // Acks our Hello but never answers it
        let server = Server::per_connection(options.protocol.clone());
        let addr = server.start("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        let connection = Connection::new(options.protocol.clone());
        let (events, _) = broadcast::channel(8);
        let peer = Peer::new(
            true,
            addr,
            connection.clone(),
            Arc::new(MeshToken::generate()),
            options,
            events,
        );

        peer.prepare_link();
        assert!(connection.connect(addr, Duration::from_secs(1)).await.unwrap());
        let closed = connection.closed();
        peer.begin_handshake();
        assert_eq!(peer.state(), PeerState::Handshaking);

        tokio::time::timeout(Duration::from_secs(3), closed).await.unwrap();
        assert!(!connection.is_connected());
        assert!(peer.remote_token().is_none());
        server.stop().await.unwrap();
    }
}
