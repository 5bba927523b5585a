//! Outbound peers: dialled, authenticated and redialled by this node.
//!
//! A tick loop walks the peer set at a short fixed cadence and starts a
//! recovery attempt for every peer that is idle and due. Failed connects
//! and handshakes that never reach `Connected` count as retries; once a
//! peer hits the retry cap it is removed for good.

use crate::error::PeerError;
use crate::middleware::{MeshMessage, Pipeline};
use crate::options::MeshOptions;
use crate::peer::{lock, Peer, PeerEvent, PeerState};
use crate::router::route_loop;
use crate::token::MeshToken;
use mesh_session::{Connection, IncomingMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct LocalInner {
    options: Arc<MeshOptions>,
    token: Arc<MeshToken>,
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    events: broadcast::Sender<PeerEvent>,
    queue_tx: mpsc::Sender<IncomingMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    delivery: mpsc::Sender<MeshMessage>,
    cancel: CancellationToken,
    started: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Manager for peers this node dials
#[derive(Clone)]
pub struct LocalPeerManager {
    inner: Arc<LocalInner>,
}

impl LocalPeerManager {
    /// Create a manager delivering application messages to `delivery`
    pub fn new(options: Arc<MeshOptions>, token: Arc<MeshToken>, delivery: mpsc::Sender<MeshMessage>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(options.protocol.queue_capacity);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(LocalInner {
                options,
                token,
                peers: Mutex::new(HashMap::new()),
                events,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                delivery,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Add the configured initial peers and start the tick and routing loops
    pub fn start(&self) -> Result<(), PeerError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerError::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyStarted);
        }

        for addr in &self.inner.options.initial_peers {
            if !self.add_peer(*addr) {
                debug!("Initial peer {} listed twice", addr);
            }
        }

        let queue = lock(&self.inner.queue_rx).take().ok_or(PeerError::AlreadyStarted)?;
        let pipeline = Pipeline::new(self.inner.options.middleware.clone(), self.inner.delivery.clone());

        let router = tokio::spawn(route_loop("local", queue, pipeline, self.inner.cancel.clone()));
        let ticker = tokio::spawn(tick_loop(self.inner.clone()));
        lock(&self.inner.tasks).extend([router, ticker]);

        info!(
            "Local peer manager started with {} peers",
            lock(&self.inner.peers).len()
        );
        Ok(())
    }

    /// Track a new outbound peer; false if it is known or the manager is closing
    pub fn add_peer(&self, address: SocketAddr) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }

        let mut peers = lock(&self.inner.peers);
        if peers.contains_key(&address) {
            return false;
        }

        let connection = Connection::with_queue(self.inner.options.protocol.clone(), self.inner.queue_tx.clone());
        let peer = Peer::new(
            true,
            address,
            connection.clone(),
            self.inner.token.clone(),
            self.inner.options.clone(),
            self.inner.events.clone(),
        );
        connection.set_state(peer.clone());
        peers.insert(address, peer);
        debug!("Added local peer {}", address);
        true
    }

    /// Forget a peer, close its connection and mark it removed
    pub async fn remove_peer(&self, address: SocketAddr) -> bool {
        let peer = lock(&self.inner.peers).remove(&address);
        match peer {
            Some(peer) => {
                retire(&peer);
                peer.connection().disconnect().await;
                info!("Removed local peer {}", address);
                true
            }
            None => false,
        }
    }

    /// Look up one peer
    pub fn peer(&self, address: SocketAddr) -> Option<Arc<Peer>> {
        lock(&self.inner.peers).get(&address).cloned()
    }

    /// Snapshot of every tracked peer, ordered by address
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = lock(&self.inner.peers).values().cloned().collect();
        peers.sort_by_key(|peer| peer.address());
        peers
    }

    /// Tracked peers currently in `state`
    pub fn peers_in(&self, state: PeerState) -> Vec<Arc<Peer>> {
        self.peers().into_iter().filter(|peer| peer.state() == state).collect()
    }

    /// Peer state changes
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop ticking, drop every peer, then join the background loops
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let peers: Vec<_> = lock(&self.inner.peers).drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            retire(peer);
            peer.connection().disconnect().await;
        }

        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Local peer manager stopped; dropped {} peers", peers.len());
    }
}

impl LocalInner {
    fn is_tracked(&self, peer: &Arc<Peer>) -> bool {
        lock(&self.peers)
            .get(&peer.address())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, peer))
    }

    /// Count a failed attempt; remove the peer at the retry cap
    fn attempt_failed(&self, peer: &Arc<Peer>) {
        if peer.state() == PeerState::Removed {
            return;
        }

        let retries = peer.record_failure();
        if retries >= self.options.max_retries_per_peer {
            warn!("Giving up on peer {} after {} attempts", peer.address(), retries);
            peer.set_state(PeerState::Disconnected);
            {
                let mut peers = lock(&self.peers);
                if peers.get(&peer.address()).is_some_and(|tracked| Arc::ptr_eq(tracked, peer)) {
                    peers.remove(&peer.address());
                }
            }
            retire(peer);
        } else {
            debug!(
                "Peer {} attempt {}/{} failed",
                peer.address(),
                retries,
                self.options.max_retries_per_peer
            );
            peer.schedule_attempt(Instant::now() + self.options.reconnect_delay);
            peer.set_state(PeerState::Disconnected);
        }
    }

    fn link_closed(&self, peer: &Arc<Peer>) {
        match peer.state() {
            PeerState::Removed => {}
            PeerState::Connected => {
                info!("Lost connection to peer {}", peer.address());
                peer.schedule_attempt(Instant::now() + self.options.reconnect_delay);
                peer.set_state(PeerState::Disconnected);
            }
            _ => self.attempt_failed(peer),
        }
    }
}

fn retire(peer: &Arc<Peer>) {
    peer.set_state(PeerState::Removed);
    peer.connection().clear_state();
}

async fn tick_loop(inner: Arc<LocalInner>) {
    let mut interval = tokio::time::interval(inner.options.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let due: Vec<_> = lock(&inner.peers)
            .values()
            .filter(|peer| peer.is_due(now))
            .cloned()
            .collect();

        for peer in due {
            if peer.set_state(PeerState::Connecting) {
                tokio::spawn(recover(inner.clone(), peer));
            }
        }
    }
    debug!("Local peer tick loop stopped");
}

async fn recover(inner: Arc<LocalInner>, peer: Arc<Peer>) {
    let address = peer.address();
    peer.prepare_link();

    let connected = match peer.connection().connect(address, inner.options.connection_timeout).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!("Connect to peer {} failed: {}", address, e);
            false
        }
    };
    if !connected {
        inner.attempt_failed(&peer);
        return;
    }

    if peer.state() == PeerState::Removed || !inner.is_tracked(&peer) {
        peer.connection().disconnect().await;
        return;
    }

    let closed = peer.connection().closed();
    peer.begin_handshake();
    tokio::spawn(async move {
        closed.await;
        inner.link_closed(&peer);
    });
}
