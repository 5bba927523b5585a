//! Inbound peers: accepted by the listener and authenticated once.
//!
//! Accepted peers are never redialled. When their link ends they are
//! removed; reconnecting is the initiator's job.

use crate::error::PeerError;
use crate::middleware::{MeshMessage, Pipeline};
use crate::options::MeshOptions;
use crate::peer::{lock, Peer, PeerEvent, PeerState};
use crate::router::route_loop;
use crate::token::MeshToken;
use mesh_session::{Connection, ConnectionId, IncomingMessage, Server};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RemoteInner {
    options: Arc<MeshOptions>,
    token: Arc<MeshToken>,
    server: Server,
    peers: Mutex<HashMap<ConnectionId, Arc<Peer>>>,
    events: broadcast::Sender<PeerEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    delivery: mpsc::Sender<MeshMessage>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Manager for peers that dialled this node
#[derive(Clone)]
pub struct RemotePeerManager {
    inner: Arc<RemoteInner>,
}

impl RemotePeerManager {
    /// Create a manager delivering application messages to `delivery`
    pub fn new(options: Arc<MeshOptions>, token: Arc<MeshToken>, delivery: mpsc::Sender<MeshMessage>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteInner>| {
            let (queue_tx, queue_rx) = mpsc::channel(options.protocol.queue_capacity);
            let owner = weak.clone();
            let server = Server::with_sink(options.protocol.clone(), queue_tx).with_accept_hook(Arc::new(
                move |connection: &Connection| {
                    if let Some(inner) = owner.upgrade() {
                        inner.accepted(connection);
                    }
                },
            ));
            let (events, _) = broadcast::channel(256);

            RemoteInner {
                options: options.clone(),
                token,
                server,
                peers: Mutex::new(HashMap::new()),
                events,
                queue_rx: Mutex::new(Some(queue_rx)),
                delivery,
                cancel: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }
        });
        Self { inner }
    }

    /// Bind the listener and start routing; returns the bound address
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr, PeerError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerError::ShuttingDown);
        }
        let queue = lock(&self.inner.queue_rx).take().ok_or(PeerError::AlreadyStarted)?;
        let bound = self.inner.server.start(addr, self.inner.options.listen_backlog)?;

        let pipeline = Pipeline::new(self.inner.options.middleware.clone(), self.inner.delivery.clone());
        let router = tokio::spawn(route_loop("remote", queue, pipeline, self.inner.cancel.clone()));
        lock(&self.inner.tasks).push(router);

        info!("Remote peer manager accepting on {}", bound);
        Ok(bound)
    }

    /// Listener address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    /// Snapshot of accepted peers, ordered by connection id
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = lock(&self.inner.peers)
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect();
        peers.sort_by_key(|(id, _)| *id);
        peers.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Accepted peers currently in `state`
    pub fn peers_in(&self, state: PeerState) -> Vec<Arc<Peer>> {
        self.peers().into_iter().filter(|peer| peer.state() == state).collect()
    }

    /// Mark an accepted peer removed and close its connection
    pub async fn remove_peer(&self, peer: &Arc<Peer>) -> bool {
        let tracked = lock(&self.inner.peers).remove(&peer.connection().id());
        match tracked {
            Some(peer) => {
                retire(&peer);
                peer.connection().disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Peer state changes
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop accepting, drop every peer, then join the routing loop
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.server.is_running() {
            if let Err(e) = self.inner.server.stop().await {
                debug!("Listener stop: {}", e);
            }
        }

        let peers: Vec<_> = lock(&self.inner.peers).drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            retire(peer);
            peer.connection().disconnect().await;
        }

        self.inner.cancel.cancel();
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Remote peer manager stopped; dropped {} peers", peers.len());
    }
}

impl RemoteInner {
    fn accepted(self: &Arc<Self>, connection: &Connection) {
        let Some(remote) = connection.remote_addr() else {
            return;
        };
        if self.shutting_down.load(Ordering::SeqCst) {
            let connection = connection.clone();
            tokio::spawn(async move { connection.disconnect().await });
            return;
        }

        let peer = Peer::new(
            false,
            remote,
            connection.clone(),
            self.token.clone(),
            self.options.clone(),
            self.events.clone(),
        );
        connection.set_state(peer.clone());
        lock(&self.peers).insert(connection.id(), peer.clone());
        debug!("Accepted peer {} on {}", remote, connection.id());

        peer.set_state(PeerState::Connecting);
        peer.prepare_link();
        let closed = connection.closed();
        peer.begin_handshake();

        let inner = self.clone();
        tokio::spawn(async move {
            closed.await;
            inner.link_closed(&peer);
        });
    }

    fn link_closed(&self, peer: &Arc<Peer>) {
        if peer.state() == PeerState::Removed {
            return;
        }
        if peer.state() != PeerState::Connected {
            warn!("Peer {} disconnected before authenticating", peer.address());
        } else {
            info!("Peer {} disconnected", peer.address());
        }

        lock(&self.peers).remove(&peer.connection().id());
        peer.set_state(PeerState::Disconnected);
        retire(peer);
    }
}

fn retire(peer: &Arc<Peer>) {
    peer.set_state(PeerState::Removed);
    peer.connection().clear_state();
}
