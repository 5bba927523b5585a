//! Mesh coordinator: one identity, one inbound and one outbound manager.

use crate::error::PeerError;
use crate::local::LocalPeerManager;
use crate::middleware::MeshMessage;
use crate::options::MeshOptions;
use crate::peer::{Peer, PeerState};
use crate::remote::RemotePeerManager;
use crate::token::MeshToken;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mesh_wire::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outcome of a mesh broadcast
#[derive(Debug, Clone)]
pub struct MeshBroadcast {
    /// Time the broadcast started
    pub timestamp: DateTime<Utc>,
    /// Peers that acknowledged the message
    pub peers: Vec<Arc<Peer>>,
}

/// A mesh node
pub struct Mesh {
    token: Arc<MeshToken>,
    options: Arc<MeshOptions>,
    local: LocalPeerManager,
    remote: RemotePeerManager,
    delivery: tokio::sync::Mutex<mpsc::Receiver<MeshMessage>>,
    started: AtomicBool,
}

impl Mesh {
    /// Create a node with a freshly generated token
    pub fn new(options: Arc<MeshOptions>) -> Self {
        Self::with_token(options, MeshToken::generate())
    }

    /// Create a node with an existing token; it must hold a private key
    pub fn with_token(options: Arc<MeshOptions>, token: MeshToken) -> Self {
        let token = Arc::new(token);
        let (tx, rx) = mpsc::channel(options.protocol.queue_capacity);
        Self {
            local: LocalPeerManager::new(options.clone(), token.clone(), tx.clone()),
            remote: RemotePeerManager::new(options.clone(), token.clone(), tx),
            delivery: tokio::sync::Mutex::new(rx),
            started: AtomicBool::new(false),
            token,
            options,
        }
    }

    /// Start listening on `listen` (if given) and dialling the initial peers.
    ///
    /// Returns the bound listener address.
    pub fn start(&self, listen: Option<SocketAddr>) -> Result<Option<SocketAddr>, PeerError> {
        if !self.token.has_private_key() {
            return Err(PeerError::NoPrivateKey);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyStarted);
        }

        let bound = match listen {
            Some(addr) => Some(self.remote.start(addr)?),
            None => None,
        };
        self.local.start()?;
        info!("Mesh node {} started", self.token);
        Ok(bound)
    }

    /// Shut both managers down
    pub async fn stop(&self) {
        self.local.shutdown().await;
        self.remote.shutdown().await;
        info!("Mesh node {} stopped", self.token);
    }

    /// Next application message from any peer
    pub async fn wait(&self, timeout: Duration) -> Result<MeshMessage, PeerError> {
        let deadline = Instant::now() + timeout;
        let mut delivery = tokio::time::timeout_at(deadline, self.delivery.lock())
            .await
            .map_err(|_| PeerError::Timeout)?;
        match tokio::time::timeout_at(deadline, delivery.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(PeerError::Closed),
            Err(_) => Err(PeerError::Timeout),
        }
    }

    /// Emit `message` to every connected peer, best effort.
    ///
    /// Succeeds with no peers when nobody is connected and fails with
    /// [`PeerError::BroadcastFailed`] only when every attempt failed.
    pub async fn broadcast(&self, message: Arc<dyn Message>, timeout: Duration) -> Result<MeshBroadcast, PeerError> {
        let timestamp = Utc::now();
        let targets = self.connected_peers();
        if targets.is_empty() {
            return Ok(MeshBroadcast {
                timestamp,
                peers: Vec::new(),
            });
        }

        let attempted = targets.len();
        let results = join_all(targets.iter().map(|peer| peer.emit_shared(message.clone(), timeout))).await;
        let peers: Vec<_> = targets
            .into_iter()
            .zip(results)
            .filter_map(|(peer, result)| match result {
                Ok(_) => Some(peer),
                Err(e) => {
                    debug!("Broadcast to peer {} failed: {}", peer.address(), e);
                    None
                }
            })
            .collect();

        if peers.is_empty() {
            return Err(PeerError::BroadcastFailed { attempted });
        }
        Ok(MeshBroadcast { timestamp, peers })
    }

    /// This node's token
    pub fn token(&self) -> &MeshToken {
        &self.token
    }

    /// Options in effect
    pub fn options(&self) -> &Arc<MeshOptions> {
        &self.options
    }

    /// Outbound peer manager
    pub fn local(&self) -> &LocalPeerManager {
        &self.local
    }

    /// Inbound peer manager
    pub fn remote(&self) -> &RemotePeerManager {
        &self.remote
    }

    /// Every tracked peer, outbound first
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.local.peers();
        peers.extend(self.remote.peers());
        peers
    }

    /// Peers that completed the handshake
    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.local.peers_in(PeerState::Connected);
        peers.extend(self.remote.peers_in(PeerState::Connected));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Middleware, Next};
    use crate::peer::PeerEvent;
    use crate::test_support::{fast_options, Note};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    const LOOPBACK: &str = "127.0.0.1:0";

    async fn until_connected(events: &mut broadcast::Receiver<PeerEvent>) -> Arc<Peer> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.current == PeerState::Connected {
                    return event.peer;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Start a listening node B and a node A dialling it
    async fn pair(a_network: &'static [u8], b_network: &'static [u8]) -> (Mesh, Mesh) {
        let b = Mesh::new(fast_options().network_id(b_network).build().unwrap());
        let addr = b.start(Some(LOOPBACK.parse().unwrap())).unwrap().unwrap();
        let a = Mesh::new(
            fast_options()
                .network_id(a_network)
                .max_retries_per_peer(2)
                .peer(addr)
                .build()
                .unwrap(),
        );
        (a, b)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_nodes_authenticate_each_other() {
        let (a, b) = pair(b"net", b"net").await;
        let mut a_events = a.local().subscribe();
        let mut b_events = b.remote().subscribe();
        a.start(None).unwrap();

        let a_sees = until_connected(&mut a_events).await;
        let b_sees = until_connected(&mut b_events).await;

        assert_eq!(a_sees.remote_token().unwrap(), b.token().public_only());
        assert_eq!(b_sees.remote_token().unwrap(), a.token().public_only());
        assert!(a_sees.is_local());
        assert!(!b_sees.is_local());
        assert_eq!(a_sees.retries(), 0);
        assert_eq!(a.connected_peers().len(), 1);
        assert_eq!(b.connected_peers().len(), 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_mismatch_never_connects() {
        let (a, b) = pair(b"alpha", b"beta").await;
        let mut a_events = a.local().subscribe();
        let mut b_events = b.remote().subscribe();
        a.start(None).unwrap();

        let removed = tokio::time::timeout(Duration::from_secs(10), async {
            let mut states = Vec::new();
            loop {
                let event = a_events.recv().await.unwrap();
                states.push(event.current);
                if event.current == PeerState::Removed {
                    return states;
                }
            }
        })
        .await
        .unwrap();

        assert!(!removed.contains(&PeerState::Connected));
        assert_eq!(removed[removed.len() - 2], PeerState::Disconnected);
        assert!(a.peers().is_empty());

        while let Ok(event) = b_events.try_recv() {
            assert_ne!(event.current, PeerState::Connected);
        }
        a.stop().await;
        b.stop().await;
    }

    struct Shout;

    #[async_trait]
    impl Middleware for Shout {
        async fn handle(&self, mut message: MeshMessage, next: Next<'_>) -> Result<(), PeerError> {
            let loud = message.downcast_ref::<Note>().map(|note| note.0.to_uppercase());
            if let Some(loud) = loud {
                message.message = Arc::new(Note(loud));
            }
            next.run(message).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_messages_flow_through_middleware_both_ways() {
        let b = Mesh::new(fast_options().middleware(Arc::new(Shout)).build().unwrap());
        let addr = b.start(Some(LOOPBACK.parse().unwrap())).unwrap().unwrap();
        let a = Mesh::new(fast_options().peer(addr).build().unwrap());
        let mut a_events = a.local().subscribe();
        let mut b_events = b.remote().subscribe();
        a.start(None).unwrap();

        let to_b = until_connected(&mut a_events).await;
        let to_a = until_connected(&mut b_events).await;

        to_b.emit(Note::new("hello b"), Duration::from_secs(2)).await.unwrap();
        let received = b.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.downcast_ref::<Note>().unwrap().0, "HELLO B");
        assert!(Arc::ptr_eq(&received.peer, &to_a));

        let sent = b.broadcast(Arc::new(Note::new("to everyone")), Duration::from_secs(2)).await.unwrap();
        assert_eq!(sent.peers.len(), 1);
        let received = a.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.downcast_ref::<Note>().unwrap().0, "to everyone");
        assert!(Arc::ptr_eq(&received.peer, &to_b));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_peer_reconnects_after_link_loss() {
        let (a, b) = pair(b"net", b"net").await;
        let mut a_events = a.local().subscribe();
        a.start(None).unwrap();

        let peer = until_connected(&mut a_events).await;
        for remote in b.remote().peers() {
            b.remote().remove_peer(&remote).await;
        }

        let again = until_connected(&mut a_events).await;
        assert!(Arc::ptr_eq(&peer, &again));
        assert_eq!(again.retries(), 0);
        assert_eq!(again.remote_token().unwrap(), b.token().public_only());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waits_share_one_deadline() {
        let mesh = Arc::new(Mesh::new(fast_options().build().unwrap()));
        let timeout = Duration::from_millis(300);

        let holder = {
            let mesh = mesh.clone();
            tokio::spawn(async move { mesh.wait(timeout).await })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        assert!(matches!(mesh.wait(timeout).await, Err(PeerError::Timeout)));
        assert!(started.elapsed() < timeout + Duration::from_millis(100));
        assert!(matches!(holder.await.unwrap(), Err(PeerError::Timeout)));
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_and_lifecycle_errors() {
        let mesh = Mesh::new(fast_options().build().unwrap());
        let sent = mesh
            .broadcast(Arc::new(Note::new("nobody")), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(sent.peers.is_empty());

        assert!(mesh.start(None).unwrap().is_none());
        assert!(matches!(mesh.start(None), Err(PeerError::AlreadyStarted)));
        assert!(matches!(
            mesh.wait(Duration::from_millis(20)).await,
            Err(PeerError::Timeout)
        ));
        mesh.stop().await;

        let public = MeshToken::generate().public_only();
        let mesh = Mesh::with_token(fast_options().build().unwrap(), public);
        assert!(matches!(mesh.start(None), Err(PeerError::NoPrivateKey)));
    }
}
