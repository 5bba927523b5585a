//! Routing loop shared by both peer managers.
//!
//! Every message a manager's connections receive lands on one queue. The
//! loop looks up the owning peer through the connection's user state and
//! either feeds the handshake or runs the middleware chain. Messages left
//! over from a link that has since closed are dropped.

use crate::error::{HandshakeError, PeerError};
use crate::handshake::is_handshake_message;
use crate::middleware::{MeshMessage, Pipeline};
use crate::peer::{Peer, PeerState};
use mesh_session::IncomingMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) async fn route_loop(
    name: &'static str,
    mut queue: mpsc::Receiver<IncomingMessage>,
    pipeline: Pipeline,
    cancel: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = queue.recv() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        match route(incoming, &pipeline).await {
            Ok(()) => {}
            Err(PeerError::Closed) => {
                debug!("{} router stopping: delivery queue closed", name);
                break;
            }
            Err(e) => warn!("{} middleware failed: {}", name, e),
        }
    }
    debug!("{} router stopped", name);
}

async fn route(incoming: IncomingMessage, pipeline: &Pipeline) -> Result<(), PeerError> {
    if incoming.connection.link_generation() != Some(incoming.link) {
        trace!("Dropping message from a closed link of {}", incoming.connection.id());
        return Ok(());
    }

    let Some(peer) = incoming.connection.state::<Peer>() else {
        warn!("Message on {} has no owning peer; disconnecting", incoming.connection.id());
        incoming.connection.disconnect().await;
        return Ok(());
    };

    let state = peer.state();
    if state == PeerState::Removed {
        trace!("Dropping message from removed peer {}", peer.address());
        return Ok(());
    }

    if state == PeerState::Connected || peer.is_remote_complete() {
        if is_handshake_message(incoming.message.as_ref()) {
            peer.abort(HandshakeError::Unexpected("handshake message after completion"));
            return Ok(());
        }
        let message = MeshMessage {
            peer,
            message: incoming.message,
            received_at: incoming.received_at,
        };
        return pipeline.dispatch(message).await;
    }

    peer.handle_handshake(incoming.message.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Check, CheckReply, Hello};
    use crate::options::MeshOptions;
    use crate::test_support::{fast_options, Note};
    use crate::token::{MeshToken, SIGNATURE_LENGTH};
    use chrono::Utc;
    use mesh_session::{Connection, Server};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(5);

    struct Link {
        options: Arc<MeshOptions>,
        server: Server,
        addr: SocketAddr,
        connection: Connection,
        peer: Arc<Peer>,
        queue: mpsc::Receiver<IncomingMessage>,
    }

    /// Local peer dialled into a server that never answers on its own
    async fn handshaking_peer() -> Link {
        let options = fast_options().build().unwrap();
        let server = Server::per_connection(options.protocol.clone());
        let addr = server.start("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        let (tx, queue) = mpsc::channel(16);
        let connection = Connection::with_queue(options.protocol.clone(), tx);
        let (events, _) = broadcast::channel(16);
        let peer = Peer::new(
            true,
            addr,
            connection.clone(),
            Arc::new(MeshToken::generate()),
            options.clone(),
            events,
        );
        connection.set_state(peer.clone());

        peer.prepare_link();
        assert!(connection.connect(addr, WAIT).await.unwrap());
        peer.begin_handshake();
        Link {
            options,
            server,
            addr,
            connection,
            peer,
            queue,
        }
    }

    fn pipeline() -> Pipeline {
        let (sink, _) = mpsc::channel(4);
        Pipeline::new(Vec::new(), sink)
    }

    fn note_on(connection: &Connection, link: u64) -> IncomingMessage {
        IncomingMessage {
            connection: connection.clone(),
            message: Arc::new(Note::new("late")),
            received_at: Utc::now(),
            link,
        }
    }

    #[tokio::test]
    async fn test_leftover_from_closed_link_is_dropped() {
        let mut link = handshaking_peer().await;
        let first = link.connection.link_generation().unwrap();
        // let the first Hello be acknowledged before the link goes away
        tokio::time::sleep(Duration::from_millis(100)).await;

        link.connection.disconnect().await;
        link.peer.prepare_link();
        assert!(link.connection.connect(link.addr, WAIT).await.unwrap());
        link.peer.begin_handshake();
        let second = link.connection.link_generation().unwrap();
        assert!(second > first);

        route(note_on(&link.connection, first), &pipeline()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(link.connection.is_connected());
        assert_eq!(link.peer.state(), PeerState::Handshaking);

        // The same message on the live link is a violation
        let closed = link.connection.closed();
        route(note_on(&link.connection, second), &pipeline()).await.unwrap();
        tokio::time::timeout(WAIT, closed).await.unwrap();
        assert!(!link.connection.is_connected());

        link.queue.close();
        link.server.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forged_check_reply_drops_connection() {
        let link = handshaking_peer().await;
        let cancel = CancellationToken::new();
        let router = tokio::spawn(route_loop("test", link.queue, pipeline(), cancel.clone()));

        let remote = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(connection) = link.server.connections().pop() {
                    return connection;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(remote.wait(WAIT).await.unwrap().downcast_ref::<Hello>().is_some());

        let hello = Hello {
            token: MeshToken::generate().public_only(),
            network_id: link.options.network_id.clone(),
            advertised: None,
        };
        let closed = link.connection.closed();
        remote.emit(hello, WAIT).await.unwrap();
        assert!(remote.wait(WAIT).await.unwrap().downcast_ref::<Check>().is_some());

        let forged = CheckReply {
            signature: [7u8; SIGNATURE_LENGTH],
        };
        remote.emit(forged, WAIT).await.unwrap();

        tokio::time::timeout(WAIT, closed).await.unwrap();
        assert!(!link.connection.is_connected());
        assert_ne!(link.peer.state(), PeerState::Connected);
        assert!(link.peer.remote_token().is_none());

        cancel.cancel();
        router.await.unwrap();
        link.server.stop().await.unwrap();
    }
}
