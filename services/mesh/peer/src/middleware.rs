//! Ordered middleware chain for application traffic.
//!
//! Each module receives the message and a [`Next`] handle. Calling
//! [`Next::run`] passes the (possibly replaced) message to the following
//! module, or to final delivery after the last one. Returning without
//! calling it terminates the chain and drops the message.

use crate::error::PeerError;
use crate::peer::Peer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mesh_wire::Message;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Application message received from an authenticated peer
#[derive(Clone)]
pub struct MeshMessage {
    /// Peer the message came from
    pub peer: Arc<Peer>,
    /// Decoded message
    pub message: Arc<dyn Message>,
    /// Local receive time
    pub received_at: DateTime<Utc>,
}

impl MeshMessage {
    /// Borrow the message as a `T` if it is one
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }
}

impl fmt::Debug for MeshMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshMessage")
            .field("peer", &self.peer.address())
            .field("message", &self.message)
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// One link of the routing chain
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle a message; call `next.run` to continue the chain
    async fn handle(&self, message: MeshMessage, next: Next<'_>) -> Result<(), PeerError>;
}

/// Remainder of the chain after the current module
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    sink: &'a mpsc::Sender<MeshMessage>,
}

impl<'a> Next<'a> {
    /// Pass the message on
    pub async fn run(self, message: MeshMessage) -> Result<(), PeerError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    message,
                    Next {
                        chain: rest,
                        sink: self.sink,
                    },
                )
                .await
            }
            None => self.sink.send(message).await.map_err(|_| PeerError::Closed),
        }
    }
}

/// Middleware list plus final delivery queue
pub(crate) struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
    sink: mpsc::Sender<MeshMessage>,
}

impl Pipeline {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware>>, sink: mpsc::Sender<MeshMessage>) -> Self {
        Self { chain, sink }
    }

    pub(crate) async fn dispatch(&self, message: MeshMessage) -> Result<(), PeerError> {
        Next {
            chain: &self.chain,
            sink: &self.sink,
        }
        .run(message)
        .await
    }
}

/// Logs every routed message at trace level and forwards it
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceMiddleware;

#[async_trait]
impl Middleware for TraceMiddleware {
    async fn handle(&self, message: MeshMessage, next: Next<'_>) -> Result<(), PeerError> {
        trace!(
            "Routing {} from {} ({:?})",
            (*message.message).type_name(),
            message.peer.address(),
            message.peer.remote_token()
        );
        next.run(message).await
    }
}
