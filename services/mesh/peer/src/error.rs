//! Mesh layer error types.

use mesh_session::SessionError;
use mesh_wire::WireError;
use thiserror::Error;

/// Protocol violations detected while authenticating a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Message arrived in a state that does not expect it
    #[error("unexpected handshake message: {0}")]
    Unexpected(&'static str),

    /// Remote belongs to another mesh network
    #[error("mesh network id mismatch")]
    NetworkMismatch,

    /// Remote token is malformed or inconsistent
    #[error("remote token is invalid")]
    InvalidToken,

    /// Remote could not prove ownership of its token
    #[error("challenge signature verification failed")]
    VerificationFailed,

    /// Remote presented this node's own token
    #[error("connected to self")]
    SelfConnection,

    /// Local token cannot sign
    #[error("local token has no private key")]
    Signing,
}

/// Errors reported by the mesh layer
#[derive(Error, Debug)]
pub enum PeerError {
    /// Peer has not completed its handshake
    #[error("peer is not connected")]
    NotConnected,

    /// Token has no private key to sign with
    #[error("token has no private key")]
    NoPrivateKey,

    /// Manager or mesh is shutting down
    #[error("shutting down")]
    ShuttingDown,

    /// `start` called twice
    #[error("already started")]
    AlreadyStarted,

    /// Final delivery queue is closed
    #[error("delivery queue closed")]
    Closed,

    /// Deadline passed
    #[error("operation timed out")]
    Timeout,

    /// Every destination of a broadcast failed
    #[error("broadcast failed on all {attempted} peers")]
    BroadcastFailed {
        /// Number of peers attempted
        attempted: usize,
    },

    /// Handshake protocol violation
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Connection layer failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Encoding failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
