//! Connection and server error types.

use mesh_wire::WireError;
use thiserror::Error;

/// Errors reported by connections and servers
#[derive(Error, Debug)]
pub enum SessionError {
    /// `connect` called while a link is already established
    #[error("connection is already established")]
    AlreadyConnected,

    /// Operation needs a live link
    #[error("connection is not established")]
    NotConnected,

    /// Server-accepted connections cannot dial out again
    #[error("server-mode connections cannot reconnect")]
    ServerMode,

    /// Encoding or framing failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Deadline passed before the operation completed
    #[error("operation timed out")]
    Timeout,

    /// Receiver answered with a negative acknowledgement
    #[error("message rejected by receiver")]
    Rejected,

    /// Link went away while waiting for an acknowledgement
    #[error("connection lost while waiting for acknowledgement")]
    ConnectionLost,

    /// `wait` called on a connection or server that does not own its queue
    #[error("incoming queue is not owned by this endpoint")]
    SharedQueueUnavailable,

    /// Incoming queue has been closed
    #[error("incoming queue closed")]
    QueueClosed,

    /// A stopped server's shared queue is still held by a waiter
    #[error("shared queue is still being drained")]
    QueueBusy,

    /// `start` called twice
    #[error("server already started")]
    AlreadyStarted,

    /// Operation needs a running server
    #[error("server not started")]
    NotStarted,

    /// Every destination of a broadcast failed
    #[error("broadcast failed on all {attempted} destinations")]
    BroadcastFailed {
        /// Number of destinations attempted
        attempted: usize,
    },
}
