//! TCP connections, receive loops, single-flight emit with ACK, listener and broadcast for mesh.
//!
//! This crate turns raw TCP streams into acknowledged message channels.
//!
//! ## Features
//!
//! - **Connection**: client or server-mode handle with a receive loop that
//!   decodes, queues and acknowledges incoming messages
//! - **Single-flight emit**: concurrent senders are serialised through one
//!   FIFO write slot and each waits for its own correlated acknowledgement
//! - **Server**: accept loop with active-set tracking, accept hook and
//!   best-effort broadcast
//! - **Queue modes**: private, shared or caller-owned incoming queues
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{Connection, ProtocolOptions, Server, DEFAULT_BACKLOG};
//! use mesh_wire::{Message, PackReader, PackWriter, Unpack, WireError};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Note(String);
//!
//! impl Message for Note {
//!     fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
//!         writer.put_str(&self.0)
//!     }
//! }
//!
//! impl Unpack for Note {
//!     fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
//!         Ok(Note(reader.get_str()?))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let options = ProtocolOptions::builder().map::<Note>("example.note")?.build();
//!
//! let server = Server::new(options.clone());
//! let addr = server.start("127.0.0.1:0".parse()?, DEFAULT_BACKLOG)?;
//!
//! let client = Connection::new(options);
//! client.connect(addr, Duration::from_secs(5)).await?;
//! client.emit(Note("hello".into()), Duration::from_secs(5)).await?;
//!
//! let incoming = server.wait(Duration::from_secs(5)).await?;
//! println!("received {:?}", incoming.message);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod options;
pub mod server;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionMode, ConnectionStats, EmitResult,
    IncomingMessage,
};
pub use error::SessionError;
pub use options::{ProtocolOptions, ProtocolOptionsBuilder, DEFAULT_QUEUE_CAPACITY};
pub use server::{AcceptHook, BroadcastResult, Server, ServerEvent};
pub use transport::{connect_tcp, listen_tcp, DEFAULT_BACKLOG};
