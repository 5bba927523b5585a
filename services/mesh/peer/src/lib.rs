//! Authenticated mesh of peers over acknowledged connections.
//!
//! ## Features
//!
//! - **Mesh tokens**: keypair-backed node identities that sign and verify
//!   handshake challenges
//! - **Handshake**: Hello / Check / CheckReply / Done exchange that proves
//!   each side owns the token it announces and shares the network id
//! - **Local peers**: dialled by this node, redialled on loss up to a retry cap
//! - **Remote peers**: accepted by the listener, dropped when they leave
//! - **Middleware**: ordered chain applied to every application message
//! - **Broadcast**: best-effort fan-out to every connected peer
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_peer::{Mesh, MeshOptions};
//! use mesh_session::ProtocolOptions;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let options = MeshOptions::builder(ProtocolOptions::builder())
//!     .network_id(&b"example"[..])
//!     .peer("10.0.0.2:7400".parse()?)
//!     .build()?;
//!
//! let mesh = Mesh::new(options);
//! mesh.start(Some("0.0.0.0:7400".parse()?))?;
//!
//! let message = mesh.wait(Duration::from_secs(30)).await?;
//! println!("{} sent {:?}", message.peer.address(), message.message);
//! mesh.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod local;
pub mod mesh;
pub mod middleware;
pub mod options;
pub mod peer;
pub mod remote;
pub mod token;

mod router;

#[cfg(test)]
mod test_support;

pub use error::{HandshakeError, PeerError};
pub use handshake::{Check, CheckReply, Done, Hello};
pub use local::LocalPeerManager;
pub use mesh::{Mesh, MeshBroadcast};
pub use middleware::{MeshMessage, Middleware, Next, TraceMiddleware};
pub use options::{
    MeshOptions, MeshOptionsBuilder, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RECONNECT_DELAY,
    DEFAULT_TICK_INTERVAL,
};
pub use peer::{Peer, PeerEvent, PeerState};
pub use remote::RemotePeerManager;
pub use token::MeshToken;
