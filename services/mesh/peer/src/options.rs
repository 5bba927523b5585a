//! Mesh-wide options.

use crate::error::PeerError;
use crate::handshake;
use crate::middleware::Middleware;
use bytes::Bytes;
use mesh_session::{ProtocolOptions, ProtocolOptionsBuilder, DEFAULT_BACKLOG};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default number of failed attempts before a local peer is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default connect and handshake timeout
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait between reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Default cadence of the local peer manager
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Immutable mesh configuration
#[derive(Clone)]
pub struct MeshOptions {
    /// Protocol options, with handshake messages registered
    pub protocol: Arc<ProtocolOptions>,
    /// Address announced to peers; `None` means do not advertise
    pub advertised_address: Option<SocketAddr>,
    /// Opaque network id; peers with a different id are rejected
    pub network_id: Bytes,
    /// Failed attempts before a local peer is removed
    pub max_retries_per_peer: u32,
    /// Peers dialled on start
    pub initial_peers: Vec<SocketAddr>,
    /// Bound on connecting, each emit and the whole handshake
    pub connection_timeout: Duration,
    /// Wait between reconnection attempts
    pub reconnect_delay: Duration,
    /// Local peer manager cadence
    pub tick_interval: Duration,
    /// Listener accept backlog
    pub listen_backlog: u32,
    /// Ordered middleware chain
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl MeshOptions {
    /// Start building with the given protocol options
    pub fn builder(protocol: ProtocolOptionsBuilder) -> MeshOptionsBuilder {
        MeshOptionsBuilder::new(protocol)
    }
}

impl fmt::Debug for MeshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshOptions")
            .field("protocol", &self.protocol)
            .field("advertised_address", &self.advertised_address)
            .field("network_id", &self.network_id)
            .field("max_retries_per_peer", &self.max_retries_per_peer)
            .field("initial_peers", &self.initial_peers)
            .field("connection_timeout", &self.connection_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("tick_interval", &self.tick_interval)
            .field("listen_backlog", &self.listen_backlog)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Builder for [`MeshOptions`]
pub struct MeshOptionsBuilder {
    protocol: ProtocolOptionsBuilder,
    advertised_address: Option<SocketAddr>,
    network_id: Bytes,
    max_retries_per_peer: u32,
    initial_peers: Vec<SocketAddr>,
    connection_timeout: Duration,
    reconnect_delay: Duration,
    tick_interval: Duration,
    listen_backlog: u32,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MeshOptionsBuilder {
    fn new(protocol: ProtocolOptionsBuilder) -> Self {
        Self {
            protocol,
            advertised_address: None,
            network_id: Bytes::new(),
            max_retries_per_peer: DEFAULT_MAX_RETRIES,
            initial_peers: Vec::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            tick_interval: DEFAULT_TICK_INTERVAL,
            listen_backlog: DEFAULT_BACKLOG,
            middleware: Vec::new(),
        }
    }

    /// Address to announce to peers
    pub fn advertised_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.advertised_address = addr;
        self
    }

    /// Mesh network id
    pub fn network_id(mut self, id: impl Into<Bytes>) -> Self {
        self.network_id = id.into();
        self
    }

    /// Failed attempts before a local peer is removed (at least 1)
    pub fn max_retries_per_peer(mut self, retries: u32) -> Self {
        self.max_retries_per_peer = retries.max(1);
        self
    }

    /// Add a peer dialled on start
    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.initial_peers.push(addr);
        self
    }

    /// Add several peers dialled on start
    pub fn peers(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.initial_peers.extend(addrs);
        self
    }

    /// Connect and handshake timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Wait between reconnection attempts
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Local peer manager cadence
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Listener accept backlog
    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Append a middleware module to the chain
    pub fn middleware(mut self, module: Arc<dyn Middleware>) -> Self {
        self.middleware.push(module);
        self
    }

    /// Register the handshake messages and freeze the options
    pub fn build(mut self) -> Result<Arc<MeshOptions>, PeerError> {
        handshake::register(self.protocol.registry_mut())?;
        Ok(Arc::new(MeshOptions {
            protocol: self.protocol.build(),
            advertised_address: self.advertised_address,
            network_id: self.network_id,
            max_retries_per_peer: self.max_retries_per_peer,
            initial_peers: self.initial_peers,
            connection_timeout: self.connection_timeout,
            reconnect_delay: self.reconnect_delay,
            tick_interval: self.tick_interval,
            listen_backlog: self.listen_backlog,
            middleware: self.middleware,
        }))
    }
}
