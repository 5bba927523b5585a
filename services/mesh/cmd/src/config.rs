//! Node configuration.
//!
//! Values come from the `mesh` section of a YAML file, then `MESH_*`
//! environment variables, then command line flags.

use anyhow::{anyhow, Context, Result};
use mesh_wire::ByteOrder;
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Mesh node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Listener address; no listener when unset
    pub listen: Option<SocketAddr>,
    /// Address announced to peers
    pub advertised: Option<SocketAddr>,
    /// Mesh network id
    pub network_id: String,
    /// Peers dialled on start
    pub peers: Vec<SocketAddr>,
    /// Connect, emit and handshake timeout
    pub connection_timeout: Duration,
    /// Wait between reconnection attempts
    pub reconnect_delay: Duration,
    /// Failed attempts before a peer is dropped
    pub max_retries: u32,
    /// Packed integer byte order
    pub byte_order: ByteOrder,
    /// Incoming queue capacity
    pub queue_capacity: usize,
    /// Heartbeat broadcast interval; no heartbeats when unset
    pub heartbeat_interval: Option<Duration>,
    /// Hex-encoded 32-byte private key; a fresh identity when unset
    pub private_key: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: None,
            advertised: None,
            network_id: "default-mesh".to_string(),
            peers: Vec::new(),
            connection_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_retries: 5,
            byte_order: ByteOrder::Little,
            queue_capacity: 1024,
            heartbeat_interval: None,
            private_key: None,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    mesh: Option<FileConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    advertised: Option<SocketAddr>,
    network_id: Option<String>,
    peers: Option<Vec<SocketAddr>>,
    connection_timeout: Option<String>,
    reconnect_delay: Option<String>,
    max_retries: Option<u32>,
    byte_order: Option<ByteOrder>,
    queue_capacity: Option<usize>,
    heartbeat_interval: Option<String>,
    private_key: Option<String>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: '{}'", key, value))
}

impl NodeConfig {
    /// Load from a YAML file, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                if let Some(file) = root.mesh {
                    config.apply_file_config(file)?;
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => warn!("Config file {:?} not found, using defaults", path),
            Err(e) => return Err(e).with_context(|| format!("failed to read config file {:?}", path)),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if file.listen.is_some() {
            self.listen = file.listen;
        }
        if file.advertised.is_some() {
            self.advertised = file.advertised;
        }
        if let Some(network_id) = file.network_id {
            self.network_id = network_id;
        }
        if let Some(peers) = file.peers {
            self.peers = peers;
        }
        if let Some(value) = file.connection_timeout {
            self.connection_timeout = parse_duration("connection_timeout", &value)?;
        }
        if let Some(value) = file.reconnect_delay {
            self.reconnect_delay = parse_duration("reconnect_delay", &value)?;
        }
        if let Some(max_retries) = file.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(byte_order) = file.byte_order {
            self.byte_order = byte_order;
        }
        if let Some(queue_capacity) = file.queue_capacity {
            self.queue_capacity = queue_capacity;
        }
        if let Some(value) = file.heartbeat_interval {
            self.heartbeat_interval = Some(parse_duration("heartbeat_interval", &value)?);
        }
        if file.private_key.is_some() {
            self.private_key = file.private_key;
        }
        Ok(())
    }

    /// Apply `MESH_*` overrides looked up through `var`
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = var("MESH_LISTEN") {
            self.listen = Some(value.parse().with_context(|| format!("invalid MESH_LISTEN '{}'", value))?);
            info!("Listen address overridden by environment: {}", value);
        }
        if let Some(value) = var("MESH_ADVERTISED") {
            self.advertised = Some(
                value
                    .parse()
                    .with_context(|| format!("invalid MESH_ADVERTISED '{}'", value))?,
            );
        }
        if let Some(value) = var("MESH_NETWORK_ID") {
            info!("Network id overridden by environment: {}", value);
            self.network_id = value;
        }
        if let Some(value) = var("MESH_PEERS") {
            self.peers = value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| {
                    entry
                        .parse()
                        .with_context(|| format!("invalid peer in MESH_PEERS: '{}'", entry))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(value) = var("MESH_CONNECTION_TIMEOUT") {
            self.connection_timeout = parse_duration("MESH_CONNECTION_TIMEOUT", &value)?;
        }
        if let Some(value) = var("MESH_MAX_RETRIES") {
            self.max_retries = value
                .parse()
                .map_err(|_| anyhow!("invalid MESH_MAX_RETRIES '{}'", value))?;
        }
        if let Some(value) = var("MESH_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = Some(parse_duration("MESH_HEARTBEAT_INTERVAL", &value)?);
        }
        if let Some(value) = var("MESH_PRIVATE_KEY") {
            self.private_key = Some(value);
        }
        Ok(())
    }

    /// Decode the configured private key
    pub fn private_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.private_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim()).context("private key is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| anyhow!("private key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Some(seed))
    }
}
