//! Mesh network node binary.
//!
//! Runs one mesh node: listens for inbound peers, dials the configured
//! peers, authenticates both with the mesh handshake and optionally
//! broadcasts heartbeats to everyone connected.

use anyhow::Context;
use clap::Parser;
use mesh_peer::{Mesh, MeshMessage, MeshOptions, MeshToken, PeerError, PeerEvent, PeerState, TraceMiddleware};
use mesh_session::ProtocolOptions;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod heartbeat;
mod logging;

use config::NodeConfig;
use heartbeat::{Heartbeat, HEARTBEAT};
use logging::MeshLogFormatter;

/// Authenticated mesh node
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Authenticated mesh node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:7400
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Address announced to peers
    #[arg(long)]
    advertise: Option<SocketAddr>,

    /// Mesh network id; peers with another id are rejected
    #[arg(long)]
    network_id: Option<String>,

    /// Peer to dial, e.g. 10.0.0.2:7400 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Heartbeat broadcast interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Connect and handshake timeout, e.g. 5s
    #[arg(long)]
    connection_timeout: Option<humantime::Duration>,

    /// Failed attempts before an outbound peer is dropped
    #[arg(long)]
    max_retries: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply(&self, config: &mut NodeConfig) {
        if self.listen.is_some() {
            config.listen = self.listen;
        }
        if self.advertise.is_some() {
            config.advertised = self.advertise;
        }
        if let Some(network_id) = &self.network_id {
            config.network_id = network_id.clone();
        }
        for peer in &self.connect {
            if !config.peers.contains(peer) {
                config.peers.push(*peer);
            }
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat_interval = Some(interval.into());
        }
        if let Some(timeout) = self.connection_timeout {
            config.connection_timeout = timeout.into();
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
    }
}

fn mesh_options(config: &NodeConfig) -> anyhow::Result<Arc<MeshOptions>> {
    let protocol = ProtocolOptions::builder()
        .byte_order(config.byte_order)
        .queue_capacity(config.queue_capacity)
        .map::<Heartbeat>(HEARTBEAT)?;

    let options = MeshOptions::builder(protocol)
        .network_id(config.network_id.clone().into_bytes())
        .advertised_address(config.advertised)
        .peers(config.peers.iter().copied())
        .connection_timeout(config.connection_timeout)
        .reconnect_delay(config.reconnect_delay)
        .max_retries_per_peer(config.max_retries)
        .middleware(Arc::new(TraceMiddleware))
        .build()?;
    Ok(options)
}

fn log_peer_events(mut events: broadcast::Receiver<PeerEvent>, side: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.current == PeerState::Connected => info!(
                    component = "peers",
                    "{} peer {} connected as {}",
                    side,
                    event.peer.address(),
                    event
                        .peer
                        .remote_token()
                        .map(|token| token.short_id())
                        .unwrap_or_default()
                ),
                Ok(event) => info!(
                    component = "peers",
                    "{} peer {}: {} -> {}",
                    side,
                    event.peer.address(),
                    event.previous,
                    event.current
                ),
                Err(RecvError::Lagged(skipped)) => warn!(component = "peers", "Missed {} peer events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_heartbeats(mesh: Arc<Mesh>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let node = mesh.token().short_id();
        let timeout = mesh.options().connection_timeout;
        let mut ticker = tokio::time::interval(interval);
        let mut sequence = 0u64;

        loop {
            ticker.tick().await;
            sequence += 1;
            let heartbeat = Heartbeat {
                node: node.clone(),
                sequence,
                sent_at: chrono::Utc::now(),
            };
            match mesh.broadcast(Arc::new(heartbeat), timeout).await {
                Ok(sent) => debug!(
                    component = "heartbeat",
                    "Heartbeat {} delivered to {} peers",
                    sequence,
                    sent.peers.len()
                ),
                Err(e) => warn!(component = "heartbeat", "Heartbeat {} failed: {}", sequence, e),
            }
        }
    })
}

fn log_message(message: &MeshMessage) {
    match message.downcast_ref::<Heartbeat>() {
        Some(heartbeat) => info!(
            component = "heartbeat",
            "Heartbeat {} from {} ({}), sent {}",
            heartbeat.sequence,
            heartbeat.node,
            message.peer.address(),
            heartbeat.sent_at
        ),
        None => info!("Message from {}: {:?}", message.peer.address(), message.message),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_peer={}", args.log_level).parse()?)
        .add_directive(format!("mesh_node={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let token = match config.private_key_bytes()? {
        Some(seed) => MeshToken::from_private_key(seed),
        None => {
            warn!("No private key configured; generated a fresh identity");
            MeshToken::generate()
        }
    };
    let options = mesh_options(&config).context("invalid mesh options")?;
    let mesh = Arc::new(Mesh::with_token(options, token));

    let watchers = [
        log_peer_events(mesh.local().subscribe(), "outbound"),
        log_peer_events(mesh.remote().subscribe(), "inbound"),
    ];

    let bound = mesh.start(config.listen)?;
    info!(
        "Node {} in network '{}' listening on {} with {} configured peers",
        mesh.token(),
        config.network_id,
        bound.map_or_else(|| "nothing".to_string(), |addr| addr.to_string()),
        config.peers.len()
    );

    let heartbeats = config
        .heartbeat_interval
        .map(|interval| spawn_heartbeats(mesh.clone(), interval));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            received = mesh.wait(Duration::from_secs(1)) => match received {
                Ok(message) => log_message(&message),
                Err(PeerError::Timeout) => {}
                Err(e) => {
                    warn!("Delivery stopped: {}", e);
                    break;
                }
            },
        }
    }

    if let Some(heartbeats) = heartbeats {
        heartbeats.abort();
    }
    mesh.stop().await;
    for watcher in watchers {
        watcher.abort();
    }
    info!("Mesh node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "mesh",
            "--listen",
            "127.0.0.1:7400",
            "--network-id",
            "cli-net",
            "--connect",
            "10.0.0.2:7400",
            "--connect",
            "10.0.0.3:7400",
            "--heartbeat-interval",
            "2s",
            "--max-retries",
            "7",
        ])
        .unwrap();

        let mut config = NodeConfig {
            peers: vec!["10.0.0.2:7400".parse().unwrap()],
            ..NodeConfig::default()
        };
        args.apply(&mut config);

        assert_eq!(config.listen, Some("127.0.0.1:7400".parse().unwrap()));
        assert_eq!(config.network_id, "cli-net");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(2)));
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_options_register_heartbeat() {
        let options = mesh_options(&NodeConfig::default()).unwrap();
        assert_eq!(options.protocol.registry.name_of::<Heartbeat>(), Some(HEARTBEAT));
        assert_eq!(&options.network_id[..], b"default-mesh");
        assert_eq!(options.middleware.len(), 1);
    }
}
