//! tsyncd: discovery and pairing daemon.
//!
//! Usage: `tsyncd [peer-name]`. With a peer name, pairs with the first peer
//! of that name once it is discovered.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use tsync_core::config::TsyncConfig;
use tsync_services::{Peer, PeerRegistry};
use tsyncd::storage::{self, Storage};
use tsyncd::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TsyncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TsyncConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TsyncConfig::default()
    });

    // Identity and pinned keys
    let storage = Storage::open(config.identity.dir.clone())
        .context("failed to open identity directory")?;
    let identity = storage
        .load_or_create_identity()
        .context("failed to load identity")?;
    let pins_path = storage.pins_path();
    let pins = storage::read_pins(&pins_path).context("failed to read pinned keys")?;
    tracing::info!(
        dir = %storage.dir().display(),
        human_id = %identity.human_id(),
        pins = pins.len(),
        "identity ready"
    );
    if config.trust.auto_accept {
        tracing::warn!("auto-accept enabled, every pairing request will be accepted");
    }

    let (changes_tx, changes_rx) = watch::channel(0u64);
    let mut server_config = ServerConfig::from_config(&config, Arc::new(identity));
    server_config.pins = pins;
    server_config.pins_path = Some(pins_path);
    server_config.on_change = Some(Arc::new(move |version| {
        let _ = changes_tx.send(version);
    }));
    server_config.on_data = Some(Arc::new(|peer: &Peer, data: &[u8]| {
        tracing::info!(peer = %peer, data = %String::from_utf8_lossy(data), "data received");
    }));

    let server = Arc::new(Server::start(server_config).await.context("failed to start engine")?);
    let wanted = std::env::args().nth(1);
    tokio::spawn(watch_peers(server.clone(), changes_rx, wanted));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown signal received");
        }
        _ = server.wait_stopped() => {
            tracing::warn!("engine stopped on its own");
        }
    }
    server.stop().await;
    Ok(())
}

/// Log the peer table whenever it changes, and pair with `wanted` once it
/// shows up.
async fn watch_peers(
    server: Arc<Server>,
    mut changes: watch::Receiver<u64>,
    mut wanted: Option<String>,
) {
    while changes.changed().await.is_ok() {
        let version = *changes.borrow_and_update();
        log_peers(server.peers(), version);

        let Some(name) = wanted.as_deref() else {
            continue;
        };
        let Some(peer) = server.peers().keys_sorted(Ord::cmp).find(|p| p.name == name) else {
            continue;
        };
        match server.connect_to_peer(&peer).await {
            Ok(()) => {
                tracing::info!(peer = %peer, "pairing requested");
                wanted = None;
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "pairing request failed"),
        }
    }
}

fn log_peers(peers: &PeerRegistry, version: u64) {
    tracing::info!(version, count = peers.len(), "peer table changed");
    for (peer, data) in peers.natural_sort() {
        tracing::info!(
            peer = %peer,
            port = data.port,
            epoch = data.epoch,
            human_hash = %data.human_hash,
            "  peer"
        );
    }
}
