//! tsync integration test harness.
//!
//! Every test runs real engines in this process, talking over multicast on
//! the loopback interface. Each test uses its own discovery port so tests
//! can run in parallel without hearing each other.
//!
//! Hosts where loopback multicast does not work skip the tests:
//!
//!   cargo test --test integration -- --nocapture

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

use tsync_core::crypto::Identity;
use tsync_services::{ConnStatus, Peer};
use tsyncd::{Server, ServerConfig};

mod discovery;
mod pairing;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Discovery group used by the tests, away from the default one.
pub const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 115, 116);
/// Probing this target selects the loopback interface.
pub const LOOPBACK_TARGET: &str = "127.0.0.1:9";

/// Engine settings for a test node: fast beacons, short timeouts.
pub fn node(name: &str, port: u16) -> ServerConfig {
    node_with_identity(name, port, Arc::new(Identity::generate().expect("identity")))
}

pub fn node_with_identity(name: &str, port: u16, identity: Arc<Identity>) -> ServerConfig {
    let mut config = ServerConfig::new(identity);
    config.name = name.to_string();
    config.port = port;
    config.mcast = GROUP.to_string();
    config.target = LOOPBACK_TARGET.to_string();
    config.interval = Duration::from_millis(100);
    config.jitter = Duration::from_millis(20);
    config.timeout = Duration::from_secs(2);
    config
}

/// Check that a datagram sent to the test group on `port` comes back.
pub async fn multicast_works(port: u16) -> Result<()> {
    let interface = tsyncd::net::probe_interface(LOOPBACK_TARGET)?;
    let listener = UdpSocket::from_std(tsyncd::net::multicast_listener(GROUP, port, interface)?)?;
    let sender = UdpSocket::from_std(tsyncd::net::unicast_socket(interface)?)?;
    sender
        .send_to(b"preflight", SocketAddrV4::new(GROUP, port))
        .await?;

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_millis(500), listener.recv_from(&mut buf))
        .await
        .context("no multicast loopback")??;
    if &buf[..n] != b"preflight" {
        bail!("unexpected preflight datagram");
    }
    Ok(())
}

/// Start one engine per config, or `None` with a SKIP note when this host
/// cannot run them.
pub async fn start_nodes(port: u16, configs: Vec<ServerConfig>) -> Option<Vec<Server>> {
    if let Err(e) = multicast_works(port).await {
        eprintln!("SKIP: loopback multicast unavailable: {e:#}");
        return None;
    }
    let mut servers = Vec::new();
    for config in configs {
        match Server::start(config).await {
            Ok(server) => servers.push(server),
            Err(e) => {
                eprintln!("SKIP: engine failed to start: {e}");
                return None;
            }
        }
    }
    Some(servers)
}

/// Poll `check` every 20ms until it holds or `within` runs out.
pub async fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The entry for `name` in `server`'s peer table.
pub fn find_peer(server: &Server, name: &str) -> Option<Peer> {
    server.peers().keys_sorted(Ord::cmp).find(|p| p.name == name)
}

pub fn status(server: &Server, peer: &Peer) -> Option<ConnStatus> {
    server.connections().get(peer).map(|c| c.status)
}

pub async fn stop_all(servers: &[Server]) {
    for server in servers {
        server.stop().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The preflight itself, so a skipped run is visible in the output.
#[tokio::test]
async fn test_loopback_multicast() {
    match multicast_works(39_100).await {
        Ok(()) => println!("loopback multicast works"),
        Err(e) => eprintln!("SKIP: loopback multicast unavailable: {e:#}"),
    }
}
