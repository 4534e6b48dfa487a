//! Peer table: who is announcing on the local network and when we last heard them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tsync_core::crypto::{human_hash, VerifyingKey};
use tsync_core::Registry;

/// A discovered node. Two beacons describe the same peer only if name, address
/// and key all match.
///
/// Field order defines the display order: name, then IP, then key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    pub name: String,
    /// Source address of its beacons.
    pub ip: IpAddr,
    /// `p.` encoded Ed25519 key.
    pub public_key: String,
}

impl Peer {
    pub fn new(name: impl Into<String>, ip: IpAddr, public_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip,
            public_key: public_key.into(),
        }
    }

    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip, port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.ip)
    }
}

/// Latest beacon seen from a peer. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    /// Fingerprint of the peer's key, computed once on first sight.
    pub human_hash: String,
    /// Unicast port the peer sends from and listens on.
    pub port: u16,
    pub epoch: i32,
    pub last_seen: Instant,
}

impl PeerData {
    pub fn first_seen(key: &VerifyingKey, port: u16, epoch: i32, now: Instant) -> Self {
        Self {
            human_hash: human_hash(key.as_bytes()),
            port,
            epoch,
            last_seen: now,
        }
    }

    /// Data for a fresh beacon from an already known peer.
    pub fn refreshed(&self, port: u16, epoch: i32, now: Instant) -> Self {
        Self {
            human_hash: self.human_hash.clone(),
            port,
            epoch,
            last_seen: now,
        }
    }

    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// The peer registry, shared between the discovery tasks and callers.
pub type PeerRegistry = Arc<Registry<Peer, PeerData>>;

pub fn new_registry() -> PeerRegistry {
    Arc::new(Registry::new())
}

/// Remove every peer silent for longer than `timeout`, in one batch.
///
/// Returns the removed peers and the new registry version, or `None` if
/// nothing had expired (the version is then left untouched).
pub fn sweep_expired(
    peers: &Registry<Peer, PeerData>,
    timeout: Duration,
    now: Instant,
) -> Option<(Vec<Peer>, u64)> {
    let mut expired = Vec::new();
    let _ = peers.all(|peer, data| {
        if data.is_expired(timeout, now) {
            expired.push(peer.clone());
        }
        ControlFlow::Continue(())
    });
    if expired.is_empty() {
        return None;
    }
    let version = peers.delete(&expired);
    Some((expired, version))
}
