//! Trust on first use.
//!
//! A peer name is pinned to the public key the user accepted for it. Later
//! pairing requests under that name are checked against the pin:
//! - Pinned:   same key as before, no questions asked
//! - Unknown:  never pinned, the user has to compare fingerprints
//! - Mismatch: a different key claims a pinned name and is refused
//!
//! Keys listed in config as trusted, or every key when `auto_accept` is on,
//! skip the question for Unknown peers. A Mismatch is refused regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::peer::Peer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Pinned,
    Unknown,
    Mismatch { pinned: String },
}

/// Name to pinned key map plus the config-driven acceptance rules.
///
/// Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct TrustStore {
    pins: Arc<DashMap<String, String>>,
    trusted_keys: Arc<DashMap<String, ()>>,
    auto_accept: Arc<AtomicBool>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply config: auto-accept setting and pre-trusted peer keys.
    pub fn apply_config(&self, auto_accept: bool, trusted_peers: &[String]) {
        self.auto_accept.store(auto_accept, Ordering::Relaxed);
        for key in trusted_peers {
            self.trusted_keys.insert(key.clone(), ());
            tracing::info!(key = %key, "pre-trusted peer from config");
        }
    }

    pub fn check(&self, peer: &Peer) -> TrustDecision {
        match self.pins.get(&peer.name) {
            Some(pinned) if *pinned == peer.public_key => TrustDecision::Pinned,
            Some(pinned) => TrustDecision::Mismatch {
                pinned: pinned.clone(),
            },
            None => TrustDecision::Unknown,
        }
    }

    /// Whether a pairing request from `peer` can be accepted without asking.
    pub fn accepts_without_asking(&self, peer: &Peer) -> bool {
        match self.check(peer) {
            TrustDecision::Pinned => true,
            TrustDecision::Mismatch { .. } => false,
            TrustDecision::Unknown => {
                self.auto_accept.load(Ordering::Relaxed)
                    || self.trusted_keys.contains_key(&peer.public_key)
            }
        }
    }

    /// Pin `peer`'s key under its name. Returns the key it replaced, if different.
    pub fn pin(&self, peer: &Peer) -> Option<String> {
        let previous = self
            .pins
            .insert(peer.name.clone(), peer.public_key.clone())
            .filter(|old| *old != peer.public_key);
        match &previous {
            Some(old) => tracing::warn!(
                peer = %peer.name,
                old = %old,
                new = %peer.public_key,
                "pinned key replaced"
            ),
            None => tracing::debug!(peer = %peer.name, "peer key pinned"),
        }
        previous
    }

    pub fn unpin(&self, name: &str) -> Option<String> {
        self.pins.remove(name).map(|(_, key)| key)
    }

    /// Load pins without logging each one, e.g. from disk.
    pub fn extend(&self, pins: impl IntoIterator<Item = (String, String)>) {
        for (name, key) in pins {
            self.pins.insert(name, key);
        }
    }

    /// All pins, sorted by name.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut pins: Vec<(String, String)> = self
            .pins
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        pins.sort();
        pins
    }
}
