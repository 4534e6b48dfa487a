//! tsync-services: the engine's shared state.
//!
//! Peer table, pairing connections, and the TOFU trust store. Everything here
//! is safe to share between the daemon's tasks.

pub mod connection;
pub mod peer;
pub mod trust;

pub use connection::{ConnStatus, Connection, ConnectionRegistry, Transport};
pub use peer::{Peer, PeerData, PeerRegistry};
pub use trust::{TrustDecision, TrustStore};
