//! tsyncd: LAN discovery and pairing engine.
//!
//! Nodes announce themselves with signed multicast beacons, keep a table of
//! the peers they hear, and pair with a peer by trust-on-first-use followed
//! by an authenticated X25519 key agreement.

pub mod discovery;
pub mod net;
pub mod server;
pub mod session;
pub mod storage;

pub use server::{ChangeCallback, DataCallback, EngineState, Server, ServerConfig, ServerError};
