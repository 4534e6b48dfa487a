//! Multicast discovery: signed beacons out, peer table in.
//!
//! A beacon is `tsync1 "<name>" <key> e <epoch>` wrapped in an envelope
//! signed by the key it announces. The epoch increases by one per beacon, so
//! receivers can drop replays and two instances sharing an identity can tell
//! which of them has been running longer.

pub mod advertiser;
pub mod listener;
