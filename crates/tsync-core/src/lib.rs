//! tsync-core: shared wire format, registry, config, and cryptographic primitives.
//! All other tsync crates depend on this one.

pub mod config;
pub mod crypto;
pub mod encoding;
pub mod registry;
pub mod wire;

pub use registry::Registry;
