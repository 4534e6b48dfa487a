//! Configuration system for tsync.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TSYNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tsync/config.toml
//!   3. ~/.config/tsync/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 29556;
pub const DEFAULT_MCAST: Ipv4Addr = Ipv4Addr::new(239, 255, 116, 115);
pub const DEFAULT_TARGET: &str = "8.8.8.8:53";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(1024);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsyncConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub trust: TrustConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `id`, `id.pub` and `checked.pub`.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name announced in beacons. Empty = host name.
    pub name: String,
    /// Multicast discovery port.
    pub port: u16,
    /// Multicast group, must be IPv4 multicast.
    pub mcast: String,
    /// Address used to pick the outgoing interface. Nothing is sent to it.
    pub target: String,
    pub interval_ms: u64,
    /// Upper bound of the random delay added to every interval.
    pub jitter_ms: u64,
    /// Peers silent for longer than this are forgotten.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// If true, accept every pairing request from a discovered peer.
    pub auto_accept: bool,
    /// Peer public keys (`p.` form) whose pairing requests are accepted immediately.
    pub trusted_peers: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            dir: home_dir().join(".tsync"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: DEFAULT_PORT,
            mcast: DEFAULT_MCAST.to_string(),
            target: DEFAULT_TARGET.to_string(),
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            jitter_ms: DEFAULT_JITTER.as_millis() as u64,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tsync")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TsyncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `path`, or defaults if it does not exist. No env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(TsyncConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&TsyncConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply TSYNC_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TSYNC_IDENTITY__DIR") {
            self.identity.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TSYNC_NETWORK__NAME") {
            self.network.name = v;
        }
        if let Some(p) = lookup("TSYNC_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(v) = lookup("TSYNC_NETWORK__MCAST") {
            self.network.mcast = v;
        }
        if let Some(v) = lookup("TSYNC_NETWORK__TARGET") {
            self.network.target = v;
        }
        if let Some(ms) = lookup("TSYNC_NETWORK__INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.network.interval_ms = ms;
        }
        if let Some(ms) = lookup("TSYNC_NETWORK__JITTER_MS").and_then(|v| v.parse().ok()) {
            self.network.jitter_ms = ms;
        }
        if let Some(ms) = lookup("TSYNC_NETWORK__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.network.timeout_ms = ms;
        }
        if let Some(v) = lookup("TSYNC_TRUST__AUTO_ACCEPT") {
            self.trust.auto_accept = v == "true" || v == "1";
        }
    }
}
