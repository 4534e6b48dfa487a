//! Discovery and pairing engine.
//!
//! [`Server::start`] binds the sockets and spawns three tasks sharing one
//! [`Engine`]:
//! - the advertiser, which multicasts a signed beacon every interval and
//!   expires silent peers
//! - the discovery listener, which turns beacons into peer table entries
//! - the session listener, which answers pairing requests on the unicast socket
//!
//! Every task selects on one broadcast shutdown channel. The engine stops
//! when [`Server::stop`] is called, when another instance with our identity
//! outlives us, or when the epoch counter would overflow.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tsync_core::config::{self, TsyncConfig};
use tsync_core::crypto::{CryptoError, EphemeralKeyPair, Identity};
use tsync_core::wire::{Beacon, Frame, Message, WireError};
use tsync_services::connection::{self, ConnStatus, ConnectionRegistry};
use tsync_services::peer::{self, Peer, PeerRegistry};
use tsync_services::TrustStore;

use crate::discovery::advertiser::Advertiser;
use crate::discovery::listener::DiscoveryListener;
use crate::net;
use crate::session::{self, initiator, listener::SessionListener};
use crate::storage;

/// Called with the peer registry version after every change to the peer table.
pub type ChangeCallback = Arc<dyn Fn(u64) + Send + Sync>;
/// Called with verified application payloads from paired peers.
pub type DataCallback = Arc<dyn Fn(&Peer, &[u8]) + Send + Sync>;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Engine settings. Zero or empty values fall back to the defaults, except
/// `jitter` where zero means no jitter.
#[derive(Clone)]
pub struct ServerConfig {
    pub identity: Arc<Identity>,
    /// Empty = host name.
    pub name: String,
    pub port: u16,
    pub mcast: String,
    pub target: String,
    pub interval: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
    pub auto_accept: bool,
    pub trusted_peers: Vec<String>,
    /// Pins to start with, usually read from `checked.pub`.
    pub pins: Vec<(String, String)>,
    /// Where to save pins when they change. `None` keeps them in memory.
    pub pins_path: Option<PathBuf>,
    pub on_change: Option<ChangeCallback>,
    pub on_data: Option<DataCallback>,
}

impl ServerConfig {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            name: String::new(),
            port: config::DEFAULT_PORT,
            mcast: config::DEFAULT_MCAST.to_string(),
            target: config::DEFAULT_TARGET.to_string(),
            interval: config::DEFAULT_INTERVAL,
            jitter: config::DEFAULT_JITTER,
            timeout: config::DEFAULT_TIMEOUT,
            auto_accept: false,
            trusted_peers: Vec::new(),
            pins: Vec::new(),
            pins_path: None,
            on_change: None,
            on_data: None,
        }
    }

    pub fn from_config(config: &TsyncConfig, identity: Arc<Identity>) -> Self {
        let network = &config.network;
        Self {
            name: network.name.clone(),
            port: network.port,
            mcast: network.mcast.clone(),
            target: network.target.clone(),
            interval: network.interval(),
            jitter: network.jitter(),
            timeout: network.timeout(),
            auto_accept: config.trust.auto_accept,
            trusted_peers: config.trust.trusted_peers.clone(),
            ..Self::new(identity)
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("mcast", &self.mcast)
            .field("target", &self.target)
            .field("interval", &self.interval)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field("auto_accept", &self.auto_accept)
            .field("pins", &self.pins.len())
            .finish_non_exhaustive()
    }
}

/// `ServerConfig` after defaults and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    name: String,
    group: SocketAddrV4,
    target: String,
    interval: Duration,
    jitter: Duration,
    timeout: Duration,
}

impl Settings {
    fn resolve(config: &ServerConfig) -> Result<Self, ServerError> {
        let name = if config.name.is_empty() {
            hostname::get()
                .map_err(ServerError::Hostname)?
                .into_string()
                .map_err(|_| {
                    ServerError::Hostname(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "host name is not valid UTF-8",
                    ))
                })?
        } else {
            config.name.clone()
        };

        let mcast = if config.mcast.is_empty() {
            config::DEFAULT_MCAST
        } else {
            config
                .mcast
                .parse::<Ipv4Addr>()
                .ok()
                .filter(Ipv4Addr::is_multicast)
                .ok_or_else(|| ServerError::InvalidGroup(config.mcast.clone()))?
        };
        let port = if config.port == 0 {
            config::DEFAULT_PORT
        } else {
            config.port
        };

        Ok(Self {
            name,
            group: SocketAddrV4::new(mcast, port),
            target: non_empty(&config.target, config::DEFAULT_TARGET),
            interval: non_zero(config.interval, config::DEFAULT_INTERVAL),
            jitter: config.jitter,
            timeout: non_zero(config.timeout, config::DEFAULT_TIMEOUT),
        })
    }
}

fn non_empty(value: &str, default: &str) -> String {
    let chosen = if value.is_empty() { default } else { value };
    chosen.to_string()
}

fn non_zero(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Sockets bound, tasks not started yet.
    Idle,
    /// Broadcasting. `epoch` is the number of the last beacon sent.
    Running { epoch: i32 },
    /// Terminal.
    Stopped,
}

/// Engine state plus the shutdown channel that announces `Stopped`.
pub(crate) struct Lifecycle {
    state: Mutex<EngineState>,
    shutdown: broadcast::Sender<()>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            state: Mutex::new(EngineState::Idle),
            shutdown,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// `Idle` to `Running { epoch: 0 }`. No effect in any other state.
    pub(crate) fn begin(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Idle {
            *state = EngineState::Running { epoch: 0 };
        }
    }

    pub(crate) fn epoch(&self) -> Option<i32> {
        match self.state() {
            EngineState::Running { epoch } => Some(epoch),
            _ => None,
        }
    }

    /// Advance the epoch for the next beacon.
    ///
    /// Returns `None` if the engine is not running. Running out of epochs
    /// stops the engine: wrapping would make every peer drop our beacons
    /// as replays.
    pub(crate) fn next_epoch(&self) -> Option<i32> {
        let mut state = self.state.lock();
        let EngineState::Running { epoch } = *state else {
            return None;
        };
        match epoch.checked_add(1) {
            Some(next) => {
                *state = EngineState::Running { epoch: next };
                Some(next)
            }
            None => {
                drop(state);
                tracing::error!(epoch, "epoch counter exhausted, stopping");
                self.halt();
                None
            }
        }
    }

    /// Move to `Stopped` and signal every task. Returns false if already stopped.
    pub(crate) fn halt(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == EngineState::Stopped {
                return false;
            }
            *state = EngineState::Stopped;
        }
        // No receivers left just means every task already exited
        let _ = self.shutdown.send(());
        true
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state() == EngineState::Stopped
    }

    #[cfg(test)]
    fn running_at(epoch: i32) -> Self {
        let lifecycle = Self::new();
        *lifecycle.state.lock() = EngineState::Running { epoch };
        lifecycle
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// State shared by the engine's tasks and the [`Server`] handle.
pub(crate) struct Engine {
    pub(crate) identity: Arc<Identity>,
    /// How we appear in other nodes' peer tables.
    pub(crate) me: Peer,
    /// Unicast socket address, source of our beacons.
    pub(crate) local_addr: SocketAddr,
    pub(crate) interface: Ipv4Addr,
    pub(crate) group: SocketAddrV4,
    pub(crate) interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) timeout: Duration,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) unicast: Arc<UdpSocket>,
    pub(crate) peers: PeerRegistry,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) trust: TrustStore,
    /// Our ephemeral key for each pairing whose key agreement is in flight.
    pub(crate) pending: DashMap<Peer, EphemeralKeyPair>,
    pins_path: Option<PathBuf>,
    /// Held while the pins file is rewritten, so saves land in pin order.
    pins_lock: Mutex<()>,
    on_change: Option<ChangeCallback>,
    on_data: Option<DataCallback>,
}

impl Engine {
    pub(crate) fn name(&self) -> &str {
        &self.me.name
    }

    /// Same name and key as us, from our own address (any address when we
    /// could not resolve one).
    pub(crate) fn is_self(&self, peer: &Peer) -> bool {
        peer.name == self.me.name
            && peer.public_key == self.me.public_key
            && (self.interface.is_unspecified() || peer.ip == self.me.ip)
    }

    /// Whether a datagram came from our own unicast socket.
    pub(crate) fn is_own_datagram(&self, src: SocketAddr) -> bool {
        src.port() == self.local_addr.port()
            && (self.interface.is_unspecified() || src.ip() == self.local_addr.ip())
    }

    pub(crate) fn notify_change(&self, version: u64) {
        if let Some(callback) = &self.on_change {
            callback(version);
        }
    }

    pub(crate) fn deliver(&self, peer: &Peer, data: &[u8]) {
        match &self.on_data {
            Some(callback) => callback(peer, data),
            None => tracing::debug!(peer = %peer, len = data.len(), "data received, no handler"),
        }
    }

    /// Pin `peer`'s key and save the pins, best effort.
    pub(crate) fn pin(&self, peer: &Peer) {
        self.trust.pin(peer);
        if let Some(path) = &self.pins_path {
            let _saving = self.pins_lock.lock();
            if let Err(e) = storage::write_pins(path, &self.trust.list()) {
                tracing::warn!(error = %e, "failed to persist pinned keys");
            }
        }
    }

    pub(crate) async fn send_to(
        &self,
        message: &Message,
        to: SocketAddr,
    ) -> Result<(), ServerError> {
        let datagram = message.encode()?;
        self.unicast.send_to(datagram.as_bytes(), to).await?;
        Ok(())
    }
}

/// Running engine on a loopback unicast socket, without spawned tasks.
#[cfg(test)]
pub(crate) async fn test_engine(name: &str, identity: Arc<Identity>) -> Arc<Engine> {
    test_engine_with(name, identity, None, None).await
}

#[cfg(test)]
pub(crate) async fn test_engine_with(
    name: &str,
    identity: Arc<Identity>,
    on_change: Option<ChangeCallback>,
    on_data: Option<DataCallback>,
) -> Arc<Engine> {
    let unicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let local_addr = unicast.local_addr().unwrap();
    let me = Peer::new(
        name,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        identity.public_key_to_string(),
    );
    let engine = Engine {
        identity,
        me,
        local_addr,
        interface: Ipv4Addr::LOCALHOST,
        group: SocketAddrV4::new(config::DEFAULT_MCAST, config::DEFAULT_PORT),
        interval: config::DEFAULT_INTERVAL,
        jitter: config::DEFAULT_JITTER,
        timeout: config::DEFAULT_TIMEOUT,
        lifecycle: Lifecycle::new(),
        unicast: Arc::new(unicast),
        peers: peer::new_registry(),
        connections: connection::new_registry(),
        trust: TrustStore::new(),
        pending: DashMap::new(),
        pins_path: None,
        pins_lock: Mutex::new(()),
        on_change,
        on_data,
    };
    engine.lifecycle.begin();
    Arc::new(engine)
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Handle to a running engine.
pub struct Server {
    engine: Arc<Engine>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Validate `config`, bind the sockets and start broadcasting.
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let settings = Settings::resolve(&config)?;
        let identity = config.identity.clone();

        // Refuse names that cannot fit in a beacon, before binding anything
        Beacon {
            name: settings.name.clone(),
            public_key: identity.public_key_to_string(),
            epoch: i32::MIN,
        }
        .seal(&identity)?;

        let interface = match net::probe_interface(&settings.target) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(
                    target = %settings.target,
                    error = %e,
                    "could not determine outgoing interface, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        };

        let group = settings.group;
        let multicast = net::multicast_listener(*group.ip(), group.port(), interface)
            .and_then(UdpSocket::from_std)
            .map_err(|source| ServerError::Socket {
                what: "multicast listener",
                source,
            })?;
        let unicast = net::unicast_socket(interface)
            .and_then(UdpSocket::from_std)
            .map_err(|source| ServerError::Socket {
                what: "unicast socket",
                source,
            })?;
        let local_addr = unicast.local_addr().map_err(|source| ServerError::Socket {
            what: "unicast socket",
            source,
        })?;

        let trust = TrustStore::new();
        trust.apply_config(config.auto_accept, &config.trusted_peers);
        trust.extend(config.pins.iter().cloned());

        let me = Peer::new(
            settings.name.clone(),
            IpAddr::V4(interface),
            identity.public_key_to_string(),
        );

        let engine = Arc::new(Engine {
            identity,
            me,
            local_addr,
            interface,
            group: settings.group,
            interval: settings.interval,
            jitter: settings.jitter,
            timeout: settings.timeout,
            lifecycle: Lifecycle::new(),
            unicast: Arc::new(unicast),
            peers: peer::new_registry(),
            connections: connection::new_registry(),
            trust,
            pending: DashMap::new(),
            pins_path: config.pins_path.clone(),
            pins_lock: Mutex::new(()),
            on_change: config.on_change.clone(),
            on_data: config.on_data.clone(),
        });

        tracing::info!(
            name = %engine.name(),
            addr = %local_addr,
            group = %engine.group,
            human_id = %engine.identity.human_id(),
            "tsync engine starting"
        );

        let advertiser = Advertiser::new(engine.clone(), engine.lifecycle.subscribe());
        let discovery =
            DiscoveryListener::new(engine.clone(), multicast, engine.lifecycle.subscribe());
        let sessions = SessionListener::new(engine.clone(), engine.lifecycle.subscribe());

        engine.lifecycle.begin();
        let tasks = vec![
            tokio::spawn(advertiser.run()),
            tokio::spawn(discovery.run()),
            tokio::spawn(sessions.run()),
        ];

        Ok(Self {
            engine,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// Stop every task and close every connection. Safe to call repeatedly,
    /// and after the engine stopped itself.
    pub async fn stop(&self) {
        let halted_now = self.engine.lifecycle.halt();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "engine task panicked");
                }
            }
        }
        connection::close_all(&self.engine.connections);
        self.engine.pending.clear();
        if halted_now {
            tracing::info!(name = %self.engine.name(), "tsync engine stopped");
        }
    }

    /// Whether the engine has stopped, by request or on its own.
    pub fn stopped(&self) -> bool {
        self.engine.lifecycle.is_stopped()
    }

    /// Resolves once the engine has stopped.
    pub async fn wait_stopped(&self) {
        let mut shutdown = self.engine.lifecycle.subscribe();
        if self.stopped() {
            return;
        }
        let _ = shutdown.recv().await;
    }

    pub fn state(&self) -> EngineState {
        self.engine.lifecycle.state()
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Address of the unicast socket peers see our beacons and replies from.
    pub fn our_address(&self) -> SocketAddr {
        self.engine.local_addr
    }

    pub fn human_id(&self) -> String {
        self.engine.identity.human_id()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.engine.peers
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.engine.connections
    }

    pub fn trust(&self) -> &TrustStore {
        &self.engine.trust
    }

    /// Ask `peer` to pair. Completes once its user accepts.
    pub async fn connect_to_peer(&self, peer: &Peer) -> Result<(), ServerError> {
        self.ensure_running()?;
        initiator::connect(&self.engine, peer).await
    }

    /// Accept a pending request from `peer` and start key agreement.
    pub async fn accept_request(&self, peer: &Peer) -> Result<(), ServerError> {
        self.ensure_running()?;
        session::accept(&self.engine, peer).await
    }

    pub async fn reject_request(&self, peer: &Peer, reason: &str) -> Result<(), ServerError> {
        self.ensure_running()?;
        let conn = self
            .engine
            .connections
            .get(peer)
            .ok_or_else(|| ServerError::NoConnection(peer.to_string()))?;
        if conn.status != ConnStatus::Incoming {
            return Err(ServerError::NoPendingRequest {
                peer: peer.to_string(),
                status: conn.status,
            });
        }
        let reject = Message::Reject {
            target: peer.name.clone(),
            reason: reason.to_string(),
        };
        let sent = self.engine.send_to(&reject, conn.remote).await;
        connection::transition(&self.engine.connections, peer, ConnStatus::Failed);
        self.engine.pending.remove(peer);
        tracing::info!(peer = %peer, reason, "pairing request rejected");
        sent
    }

    /// Send a payload to a paired peer, framed under the session key and
    /// signed with our identity.
    pub async fn send_data(&self, peer: &Peer, data: &[u8]) -> Result<(), ServerError> {
        self.ensure_running()?;
        let conn = self
            .engine
            .connections
            .get(peer)
            .ok_or_else(|| ServerError::NoConnection(peer.to_string()))?;
        if conn.status != ConnStatus::Connected {
            return Err(ServerError::NotConnected {
                peer: peer.to_string(),
                status: conn.status,
            });
        }
        let (Some(transport), Some(session)) = (conn.transport, conn.session) else {
            return Err(ServerError::NoConnection(peer.to_string()));
        };
        let frame = Frame::seal(session.key(), session.next_counter(), data);
        let message = Message::Data {
            target: peer.name.clone(),
            payload: self.engine.identity.sign_message(&frame.encode()),
        };
        transport.send(message.encode()?.as_bytes()).await?;
        Ok(())
    }

    /// Close the connection to `peer` and mark it `Disconnected`.
    pub fn disconnect(&self, peer: &Peer) -> Result<(), ServerError> {
        self.engine.pending.remove(peer);
        connection::transition(&self.engine.connections, peer, ConnStatus::Disconnected)
            .map(|_| ())
            .ok_or_else(|| ServerError::NoConnection(peer.to_string()))
    }

    fn ensure_running(&self) -> Result<(), ServerError> {
        match self.state() {
            EngineState::Running { .. } => Ok(()),
            _ => Err(ServerError::NotRunning),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.engine.lifecycle.halt();
        connection::close_all(&self.engine.connections);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not determine host name: {0}")]
    Hostname(#[source] io::Error),

    #[error("{0:?} is not an IPv4 multicast group")]
    InvalidGroup(String),

    #[error("failed to set up {what}: {source}")]
    Socket {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("engine is not running")]
    NotRunning,

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("no connection to {0}")]
    NoConnection(String),

    #[error("no pending request from {peer} (status {status})")]
    NoPendingRequest { peer: String, status: ConnStatus },

    #[error("not connected to {peer} (status {status})")]
    NotConnected { peer: String, status: ConnStatus },

    #[error("frame {counter} from {peer} is not newer than the last one accepted")]
    Replayed { peer: String, counter: u64 },

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("send failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
