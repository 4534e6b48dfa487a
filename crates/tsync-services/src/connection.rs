//! Pairing connections, one per peer.
//!
//! ```text
//! outbound:  Connecting ─▶ ConnSent ─▶ Connected
//! inbound:   Incoming ─▶ Connected
//! any non-terminal state ─▶ Failed | Disconnected
//! ```
//!
//! A connection owns its [`Transport`]. Whoever replaces or removes an entry
//! must close the transport it got back, which is what the helpers below do.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tsync_core::crypto::SessionKey;
use tsync_core::Registry;

use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    /// Transport bound, request not yet sent.
    Connecting,
    /// `connect1` sent, waiting for the remote user.
    ConnSent,
    /// Request received, waiting for the local user.
    Incoming,
    /// Both sides derived the session key.
    Connected,
    Failed,
    Disconnected,
}

impl ConnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnStatus::Failed | ConnStatus::Disconnected)
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnStatus::Connecting => "connecting",
            ConnStatus::ConnSent => "sent",
            ConnStatus::Incoming => "incoming",
            ConnStatus::Connected => "connected",
            ConnStatus::Failed => "failed",
            ConnStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// The socket a connection talks through.
///
/// Outbound connections own a dedicated socket connected to the peer and a
/// reader task; inbound ones borrow the engine's shared unicast socket and
/// address each datagram explicitly.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    dedicated: bool,
    reader: Option<AbortHandle>,
}

impl Transport {
    /// Dedicated socket, already `connect`ed to `remote`, read by `reader`.
    pub fn dedicated(socket: Arc<UdpSocket>, remote: SocketAddr, reader: AbortHandle) -> Self {
        Self {
            socket,
            remote,
            dedicated: true,
            reader: Some(reader),
        }
    }

    /// Shared socket, replies addressed to `remote`.
    pub fn shared(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            dedicated: false,
            reader: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        if self.dedicated {
            self.socket.send(datagram).await
        } else {
            self.socket.send_to(datagram, self.remote).await
        }
    }

    /// Stop the reader task. The socket itself closes when the last clone
    /// of this transport is dropped. Safe to call more than once.
    pub fn close(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote", &self.remote)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Key and frame counters of an established pairing.
///
/// Shared by every clone of the connection, so counters survive registry
/// updates.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Counter for the next outgoing frame. The first is 1.
    pub fn next_counter(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record an incoming frame counter. False if it is not above every
    /// counter accepted so far.
    pub fn accept_counter(&self, counter: u64) -> bool {
        self.received.fetch_max(counter, Ordering::AcqRel) < counter
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: Peer,
    pub status: ConnStatus,
    pub created: Instant,
    pub remote: SocketAddr,
    pub transport: Option<Transport>,
    pub session: Option<Arc<Session>>,
}

impl Connection {
    pub fn outbound(peer: Peer, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            peer,
            status: ConnStatus::Connecting,
            created: Instant::now(),
            remote,
            transport: Some(transport),
            session: None,
        }
    }

    pub fn inbound(peer: Peer, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            peer,
            status: ConnStatus::Incoming,
            created: Instant::now(),
            remote,
            transport: Some(transport),
            session: None,
        }
    }

    pub fn with_status(mut self, status: ConnStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_outbound(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.dedicated)
    }

    fn close(&self) {
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }
}

// ── Registry helpers ──────────────────────────────────────────────────────────

pub type ConnectionRegistry = Arc<Registry<Peer, Connection>>;

pub fn new_registry() -> ConnectionRegistry {
    Arc::new(Registry::new())
}

/// Store `conn`, closing the transport of any connection it replaces.
pub fn install(connections: &Registry<Peer, Connection>, conn: Connection) -> u64 {
    let (old, version) = connections.replace(conn.peer.clone(), conn);
    if let Some(old) = old {
        old.close();
    }
    version
}

/// Remove the connection for `peer` and close its transport.
pub fn discard(connections: &Registry<Peer, Connection>, peer: &Peer) -> u64 {
    let (old, version) = connections.remove(peer);
    if let Some(old) = old {
        old.close();
    }
    version
}

/// Move `peer`'s connection to `status`. Terminal states close the transport.
///
/// Returns `None` if there is no connection or it already ended.
pub fn transition(
    connections: &Registry<Peer, Connection>,
    peer: &Peer,
    status: ConnStatus,
) -> Option<u64> {
    let version = connections.update(peer, |conn| {
        if conn.status.is_terminal() {
            return None;
        }
        Some(conn.clone().with_status(status))
    })?;
    if status.is_terminal() {
        if let Some(conn) = connections.get(peer) {
            conn.close();
        }
    }
    Some(version)
}

/// Record the agreed session key and mark the connection `Connected`.
pub fn establish(
    connections: &Registry<Peer, Connection>,
    peer: &Peer,
    key: SessionKey,
) -> Option<u64> {
    let session = Arc::new(Session::new(key));
    connections.update(peer, |conn| {
        if conn.status.is_terminal() {
            return None;
        }
        let mut next = conn.clone().with_status(ConnStatus::Connected);
        next.session = Some(session);
        Some(next)
    })
}

/// Close every transport. Used on shutdown.
pub fn close_all(connections: &Registry<Peer, Connection>) {
    for (_, conn) in connections.snapshot() {
        conn.close();
    }
}
