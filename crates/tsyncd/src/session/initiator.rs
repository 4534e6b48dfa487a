//! Outbound pairing.
//!
//! Each outbound connection gets its own UDP socket `connect`ed to the peer
//! and a reader task that handles the replies: accept, reject, and the key
//! share that completes pairing.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use tsync_core::wire::{Message, MAX_DATAGRAM};
use tsync_services::connection::{self, ConnStatus, Connection, Transport};
use tsync_services::Peer;

use super::{receive_data, send_key_share, Role};
use crate::net;
use crate::server::{Engine, ServerError};

/// Start pairing with `peer`. Returns once `connect1` is sent.
pub(crate) async fn connect(engine: &Arc<Engine>, peer: &Peer) -> Result<(), ServerError> {
    let data = engine
        .peers
        .get(peer)
        .ok_or_else(|| ServerError::UnknownPeer(peer.to_string()))?;
    let remote = peer.addr(data.port);

    // The user picked this peer by its fingerprint
    engine.pin(peer);

    let socket = net::dedicated_socket(engine.interface, remote)
        .await
        .map_err(|source| ServerError::Socket {
            what: "pairing socket",
            source,
        })?;
    let socket = Arc::new(socket);

    let reader = ConnectionReader::new(
        engine.clone(),
        peer.clone(),
        socket.clone(),
        engine.lifecycle.subscribe(),
    );
    let reader = tokio::spawn(reader.run());
    let transport = Transport::dedicated(socket, remote, reader.abort_handle());

    engine.pending.remove(peer);
    connection::install(
        &engine.connections,
        Connection::outbound(peer.clone(), remote, transport.clone()),
    );

    let request = Message::Connect {
        requester: engine.name().to_string(),
        target: peer.name.clone(),
    };
    let sent = match request.encode() {
        Ok(datagram) => transport.send(datagram.as_bytes()).await.map_err(ServerError::from),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        connection::discard(&engine.connections, peer);
        return Err(e);
    }

    // The reply may already have moved us past Connecting
    engine.connections.update(peer, |conn| {
        (conn.status == ConnStatus::Connecting)
            .then(|| conn.clone().with_status(ConnStatus::ConnSent))
    });
    tracing::info!(peer = %peer, remote = %remote, "pairing request sent");
    Ok(())
}

/// Reads replies on one outbound connection's socket.
pub(crate) struct ConnectionReader {
    engine: Arc<Engine>,
    peer: Peer,
    socket: Arc<UdpSocket>,
    shutdown: broadcast::Receiver<()>,
}

impl ConnectionReader {
    pub(crate) fn new(
        engine: Arc<Engine>,
        peer: Peer,
        socket: Arc<UdpSocket>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            peer,
            socket,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM * 4];
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => return,

                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(len) => {
                            if !self.handle(&buf[..len]).await {
                                return;
                            }
                        }
                        Err(_) if self.engine.lifecycle.is_stopped() => return,
                        Err(e) => {
                            tracing::warn!(
                                peer = %self.peer,
                                error = %e,
                                "pairing connection failed"
                            );
                            self.fail();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns false once the connection is over.
    async fn handle(&self, datagram: &[u8]) -> bool {
        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(
                    peer = %self.peer,
                    error = %e,
                    bytes = %hex::encode(&datagram[..datagram.len().min(64)]),
                    "dropping invalid reply"
                );
                return true;
            }
        };
        if message.target() != self.engine.name() {
            tracing::debug!(
                peer = %self.peer,
                target = message.target(),
                "reply not addressed to us"
            );
            return true;
        }

        let Some(transport) = self.transport() else {
            return false;
        };
        let result = match message {
            Message::Accept { .. } => self.accepted(&transport).await,
            Message::Reject { reason, .. } => {
                tracing::warn!(peer = %self.peer, reason = %reason, "pairing rejected");
                self.fail();
                return false;
            }
            Message::Data { payload, .. } => {
                receive_data(&self.engine, &self.peer, Role::Initiator, &transport, &payload).await
            }
            Message::Connect { .. } => {
                tracing::debug!(peer = %self.peer, "unexpected connect1 on pairing socket");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(peer = %self.peer, error = %e, "pairing reply failed");
        }
        true
    }

    async fn accepted(&self, transport: &Transport) -> Result<(), ServerError> {
        let status = self.engine.connections.get(&self.peer).map(|c| c.status);
        if !matches!(status, Some(ConnStatus::Connecting | ConnStatus::ConnSent)) {
            tracing::debug!(peer = %self.peer, status = ?status, "duplicate accept");
            return Ok(());
        }
        tracing::info!(peer = %self.peer, "pairing accepted");
        send_key_share(&self.engine, &self.peer, transport).await
    }

    fn fail(&self) {
        self.engine.pending.remove(&self.peer);
        connection::transition(&self.engine.connections, &self.peer, ConnStatus::Failed);
    }

    /// This reader's transport, unless its connection was removed or ended.
    fn transport(&self) -> Option<Transport> {
        let conn = self.engine.connections.get(&self.peer)?;
        if conn.status.is_terminal() || !conn.is_outbound() {
            return None;
        }
        conn.transport
    }
}
