//! Inbound pairing.
//!
//! Pairing requests and the requester's key share arrive on the engine's
//! unicast socket, the one our beacons are sent from. Replies go back
//! through the same socket to the sender's address.
//!
//! A request never replaces a live connection. The one exception is two
//! nodes asking each other at once: the node whose name sorts first keeps
//! its outbound attempt and the other answers the incoming request instead.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;

use tsync_core::wire::{Message, MAX_DATAGRAM};
use tsync_services::connection::{self, ConnStatus, Connection, Transport};
use tsync_services::{Peer, TrustDecision};

use super::{accept, receive_data, Role};
use crate::server::{Engine, ServerError};

pub(crate) struct SessionListener {
    engine: Arc<Engine>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionListener {
    pub(crate) fn new(engine: Arc<Engine>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { engine, shutdown }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM * 4];
        let socket = self.engine.unicast.clone();

        tracing::info!(addr = %self.engine.local_addr, "session listener starting");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::debug!("session listener shutting down");
                    return;
                }

                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            if let Err(e) = self.handle(&buf[..len], src).await {
                                tracing::warn!(src = %src, error = %e, "pairing message failed");
                            }
                        }
                        Err(_) if self.engine.lifecycle.is_stopped() => return,
                        // Usually an ICMP unreachable from an earlier send
                        Err(e) => tracing::debug!(error = %e, "session recv_from failed"),
                    }
                }
            }
        }
    }

    pub(crate) async fn handle(
        &self,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<(), ServerError> {
        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(
                    src = %src,
                    error = %e,
                    bytes = %hex::encode(&datagram[..datagram.len().min(64)]),
                    "dropping invalid pairing message"
                );
                return Ok(());
            }
        };
        if message.target() != self.engine.name() {
            tracing::debug!(src = %src, target = message.target(), "message not addressed to us");
            return Ok(());
        }

        match message {
            Message::Connect { requester, .. } => self.request(&requester, src).await,
            Message::Data { payload, .. } => {
                let Some((peer, transport)) = self.inbound_from(src) else {
                    tracing::debug!(src = %src, "data from unknown sender, dropped");
                    return Ok(());
                };
                receive_data(&self.engine, &peer, Role::Responder, &transport, &payload).await
            }
            Message::Accept { .. } | Message::Reject { .. } => {
                tracing::debug!(src = %src, "reply on the shared socket, ignored");
                Ok(())
            }
        }
    }

    async fn request(&self, requester: &str, src: SocketAddr) -> Result<(), ServerError> {
        let Some(peer) = self.discovered(requester, src) else {
            tracing::info!(requester, src = %src, "pairing request from undiscovered peer");
            return self.refuse(requester, "unknown peer", src).await;
        };

        if let TrustDecision::Mismatch { pinned } = self.engine.trust.check(&peer) {
            tracing::warn!(
                peer = %peer,
                pinned = %pinned,
                offered = %peer.public_key,
                "pairing request with a changed identity key"
            );
            return self.refuse(requester, "identity changed", src).await;
        }

        let live = self.engine.connections.get(&peer).filter(|c| !c.status.is_terminal());
        if let Some(existing) = live {
            let outbound = matches!(existing.status, ConnStatus::Connecting | ConnStatus::ConnSent);
            if !(outbound && self.yields_to(&peer)) {
                tracing::debug!(
                    peer = %peer,
                    status = %existing.status,
                    remote = %existing.remote,
                    src = %src,
                    "pairing request for a live connection, ignored"
                );
                return Ok(());
            }
            tracing::info!(peer = %peer, "both sides asked at once, answering theirs");
        }

        self.engine.pending.remove(&peer);
        let transport = Transport::shared(self.engine.unicast.clone(), src);
        connection::install(
            &self.engine.connections,
            Connection::inbound(peer.clone(), src, transport),
        );

        if self.engine.trust.accepts_without_asking(&peer) {
            tracing::info!(peer = %peer, "pairing request from trusted peer");
            return accept(&self.engine, &peer).await;
        }
        let human_hash = self
            .engine
            .peers
            .get(&peer)
            .map(|d| d.human_hash)
            .unwrap_or_default();
        tracing::info!(
            peer = %peer,
            human_hash = %human_hash,
            "pairing request awaiting approval"
        );
        Ok(())
    }

    /// Tie-break for simultaneous requests: the lower (name, key) keeps its
    /// own attempt.
    fn yields_to(&self, peer: &Peer) -> bool {
        let me = &self.engine.me;
        (&me.name, &me.public_key) > (&peer.name, &peer.public_key)
    }

    async fn refuse(
        &self,
        requester: &str,
        reason: &str,
        src: SocketAddr,
    ) -> Result<(), ServerError> {
        let reject = Message::Reject {
            target: requester.to_string(),
            reason: reason.to_string(),
        };
        self.engine.send_to(&reject, src).await
    }

    /// The peer table entry for `name` at `src`'s address, most recently
    /// heard from if there are several keys.
    fn discovered(&self, name: &str, src: SocketAddr) -> Option<Peer> {
        self.engine
            .peers
            .snapshot()
            .into_iter()
            .filter(|(peer, _)| peer.name == name && peer.ip == src.ip())
            .max_by_key(|(_, data)| data.last_seen)
            .map(|(peer, _)| peer)
    }

    /// The live inbound connection whose requests came from `src`.
    fn inbound_from(&self, src: SocketAddr) -> Option<(Peer, Transport)> {
        self.engine
            .connections
            .snapshot()
            .into_iter()
            .find(|(_, conn)| {
                conn.remote == src && !conn.status.is_terminal() && !conn.is_outbound()
            })
            .and_then(|(peer, conn)| Some((peer, conn.transport?)))
    }
}
