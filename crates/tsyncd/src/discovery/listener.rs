//! Beacon listener.
//!
//! Joined to the discovery group. Each beacon is verified against the key it
//! carries, then upserted into the peer table unless it is a replay. A beacon
//! carrying our own name and key from another socket means a second instance
//! shares our identity: the one with the lower epoch stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use tsync_core::wire::{Beacon, MAX_DATAGRAM};
use tsync_services::{Peer, PeerData};

use crate::server::Engine;

/// Logged prefix of datagrams that fail to decode.
const LOGGED_BYTES: usize = 64;

pub(crate) struct DiscoveryListener {
    engine: Arc<Engine>,
    socket: UdpSocket,
    shutdown: broadcast::Receiver<()>,
}

impl DiscoveryListener {
    pub(crate) fn new(
        engine: Arc<Engine>,
        socket: UdpSocket,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            socket,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        // Larger than any valid datagram so oversized ones are seen and refused
        let mut buf = vec![0u8; MAX_DATAGRAM * 4];

        tracing::info!(port = self.engine.group.port(), "discovery listener starting");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::debug!("discovery listener shutting down");
                    return;
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle(&buf[..len], src),
                        Err(_) if self.engine.lifecycle.is_stopped() => return,
                        Err(e) => tracing::warn!(error = %e, "discovery recv_from failed"),
                    }
                }
            }
        }
    }

    pub(crate) fn handle(&self, datagram: &[u8], src: SocketAddr) {
        if self.engine.is_own_datagram(src) {
            tracing::trace!("ignoring own beacon");
            return;
        }

        let (beacon, key) = match Beacon::open(datagram) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(
                    src = %src,
                    error = %e,
                    bytes = %hex::encode(&datagram[..datagram.len().min(LOGGED_BYTES)]),
                    "dropping invalid beacon"
                );
                return;
            }
        };

        let candidate = Peer::new(beacon.name, src.ip(), beacon.public_key);
        if self.engine.is_self(&candidate) {
            self.collision(beacon.epoch, src);
            return;
        }

        let now = Instant::now();
        let peers = &self.engine.peers;
        // Entries are keyed without the port, so a peer that restarts (epoch
        // back at 1, new port) stays unseen until its old entry expires.
        let version = match peers.get(&candidate) {
            Some(known) if beacon.epoch <= known.epoch => {
                tracing::debug!(
                    peer = %candidate,
                    epoch = beacon.epoch,
                    known_epoch = known.epoch,
                    "dropping stale beacon"
                );
                return;
            }
            Some(known) => {
                if known.port != src.port() {
                    tracing::info!(
                        peer = %candidate,
                        old_port = known.port,
                        new_port = src.port(),
                        "peer moved to a new port"
                    );
                }
                let data = known.refreshed(src.port(), beacon.epoch, now);
                peers.set(candidate, data)
            }
            None => {
                let data = PeerData::first_seen(&key, src.port(), beacon.epoch, now);
                tracing::info!(
                    peer = %candidate,
                    port = src.port(),
                    human_hash = %data.human_hash,
                    "new peer discovered"
                );
                peers.set(candidate, data)
            }
        };
        self.engine.notify_change(version);
    }

    fn collision(&self, their_epoch: i32, src: SocketAddr) {
        let Some(our_epoch) = self.engine.lifecycle.epoch() else {
            return;
        };
        if our_epoch <= their_epoch {
            tracing::error!(
                src = %src,
                our_epoch,
                their_epoch,
                "an older instance is running with our name and identity, stopping"
            );
            self.engine.lifecycle.halt();
        } else {
            tracing::warn!(
                src = %src,
                our_epoch,
                their_epoch,
                "a newer instance is running with our name and identity"
            );
        }
    }
}
