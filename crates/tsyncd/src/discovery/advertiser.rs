//! Beacon broadcast and peer expiry.
//!
//! Every `interval + random(0..jitter)` the advertiser advances the epoch,
//! multicasts a signed beacon, then drops peers not heard from within the
//! peer timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::broadcast;

use tsync_core::wire::Beacon;
use tsync_services::peer;

use crate::server::Engine;

pub(crate) struct Advertiser {
    engine: Arc<Engine>,
    shutdown: broadcast::Receiver<()>,
}

impl Advertiser {
    pub(crate) fn new(engine: Arc<Engine>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { engine, shutdown }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(
            group = %self.engine.group,
            interval_ms = self.engine.interval.as_millis() as u64,
            jitter_ms = self.engine.jitter.as_millis() as u64,
            "beacon advertiser starting"
        );

        loop {
            let delay = self.engine.interval + jitter(self.engine.jitter);
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::debug!("beacon advertiser shutting down");
                    return;
                }

                _ = tokio::time::sleep(delay) => {}
            }

            // None: stopped, possibly by exhausting the epoch just now
            let Some(epoch) = self.engine.lifecycle.next_epoch() else {
                return;
            };
            self.announce(epoch).await;
            self.expire();
        }
    }

    async fn announce(&self, epoch: i32) {
        let beacon = Beacon {
            name: self.engine.me.name.clone(),
            public_key: self.engine.me.public_key.clone(),
            epoch,
        };
        let datagram = match beacon.seal(&self.engine.identity) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "failed to build beacon");
                return;
            }
        };
        match self
            .engine
            .unicast
            .send_to(datagram.as_bytes(), self.engine.group)
            .await
        {
            Ok(n) => tracing::trace!(bytes = n, epoch, "beacon sent"),
            Err(_) if self.engine.lifecycle.is_stopped() => {}
            Err(e) => tracing::warn!(error = %e, epoch, "beacon send failed"),
        }
    }

    fn expire(&self) {
        let Some((gone, version)) =
            peer::sweep_expired(&self.engine.peers, self.engine.timeout, Instant::now())
        else {
            return;
        };
        for p in &gone {
            tracing::info!(peer = %p, "peer timed out");
        }
        self.engine.notify_change(version);
    }
}

/// Uniform delay in `0..max`, millisecond resolution.
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
