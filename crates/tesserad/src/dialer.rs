//! Seed dialer.
//!
//! Offers every configured seed peer to the pool on a fixed interval. The
//! pool's arbitration makes repeated offers harmless: a peer with a usable
//! socket is left alone, a dead one gets redialed.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use tessera_core::config::SeedPeer;
use tessera_core::Nonce;
use tessera_peers::{PeerRecord, PoolHandle};

pub struct SeedDialer {
    seeds: Vec<SeedPeer>,
    interval: Duration,
    pool: PoolHandle,
    shutdown: broadcast::Receiver<()>,
}

impl SeedDialer {
    pub fn new(
        seeds: Vec<SeedPeer>,
        interval: Duration,
        pool: PoolHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            seeds,
            interval,
            pool,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        if self.seeds.is_empty() {
            tracing::info!("no seed peers configured");
        }
        let mut interval = tokio::time::interval(self.interval.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("seed dialer shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    tracing::debug!(seeds = self.seeds.len(), "dialer tick");
                    self.offer_seeds().await;
                }
            }
        }
    }

    async fn offer_seeds(&self) {
        for seed in &self.seeds {
            if seed.nonce.is_empty() {
                tracing::warn!(ip = %seed.ip, port = seed.port, "seed has no nonce, skipping");
                continue;
            }
            let record = PeerRecord::new(Nonce::from(seed.nonce.as_str()), seed.ip.as_str(), seed.port);
            if let Err(e) = self.pool.add_peer(record).await {
                tracing::warn!(error = %e, "pool unavailable, seed not offered");
                return;
            }
        }
    }
}
