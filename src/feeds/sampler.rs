//! Polling sampler.
//!
//! One fixed-period loop pulls the full-universe snapshot and publishes it to
//! both consumers: the Broadcaster (live fan-out payload) and, replayed as
//! poll-sourced ticks on the tick bus, the AssetState store — redundancy for
//! assets the stream is silent on. A failed cycle is logged and skipped; the
//! next cycle runs on schedule regardless. The sampler also owns grace-period
//! eviction of assets that disappeared from the universe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::feeds::CoinCapRestClient;
use crate::market::AssetStateStore;
use crate::models::{AssetTick, TickSource, WsServerEvent};
use crate::supervisor::{LoopState, LoopStatus};

pub struct SnapshotSampler {
    rest: Arc<CoinCapRestClient>,
    broadcaster: Arc<Broadcaster>,
    tick_tx: broadcast::Sender<AssetTick>,
    market: Arc<AssetStateStore>,
    snapshot_limit: u32,
    period: Duration,
    evict_grace_ms: i64,
    status: LoopStatus,
}

impl SnapshotSampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest: Arc<CoinCapRestClient>,
        broadcaster: Arc<Broadcaster>,
        tick_tx: broadcast::Sender<AssetTick>,
        market: Arc<AssetStateStore>,
        snapshot_limit: u32,
        period: Duration,
        evict_grace: Duration,
        status: LoopStatus,
    ) -> Self {
        Self {
            rest,
            broadcaster,
            tick_tx,
            market,
            snapshot_limit,
            period,
            evict_grace_ms: evict_grace.as_millis() as i64,
            status,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(period = ?self.period, "📡 starting snapshot sampler");

        // Last poll cycle each asset was part of the universe.
        let mut last_seen: HashMap<String, i64> = HashMap::new();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("snapshot sampler stopping");
                    return Ok(());
                }
            }
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.rest.assets(self.snapshot_limit).await {
                Ok(resp) => {
                    self.status.set(LoopState::Running);
                    self.apply_snapshot(resp.data, &mut last_seen);
                }
                Err(e) => {
                    self.status.set(LoopState::BackingOff);
                    warn!(error = %e, "snapshot poll failed; skipping cycle");
                }
            }
        }
    }

    fn apply_snapshot(
        &self,
        records: Vec<crate::feeds::coincap_rest::AssetSnapshotRecord>,
        last_seen: &mut HashMap<String, i64>,
    ) {
        let now_ms = Utc::now().timestamp_millis();

        let delivered = self
            .broadcaster
            .broadcast(WsServerEvent::Snapshot(records.clone()));
        debug!(
            assets = records.len(),
            subscribers = delivered,
            "snapshot broadcast"
        );

        for record in &records {
            last_seen.insert(record.id.clone(), now_ms);

            let Some(price) = record.price() else {
                warn!(asset = %record.id, raw = %record.price_usd, "snapshot price failed to parse; dropped");
                continue;
            };
            let _ = self.tick_tx.send(AssetTick {
                asset_id: record.id.clone(),
                price,
                observed_at: now_ms,
                source: TickSource::Poll,
            });
        }

        // Stream-only assets enter the grace window from the first cycle
        // that fails to see them in the universe.
        for asset_id in self.market.known_assets() {
            last_seen.entry(asset_id).or_insert(now_ms);
        }

        let cutoff = now_ms - self.evict_grace_ms;
        let stale: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for asset_id in stale {
            last_seen.remove(&asset_id);
            if self.market.remove(&asset_id) {
                info!(asset = %asset_id, "evicted state for asset absent from universe");
            }
        }
    }
}
