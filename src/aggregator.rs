//! Aggregation scheduler.
//!
//! A long-period loop that, for each known asset, pulls the bounded slice of
//! history strictly after that asset's backfill cursor, derives
//! high/low/change over the fetched range, and pushes both the raw backfill
//! points and the derived metrics through the store writer. The cursor only
//! advances after a successful cycle for that asset, so partial progress
//! across the universe is preserved and a failed asset is simply retried from
//! the same position next cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::feeds::coincap_rest::{CoinCapRestClient, HistoryPoint};
use crate::market::AssetStateStore;
use crate::store::{build_key, to_store_timestamp, BatchPoint, StoreWriter};
use crate::supervisor::{LoopState, LoopStatus};

/// Seam over the historical pull so cycles can be tested without a network.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(
        &self,
        asset_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<Vec<HistoryPoint>, PipelineError>;
}

#[async_trait]
impl HistorySource for CoinCapRestClient {
    async fn history(
        &self,
        asset_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<Vec<HistoryPoint>, PipelineError> {
        CoinCapRestClient::history(self, asset_id, start_ms, end_ms, interval).await
    }
}

/// Per-asset last-persisted timestamps. Monotonically non-decreasing.
#[derive(Default)]
pub struct BackfillCursors {
    inner: RwLock<HashMap<String, i64>>,
}

impl BackfillCursors {
    pub fn get(&self, asset_id: &str) -> Option<i64> {
        self.inner.read().get(asset_id).copied()
    }

    /// Advance the cursor; a regression attempt is ignored.
    pub fn advance(&self, asset_id: &str, timestamp_ms: i64) {
        let mut inner = self.inner.write();
        let cursor = inner.entry(asset_id.to_string()).or_insert(timestamp_ms);
        if timestamp_ms > *cursor {
            *cursor = timestamp_ms;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.inner.read().clone()
    }
}

pub struct AggregationScheduler {
    source: Arc<dyn HistorySource>,
    market: Arc<AssetStateStore>,
    cursors: Arc<BackfillCursors>,
    writer: StoreWriter,
    period: Duration,
    backfill_window_ms: i64,
    interval_bucket: String,
    status: LoopStatus,
}

impl AggregationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn HistorySource>,
        market: Arc<AssetStateStore>,
        cursors: Arc<BackfillCursors>,
        writer: StoreWriter,
        period: Duration,
        backfill_window: Duration,
        interval_bucket: String,
        status: LoopStatus,
    ) -> Self {
        Self {
            source,
            market,
            cursors,
            writer,
            period,
            backfill_window_ms: backfill_window.as_millis() as i64,
            interval_bucket,
            status,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(period = ?self.period, "🧮 starting aggregation scheduler");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it so the store has
        // a chance to learn some assets first.
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("aggregation scheduler stopping");
                    return Ok(());
                }
            }
            if *shutdown.borrow() {
                return Ok(());
            }

            let (succeeded, failed) = self.run_cycle().await;
            self.status.set(LoopState::Running);
            info!(succeeded, failed, "aggregation cycle complete");
        }
    }

    /// One full pass over the known universe. Continue-on-error per asset.
    pub async fn run_cycle(&self) -> (usize, usize) {
        let now_ms = Utc::now().timestamp_millis();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for asset_id in self.market.known_assets() {
            match self.aggregate_asset(&asset_id, now_ms).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    warn!(asset = %asset_id, error = %e, "aggregation skipped asset; cursor untouched");
                }
            }
        }

        (succeeded, failed)
    }

    async fn aggregate_asset(&self, asset_id: &str, now_ms: i64) -> Result<(), PipelineError> {
        let start_ms = self
            .cursors
            .get(asset_id)
            .map(|cursor| cursor + 1)
            .unwrap_or(now_ms - self.backfill_window_ms);

        let points = self
            .source
            .history(asset_id, start_ms, now_ms, &self.interval_bucket)
            .await
            .map_err(|e| PipelineError::aggregation(asset_id, e))?;

        let mut parsed: Vec<(i64, f64)> = points
            .iter()
            .filter_map(|p| p.price().map(|price| (p.time, price)))
            .collect();
        if parsed.is_empty() {
            return Err(PipelineError::aggregation(asset_id, "empty history window"));
        }
        parsed.sort_by_key(|(ts, _)| *ts);

        let mut high = f64::NEG_INFINITY;
        let mut low = f64::INFINITY;
        for (_, price) in &parsed {
            high = high.max(*price);
            low = low.min(*price);
        }
        let first = parsed[0].1;
        let (max_ts, last) = parsed[parsed.len() - 1];
        let change = last - first;

        for (ts, price) in &parsed {
            self.writer.record(BatchPoint {
                series_key: build_key(asset_id, None),
                timestamp_micro: to_store_timestamp(*ts),
                value: *price,
            });
        }
        let derived_ts = to_store_timestamp(max_ts);
        for (metric, value) in [("24hrHigh", high), ("24hrLow", low), ("24hrChange", change)] {
            self.writer.record(BatchPoint {
                series_key: build_key(asset_id, Some(metric)),
                timestamp_micro: derived_ts,
                value,
            });
        }

        self.cursors.advance(asset_id, max_ts);
        debug!(
            asset = %asset_id,
            points = parsed.len(),
            cursor = max_ts,
            "aggregated historical window"
        );
        Ok(())
    }
}
