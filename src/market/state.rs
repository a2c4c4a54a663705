//! Per-asset smoothed and windowed metrics.
//!
//! One `AssetState` per known asset id, created on first tick. Writes are
//! serialized per asset behind that asset's own lock; the registry lock is
//! only held long enough to find the entry, so unrelated assets never contend
//! and readers always get a fully consistent copy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::models::AssetTick;

#[derive(Debug, Clone, Serialize)]
pub struct AssetState {
    pub asset_id: String,
    pub last_price: f64,
    /// `ema' = alpha * price + (1 - alpha) * ema`; initialized to the first
    /// observed price and never reset mid-stream.
    pub ema_price: f64,
    /// Unix milliseconds of the last applied tick.
    pub last_update: i64,
    /// Trailing window of (timestamp_ms, price), oldest first.
    #[serde(skip_serializing)]
    pub window: VecDeque<(i64, f64)>,
    pub high_24h: f64,
    pub low_24h: f64,
    pub change_24h: f64,
    pub change_pct_24h: f64,
}

impl AssetState {
    fn new(tick: &AssetTick) -> Self {
        Self {
            asset_id: tick.asset_id.clone(),
            last_price: tick.price,
            ema_price: tick.price,
            last_update: tick.observed_at,
            window: VecDeque::from([(tick.observed_at, tick.price)]),
            high_24h: tick.price,
            low_24h: tick.price,
            change_24h: 0.0,
            change_pct_24h: 0.0,
        }
    }
}

pub struct AssetStateStore {
    assets: RwLock<HashMap<String, Arc<Mutex<AssetState>>>>,
    alpha: f64,
    window_ms: i64,
}

impl AssetStateStore {
    pub fn new(alpha: f64, window: Duration) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            alpha,
            window_ms: window.as_millis() as i64,
        }
    }

    /// Apply one tick. Updates for the same asset are serialized by the
    /// per-asset lock; updates for different assets proceed in parallel.
    pub fn update(&self, tick: &AssetTick) {
        let entry = self.entry(tick);
        let Some(entry) = entry else {
            return; // freshly created from this tick, nothing else to fold in
        };

        let mut state = entry.lock();
        state.ema_price = self.alpha * tick.price + (1.0 - self.alpha) * state.ema_price;
        state.last_price = tick.price;
        state.last_update = state.last_update.max(tick.observed_at);
        state.window.push_back((tick.observed_at, tick.price));

        let cutoff = state.last_update - self.window_ms;
        while state.window.front().is_some_and(|(ts, _)| *ts < cutoff) {
            state.window.pop_front();
        }

        let mut high = f64::NEG_INFINITY;
        let mut low = f64::INFINITY;
        for (_, price) in &state.window {
            high = high.max(*price);
            low = low.min(*price);
        }
        state.high_24h = high;
        state.low_24h = low;

        let earliest = state.window.front().map(|(_, p)| *p).unwrap_or(tick.price);
        let latest = state.window.back().map(|(_, p)| *p).unwrap_or(tick.price);
        state.change_24h = latest - earliest;
        state.change_pct_24h = if earliest != 0.0 {
            (latest - earliest) / earliest * 100.0
        } else {
            0.0
        };
    }

    /// Consistent snapshot, or `None` for an unknown asset.
    pub fn read(&self, asset_id: &str) -> Option<AssetState> {
        let entry = self.assets.read().get(asset_id).cloned()?;
        let state = entry.lock();
        Some(state.clone())
    }

    pub fn known_assets(&self) -> Vec<String> {
        self.assets.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }

    /// Grace-period eviction only; returns whether the asset existed.
    pub fn remove(&self, asset_id: &str) -> bool {
        self.assets.write().remove(asset_id).is_some()
    }

    /// Find the asset's entry, creating it from this tick on first sight.
    /// Returns `None` when the tick itself seeded the state.
    fn entry(&self, tick: &AssetTick) -> Option<Arc<Mutex<AssetState>>> {
        if let Some(entry) = self.assets.read().get(&tick.asset_id) {
            return Some(entry.clone());
        }

        let mut assets = self.assets.write();
        // Re-check under the write lock: another writer may have raced us.
        if let Some(entry) = assets.get(&tick.asset_id) {
            return Some(entry.clone());
        }
        assets.insert(
            tick.asset_id.clone(),
            Arc::new(Mutex::new(AssetState::new(tick))),
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickSource;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn store() -> AssetStateStore {
        AssetStateStore::new(0.2, Duration::from_secs(86_400))
    }

    fn tick(asset: &str, price: f64, at_ms: i64) -> AssetTick {
        AssetTick {
            asset_id: asset.to_string(),
            price,
            observed_at: at_ms,
            source: TickSource::Stream,
        }
    }

    #[test]
    fn ema_recursion_matches_reference_sequence() {
        let store = store();
        let expected = [100.0, 100.4, 99.92];

        for (i, price) in [100.0, 102.0, 98.0].into_iter().enumerate() {
            store.update(&tick("bitcoin", price, i as i64 * 1000));
            let state = store.read("bitcoin").unwrap();
            assert!(
                (state.ema_price - expected[i]).abs() < 1e-9,
                "ema after tick {i}: {} != {}",
                state.ema_price,
                expected[i]
            );
        }
    }

    #[test]
    fn first_tick_initializes_ema_to_price() {
        let store = store();
        store.update(&tick("ethereum", 3_000.0, 0));
        let state = store.read("ethereum").unwrap();
        assert_eq!(state.ema_price, 3_000.0);
        assert_eq!(state.last_price, 3_000.0);
        assert_eq!(state.window.len(), 1);
    }

    #[test]
    fn window_evicts_entries_older_than_24h() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        store.update(&tick("bitcoin", 110.0, DAY_MS - 1000));
        assert_eq!(store.read("bitcoin").unwrap().window.len(), 2);

        // Crossing the cutoff drops the first observation.
        store.update(&tick("bitcoin", 120.0, DAY_MS + 1000));
        let state = store.read("bitcoin").unwrap();
        assert_eq!(state.window.len(), 2);
        assert!(state.window.iter().all(|(ts, _)| *ts >= state.last_update - DAY_MS));
        assert_eq!(state.window.front().unwrap().1, 110.0);
    }

    #[test]
    fn high_low_change_cover_remaining_window() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        store.update(&tick("bitcoin", 130.0, 1000));
        store.update(&tick("bitcoin", 110.0, 2000));

        let state = store.read("bitcoin").unwrap();
        assert_eq!(state.high_24h, 130.0);
        assert_eq!(state.low_24h, 100.0);
        assert_eq!(state.change_24h, 10.0);
        assert!((state.change_pct_24h - 10.0).abs() < 1e-9);
    }

    #[test]
    fn change_recomputed_after_eviction() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        store.update(&tick("bitcoin", 200.0, DAY_MS + 1000));
        let state = store.read("bitcoin").unwrap();
        // Only the new point remains, so there is no change to measure.
        assert_eq!(state.window.len(), 1);
        assert_eq!(state.change_24h, 0.0);
    }

    #[test]
    fn assets_are_independent() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        store.update(&tick("ethereum", 3_000.0, 0));
        store.update(&tick("bitcoin", 102.0, 1000));

        assert!((store.read("bitcoin").unwrap().ema_price - 100.4).abs() < 1e-9);
        assert_eq!(store.read("ethereum").unwrap().ema_price, 3_000.0);

        let mut known = store.known_assets();
        known.sort();
        assert_eq!(known, vec!["bitcoin", "ethereum"]);
    }

    #[test]
    fn read_returns_detached_snapshot() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        let before = store.read("bitcoin").unwrap();
        store.update(&tick("bitcoin", 200.0, 1000));
        assert_eq!(before.last_price, 100.0);
        assert_eq!(store.read("bitcoin").unwrap().last_price, 200.0);
    }

    #[test]
    fn remove_evicts_state() {
        let store = store();
        store.update(&tick("bitcoin", 100.0, 0));
        assert!(store.remove("bitcoin"));
        assert!(!store.remove("bitcoin"));
        assert!(store.read("bitcoin").is_none());
        assert!(store.is_empty());
    }
}
