//! Tick ingest loop.
//!
//! The single consumer of the tick bus: applies every tick to the AssetState
//! store, enqueues the raw price and the refreshed EMA for persistence, and
//! fans the raw update out to live subscribers. Per-asset ordering within a
//! source is preserved because this loop applies ticks in bus order; stream
//! and poll ticks racing on the same asset only guarantee atomicity, not
//! cross-source order.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::models::{AssetTick, WsServerEvent};
use crate::store::{build_key, to_store_timestamp, BatchPoint, StoreWriter};
use crate::supervisor::{LoopState, LoopStatus};

use super::AssetStateStore;

pub async fn run_tick_ingest(
    mut ticks: broadcast::Receiver<AssetTick>,
    market: Arc<AssetStateStore>,
    writer: StoreWriter,
    broadcaster: Arc<Broadcaster>,
    status: LoopStatus,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("starting tick ingest");

    loop {
        tokio::select! {
            received = ticks.recv() => match received {
                Ok(tick) => {
                    status.set(LoopState::Running);
                    market.update(&tick);

                    writer.record(BatchPoint {
                        series_key: build_key(&tick.asset_id, None),
                        timestamp_micro: to_store_timestamp(tick.observed_at),
                        value: tick.price,
                    });
                    if let Some(state) = market.read(&tick.asset_id) {
                        writer.record(BatchPoint {
                            series_key: build_key(&tick.asset_id, Some("ema")),
                            timestamp_micro: to_store_timestamp(tick.observed_at),
                            value: state.ema_price,
                        });
                    }

                    broadcaster.broadcast(WsServerEvent::Tick(tick));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Bounded bus overflowed: oldest ticks were discarded in
                    // favor of the newest (last-value-wins).
                    warn!(dropped = n, "tick bus overflow; oldest ticks dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("tick bus closed; ingest stopping");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => {
                info!("tick ingest stopping");
                return Ok(());
            }
        }
    }
}
