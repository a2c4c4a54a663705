//! Streaming price feed consumer.
//!
//! Holds a persistent WebSocket subscription to the CoinCap prices stream and
//! turns each inbound frame into zero or more ticks on the shared tick bus.
//! Connect failures and mid-stream disconnects reconnect with capped
//! exponential backoff plus jitter; downstream consumers only ever observe a
//! gap in ticks, never an error. The tick bus is a bounded broadcast ring, so
//! on overflow the oldest queued tick is dropped in favor of the newest —
//! for price data staleness is worse than a gap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{AssetTick, TickSource};
use crate::supervisor::{LoopState, LoopStatus};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const JITTER_MS: u64 = 500;

pub struct PriceFeedConsumer {
    ws_base: String,
    assets: Vec<String>,
    tick_tx: broadcast::Sender<AssetTick>,
    status: LoopStatus,
}

impl PriceFeedConsumer {
    pub fn new(
        ws_base: String,
        assets: Vec<String>,
        tick_tx: broadcast::Sender<AssetTick>,
        status: LoopStatus,
    ) -> Self {
        Self {
            ws_base: ws_base.trim_end_matches('/').to_string(),
            assets,
            tick_tx,
            status,
        }
    }

    /// Run forever (until shutdown), reconnecting on any failure.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut delay = RECONNECT_BASE;

        loop {
            if *shutdown.borrow() {
                info!("price feed consumer stopping");
                return Ok(());
            }

            match self.connect_and_stream(&mut shutdown, &mut delay).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        info!("price feed consumer stopping");
                        return Ok(());
                    }
                    info!("price stream closed; reconnecting");
                }
                Err(e) => {
                    self.status.set(LoopState::BackingOff);
                    warn!(error = %e, delay = ?delay, "price stream failed; reconnecting");
                }
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MS));
            tokio::select! {
                _ = sleep(delay + jitter) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            delay = (delay * 2).min(RECONNECT_CAP);
        }
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        delay: &mut Duration,
    ) -> Result<()> {
        let url = format!("{}/prices?assets={}", self.ws_base, self.assets.join(","));

        let (ws_stream, response) = connect_async(&url)
            .await
            .context("failed to connect to price stream")?;

        info!(status = %response.status(), assets = self.assets.len(), "🔌 price stream connected");
        self.status.set(LoopState::Running);
        *delay = RECONNECT_BASE;

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame(&text, Utc::now().timestamp_millis()) {
                            Ok(ticks) => {
                                for tick in ticks {
                                    // Err only means no receiver is attached.
                                    let _ = self.tick_tx.send(tick);
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping unparseable stream frame"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to send pong")?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "price stream closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("price stream read error"),
                    None => anyhow::bail!("price stream ended"),
                },
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Decode one stream frame: a JSON object mapping asset id to a decimal price
/// string. A frame-level parse failure is an error; an individual entry with
/// an unparseable price is dropped with a warning, so one frame yields zero
/// or more ticks.
pub fn decode_frame(text: &str, now_ms: i64) -> Result<Vec<AssetTick>, PipelineError> {
    let prices: HashMap<String, String> = serde_json::from_str(text)
        .map_err(|e| PipelineError::MalformedMessage(format!("stream frame: {e}")))?;

    let mut ticks = Vec::with_capacity(prices.len());
    for (asset_id, raw) in prices {
        match raw.parse::<f64>() {
            Ok(price) if price.is_finite() => ticks.push(AssetTick {
                asset_id,
                price,
                observed_at: now_ms,
                source: TickSource::Stream,
            }),
            _ => warn!(asset = %asset_id, raw = %raw, "dropping tick with unparseable price"),
        }
    }
    Ok(ticks)
}
