use serde::Serialize;

use crate::feeds::coincap_rest::AssetSnapshotRecord;

/// Where a tick came from. The stream is the primary source; poll samples
/// exist so an asset the stream is silent on still advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSource {
    Stream,
    Poll,
}

/// A single asset_id/price/time observation.
#[derive(Debug, Clone, Serialize)]
pub struct AssetTick {
    pub asset_id: String,
    pub price: f64,
    /// Unix milliseconds.
    pub observed_at: i64,
    pub source: TickSource,
}

/// Events pushed to live WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    /// Full-universe listing from the latest poll cycle.
    Snapshot(Vec<AssetSnapshotRecord>),
    /// A single raw price update.
    Tick(AssetTick),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub coincap_api_base: String,
    pub coincap_ws_base: String,
    pub coincap_api_key: Option<String>,
    /// Assets subscribed on the price stream.
    pub asset_universe: Vec<String>,
    /// `limit` passed to the snapshot endpoint.
    pub snapshot_limit: u32,
    pub poll_secs: u64,
    pub flush_secs: u64,
    pub aggregation_secs: u64,
    pub ema_alpha: f64,
    pub window_secs: u64,
    /// How long an asset may be absent from the polled universe before its
    /// state is evicted.
    pub evict_grace_secs: u64,
    /// First-seen assets backfill at most this far into the past.
    pub backfill_window_secs: u64,
    /// CoinCap interval bucket for historical pulls.
    pub history_interval: String,
    pub tsdb_url: String,
    pub tick_buffer: usize,
    pub broadcast_buffer: usize,
    pub writer_buffer: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let coincap_api_base = std::env::var("COINCAP_API_BASE")
            .unwrap_or_else(|_| "https://api.coincap.io/v2".to_string());

        let coincap_ws_base = std::env::var("COINCAP_WS_BASE")
            .unwrap_or_else(|_| "wss://ws.coincap.io".to_string());

        let coincap_api_key = std::env::var("COINCAP_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let asset_universe = parse_universe(
            &std::env::var("ASSET_UNIVERSE").unwrap_or_else(|_| {
                "bitcoin,ethereum,solana,ripple,cardano,dogecoin".to_string()
            }),
        );

        let snapshot_limit = std::env::var("SNAPSHOT_LIMIT")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);

        let poll_secs = std::env::var("POLL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let flush_secs = std::env::var("FLUSH_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let aggregation_secs = std::env::var("AGGREGATION_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .unwrap_or(900);

        let ema_alpha = std::env::var("EMA_ALPHA")
            .unwrap_or_else(|_| "0.2".to_string())
            .parse()
            .unwrap_or(0.2);

        let window_secs = std::env::var("WINDOW_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86_400);

        let evict_grace_secs = std::env::var("UNIVERSE_EVICT_GRACE_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let backfill_window_secs = std::env::var("BACKFILL_WINDOW_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86_400);

        let history_interval =
            std::env::var("HISTORY_INTERVAL").unwrap_or_else(|_| "m5".to_string());

        let tsdb_url =
            std::env::var("TSDB_URL").unwrap_or_else(|_| "http://localhost:8086".to_string());

        let tick_buffer = std::env::var("TICK_BUFFER")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);

        let broadcast_buffer = std::env::var("BROADCAST_BUFFER")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .unwrap_or(256);

        let writer_buffer = std::env::var("WRITER_BUFFER")
            .unwrap_or_else(|_| "4096".to_string())
            .parse()
            .unwrap_or(4096);

        let config = Self {
            bind_addr,
            coincap_api_base,
            coincap_ws_base,
            coincap_api_key,
            asset_universe,
            snapshot_limit,
            poll_secs,
            flush_secs,
            aggregation_secs,
            ema_alpha,
            window_secs,
            evict_grace_secs,
            backfill_window_secs,
            history_interval,
            tsdb_url,
            tick_buffer,
            broadcast_buffer,
            writer_buffer,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup-fatal checks. Nothing past this point is allowed to kill the
    /// process.
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            anyhow::bail!("EMA_ALPHA must be in (0, 1], got {}", self.ema_alpha);
        }
        if self.asset_universe.is_empty() {
            anyhow::bail!("ASSET_UNIVERSE must name at least one asset");
        }
        if self.coincap_api_base.trim().is_empty() || self.coincap_ws_base.trim().is_empty() {
            anyhow::bail!("no reachable upstream endpoint configured");
        }
        if self.tsdb_url.trim().is_empty() {
            anyhow::bail!("TSDB_URL must not be empty");
        }
        Ok(())
    }
}

pub fn parse_universe(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
