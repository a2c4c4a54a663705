//! CoinPulse backend entrypoint: wires the pipeline together and serves the
//! HTTP/WebSocket API until ctrl-c.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coinpulse_backend::{
    aggregator::{AggregationScheduler, BackfillCursors, HistorySource},
    api::{create_router, AppState},
    broadcaster::Broadcaster,
    feeds::{CoinCapRestClient, PriceFeedConsumer, SnapshotSampler},
    market::{run_tick_ingest, AssetStateStore},
    models::Config,
    store::{StoreWriter, TsdbClient},
    supervisor::{spawn_supervised, LoopStatus, LoopStatusRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 CoinPulse Backend Starting");

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    info!(
        universe = config.asset_universe.len(),
        poll_secs = config.poll_secs,
        aggregation_secs = config.aggregation_secs,
        "configuration loaded"
    );

    let rest = Arc::new(CoinCapRestClient::new(
        config.coincap_api_base.clone(),
        config.coincap_api_key.clone(),
    )?);
    let tsdb = TsdbClient::new(config.tsdb_url.clone())?;
    let writer = StoreWriter::spawn(
        tsdb,
        Duration::from_secs(config.flush_secs),
        config.writer_buffer,
    );

    let market = Arc::new(AssetStateStore::new(
        config.ema_alpha,
        Duration::from_secs(config.window_secs),
    ));
    let broadcaster = Arc::new(Broadcaster::new(config.broadcast_buffer));
    let cursors = Arc::new(BackfillCursors::default());
    let statuses = Arc::new(LoopStatusRegistry::default());

    // Shared tick bus: stream and poll sources in, ingest loop out.
    let (tick_tx, _) = broadcast::channel(config.tick_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_supervised("price_feed", statuses.clone(), shutdown_rx.clone(), {
        let config = config.clone();
        let tick_tx = tick_tx.clone();
        let statuses = statuses.clone();
        let shutdown = shutdown_rx.clone();
        move || {
            let consumer = Arc::new(PriceFeedConsumer::new(
                config.coincap_ws_base.clone(),
                config.asset_universe.clone(),
                tick_tx.clone(),
                LoopStatus::new("price_feed", statuses.clone()),
            ));
            consumer.run(shutdown.clone())
        }
    });

    spawn_supervised("tick_ingest", statuses.clone(), shutdown_rx.clone(), {
        let tick_tx = tick_tx.clone();
        let market = market.clone();
        let writer = writer.clone();
        let broadcaster = broadcaster.clone();
        let statuses = statuses.clone();
        let shutdown = shutdown_rx.clone();
        move || {
            run_tick_ingest(
                tick_tx.subscribe(),
                market.clone(),
                writer.clone(),
                broadcaster.clone(),
                LoopStatus::new("tick_ingest", statuses.clone()),
                shutdown.clone(),
            )
        }
    });

    spawn_supervised("snapshot_sampler", statuses.clone(), shutdown_rx.clone(), {
        let config = config.clone();
        let rest = rest.clone();
        let broadcaster = broadcaster.clone();
        let tick_tx = tick_tx.clone();
        let market = market.clone();
        let statuses = statuses.clone();
        let shutdown = shutdown_rx.clone();
        move || {
            let sampler = Arc::new(SnapshotSampler::new(
                rest.clone(),
                broadcaster.clone(),
                tick_tx.clone(),
                market.clone(),
                config.snapshot_limit,
                Duration::from_secs(config.poll_secs),
                Duration::from_secs(config.evict_grace_secs),
                LoopStatus::new("snapshot_sampler", statuses.clone()),
            ));
            sampler.run(shutdown.clone())
        }
    });

    spawn_supervised("aggregation", statuses.clone(), shutdown_rx.clone(), {
        let config = config.clone();
        let rest = rest.clone();
        let market = market.clone();
        let cursors = cursors.clone();
        let writer = writer.clone();
        let statuses = statuses.clone();
        let shutdown = shutdown_rx.clone();
        move || {
            let scheduler = Arc::new(AggregationScheduler::new(
                rest.clone() as Arc<dyn HistorySource>,
                market.clone(),
                cursors.clone(),
                writer.clone(),
                Duration::from_secs(config.aggregation_secs),
                Duration::from_secs(config.backfill_window_secs),
                config.history_interval.clone(),
                LoopStatus::new("aggregation", statuses.clone()),
            ));
            scheduler.run(shutdown.clone())
        }
    });

    let app = create_router(AppState {
        config: config.clone(),
        rest,
        market,
        broadcaster,
        statuses,
    });

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    // Final flush so in-buffer points survive shutdown.
    writer.shutdown().await;
    info!("👋 CoinPulse Backend stopped");

    Ok(())
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinpulse_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the manifest-dir .env (common when running with
    //    --manifest-path from elsewhere)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
