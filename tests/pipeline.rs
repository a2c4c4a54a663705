//! Integration tests across the pipeline seams: batched store writes over
//! real HTTP, and sampler recovery after a failed poll cycle.

use std::sync::Arc;
use std::time::Duration;

use mockito::Matcher;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};

use coinpulse_backend::broadcaster::Broadcaster;
use coinpulse_backend::feeds::{CoinCapRestClient, SnapshotSampler};
use coinpulse_backend::market::AssetStateStore;
use coinpulse_backend::models::{AssetTick, TickSource, WsServerEvent};
use coinpulse_backend::store::{build_key, to_store_timestamp, BatchPoint, StoreWriter, TsdbClient};
use coinpulse_backend::supervisor::{LoopStatus, LoopStatusRegistry};

async fn wait_matched(mock: &mockito::Mock) {
    for _ in 0..200 {
        if mock.matched_async().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("mock was never matched");
}

#[tokio::test]
async fn two_ticks_flush_as_one_grouped_batch() {
    let mut server = mockito::Server::new_async().await;
    let write_mock = server
        .mock("POST", "/api/write")
        .match_body(Matcher::Json(json!({
            "crypto|symbol=bitcoin": [[0, 50_000.0], [1_000_000, 50_100.0]]
        })))
        .with_status(204)
        .create_async()
        .await;

    let market = AssetStateStore::new(0.2, Duration::from_secs(86_400));
    // Long flush interval so only the explicit flush triggers a write.
    let writer = StoreWriter::spawn(
        TsdbClient::new(server.url()).unwrap(),
        Duration::from_secs(3600),
        64,
    );

    for (at_ms, price) in [(0i64, 50_000.0), (1_000i64, 50_100.0)] {
        let tick = AssetTick {
            asset_id: "bitcoin".to_string(),
            price,
            observed_at: at_ms,
            source: TickSource::Stream,
        };
        market.update(&tick);
        writer.record(BatchPoint {
            series_key: build_key(&tick.asset_id, None),
            timestamp_micro: to_store_timestamp(tick.observed_at),
            value: tick.price,
        });
    }
    assert_eq!(market.read("bitcoin").unwrap().last_price, 50_100.0);

    writer.flush().await;
    wait_matched(&write_mock).await;
}

#[tokio::test]
async fn sampler_recovers_after_failed_cycle() {
    let mut server = mockito::Server::new_async().await;
    let fail_mock = server
        .mock("GET", "/assets")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("upstream exploded")
        .expect_at_least(1)
        .create_async()
        .await;

    let rest = Arc::new(CoinCapRestClient::new(server.url(), None).unwrap());
    let broadcaster = Arc::new(Broadcaster::new(16));
    let mut sub = broadcaster.subscribe();
    let (tick_tx, mut tick_rx) = broadcast::channel(16);
    let market = Arc::new(AssetStateStore::new(0.2, Duration::from_secs(86_400)));
    let registry = Arc::new(LoopStatusRegistry::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = Arc::new(SnapshotSampler::new(
        rest,
        broadcaster.clone(),
        tick_tx,
        market.clone(),
        500,
        Duration::from_millis(50),
        Duration::from_secs(3600),
        LoopStatus::new("snapshot_sampler", registry),
    ));
    let handle = tokio::spawn(sampler.run(shutdown_rx));

    // At least one cycle fails against the 500 responder.
    wait_matched(&fail_mock).await;

    // Newest mock wins, so subsequent cycles succeed.
    let _ok_mock = server
        .mock("GET", "/assets")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "data": [{
                    "id": "bitcoin",
                    "rank": "1",
                    "symbol": "BTC",
                    "priceUsd": "50000.5",
                    "marketCapUsd": "982000000000.0",
                    "volumeUsd24Hr": "12000000000.0",
                    "changePercent24Hr": "-1.23"
                }],
                "timestamp": 1_700_000_000_000i64
            })
            .to_string(),
        )
        .expect_at_least(1)
        .create_async()
        .await;

    let event = timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("no broadcast after recovery")
        .expect("broadcaster closed");
    match event {
        WsServerEvent::Snapshot(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id, "bitcoin");
            assert_eq!(records[0].price(), Some(50_000.5));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    // The same cycle replays the snapshot onto the tick bus as a poll tick.
    let tick = timeout(Duration::from_secs(5), tick_rx.recv())
        .await
        .expect("no tick after recovery")
        .expect("tick bus closed");
    assert_eq!(tick.asset_id, "bitcoin");
    assert_eq!(tick.price, 50_000.5);
    assert_eq!(tick.source, TickSource::Poll);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
