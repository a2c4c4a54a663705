//! Buffered background store writer.
//!
//! Producers enqueue points without blocking; the writer task groups the
//! buffer by series key and issues one write per flush interval, independent
//! of ingestion cadence. A rejected or failed batch is logged and dropped —
//! stale retried data has negligible value in a near-real-time feed, so no
//! retry queue is kept.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BatchPoint, TsdbClient};

enum WriterMessage {
    Point(BatchPoint),
    Flush,
    Shutdown,
}

#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<WriterMessage>,
}

impl StoreWriter {
    /// Spawn the writer task. `buffer_size` bounds the enqueue channel.
    pub fn spawn(client: TsdbClient, flush_interval: Duration, buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);

        tokio::spawn(async move {
            run_writer(client, rx, flush_interval).await;
        });

        Self { tx }
    }

    /// Enqueue a point (non-blocking). Dropped with a warning if the channel
    /// is full — the caller's loop must never stall on persistence.
    pub fn record(&self, point: BatchPoint) {
        if let Err(e) = self.tx.try_send(WriterMessage::Point(point)) {
            warn!(error = %e, "store writer queue full; dropping point");
        }
    }

    /// Force a flush of everything buffered so far.
    pub async fn flush(&self) {
        let _ = self.tx.send(WriterMessage::Flush).await;
    }

    /// Final flush, then stop the writer task.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
    }
}

async fn run_writer(
    client: TsdbClient,
    mut rx: mpsc::Receiver<WriterMessage>,
    flush_interval: Duration,
) {
    let mut buffer: Vec<BatchPoint> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMessage::Point(point)) => buffer.push(point),
                Some(WriterMessage::Flush) => flush_buffer(&client, &mut buffer).await,
                Some(WriterMessage::Shutdown) | None => {
                    flush_buffer(&client, &mut buffer).await;
                    info!("store writer shutting down");
                    return;
                }
            },
            _ = ticker.tick() => flush_buffer(&client, &mut buffer).await,
        }
    }
}

async fn flush_buffer(client: &TsdbClient, buffer: &mut Vec<BatchPoint>) {
    if buffer.is_empty() {
        return;
    }

    let count = buffer.len();
    let series = group_points(buffer.drain(..));

    match client.write_batch(&series).await {
        Ok(()) => debug!(points = count, series = series.len(), "flushed batch"),
        Err(e) => {
            // Explicit no-retry policy: the batch is gone.
            warn!(error = %e, dropped = count, "store write failed; batch dropped");
        }
    }
}

/// Group points by series key, each series ordered by timestamp.
pub fn group_points(
    points: impl IntoIterator<Item = BatchPoint>,
) -> HashMap<String, Vec<(i64, f64)>> {
    let mut series: HashMap<String, Vec<(i64, f64)>> = HashMap::new();
    for point in points {
        series
            .entry(point.series_key)
            .or_default()
            .push((point.timestamp_micro, point.value));
    }
    for values in series.values_mut() {
        values.sort_by_key(|(ts, _)| *ts);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(key: &str, ts: i64, value: f64) -> BatchPoint {
        BatchPoint {
            series_key: key.to_string(),
            timestamp_micro: ts,
            value,
        }
    }

    #[test]
    fn grouping_splits_by_key_and_orders_by_timestamp() {
        let grouped = group_points(vec![
            point("crypto|symbol=bitcoin", 2_000_000, 50_100.0),
            point("crypto|symbol=ethereum", 0, 3_000.0),
            point("crypto|symbol=bitcoin", 0, 50_000.0),
        ]);

        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped["crypto|symbol=bitcoin"],
            vec![(0, 50_000.0), (2_000_000, 50_100.0)]
        );
        assert_eq!(grouped["crypto|symbol=ethereum"], vec![(0, 3_000.0)]);
    }

    #[test]
    fn grouping_empty_input_is_empty() {
        let grouped = group_points(Vec::new());
        assert!(grouped.is_empty());
    }
}
