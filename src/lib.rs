//! CoinPulse Backend Library
//!
//! Crypto market-data pipeline: a streaming feed consumer and a polling
//! sampler publish ticks onto a shared bus; the ingest loop derives per-asset
//! state, fans updates out to live WebSocket subscribers, and enqueues points
//! for the batched time-series store writer. An aggregation scheduler
//! backfills longer-window metrics from historical pulls.

pub mod aggregator;
pub mod api;
pub mod broadcaster;
pub mod error;
pub mod feeds;
pub mod market;
pub mod models;
pub mod store;
pub mod supervisor;
