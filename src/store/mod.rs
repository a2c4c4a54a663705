//! Persistence toward the external time-series store.
//!
//! Callers enqueue [`BatchPoint`]s; a background writer groups them by series
//! key and issues one network write per flush interval. Acceptance is
//! all-or-nothing per write and failed batches are dropped, never retried.

pub mod keys;
pub mod tsdb;
pub mod writer;

pub use keys::{build_key, to_store_timestamp};
pub use tsdb::TsdbClient;
pub use writer::StoreWriter;

/// The unit the store writer persists.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPoint {
    pub series_key: String,
    pub timestamp_micro: i64,
    pub value: f64,
}
