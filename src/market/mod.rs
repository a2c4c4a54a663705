//! Per-asset derived state and the tick ingest loop that feeds it.

pub mod ingest;
pub mod state;

pub use ingest::run_tick_ingest;
pub use state::{AssetState, AssetStateStore};
