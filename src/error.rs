//! Pipeline error taxonomy.
//!
//! Every variant maps to a recovery policy owned by the loop that observes it:
//! transient network failures are retried with backoff, malformed messages and
//! rejected store batches are dropped after logging, aggregation failures skip
//! the affected asset for one cycle. None of these are fatal once the loops
//! are running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Upstream unreachable, timed out, or answered non-2xx. Retried by the
    /// owning loop with backoff.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// A single inbound message failed to decode. The message is dropped and
    /// the loop continues.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The store rejected a batch or the transport failed mid-write. The
    /// batch is dropped; there is no retry queue.
    #[error("store write failed: {0}")]
    StoreWrite(String),

    /// Historical fetch or derivation failed for one asset. That asset's
    /// cursor is left untouched and the cycle moves on.
    #[error("aggregation failed for {asset_id}: {reason}")]
    Aggregation { asset_id: String, reason: String },
}

impl PipelineError {
    pub fn aggregation(asset_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Aggregation {
            asset_id: asset_id.into(),
            reason: reason.to_string(),
        }
    }
}
