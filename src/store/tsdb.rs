//! HTTP client for the time-series backend.
//!
//! One write call carries a mapping from series key to an ordered list of
//! `[timestamp_micro, value]` pairs. The backend accepts or rejects the whole
//! payload; there is no partial-success contract.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use tracing::debug;

use crate::error::PipelineError;

#[derive(Clone)]
pub struct TsdbClient {
    client: Client,
    base_url: String,
}

impl TsdbClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build TsdbClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Write one batch. 2xx means the whole batch was accepted.
    pub async fn write_batch(
        &self,
        series: &HashMap<String, Vec<(i64, f64)>>,
    ) -> Result<(), PipelineError> {
        let url = format!("{}/api/write", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(series)
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("POST /api/write: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::StoreWrite(format!(
                "POST /api/write {status}: {body}"
            )));
        }

        debug!(series = series.len(), "store write accepted");
        Ok(())
    }
}
