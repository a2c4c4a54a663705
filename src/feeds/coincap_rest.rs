//! CoinCap REST client.
//!
//! Typed wrappers for the two request/response calls the pipeline consumes
//! (full-universe snapshot, per-asset history) plus verbatim variants used by
//! the pass-through API routes. Payloads are validated here, at the boundary,
//! never assumed downstream.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::PipelineError;

#[derive(Clone)]
pub struct CoinCapRestClient {
    client: Client,
    base_url: String,
}

/// One row of the `/assets` listing. CoinCap serves decimals as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSnapshotRecord {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub rank: Option<String>,
    pub price_usd: String,
    #[serde(default)]
    pub market_cap_usd: Option<String>,
    #[serde(default)]
    pub volume_usd24_hr: Option<String>,
    #[serde(default)]
    pub change_percent24_hr: Option<String>,
}

impl AssetSnapshotRecord {
    pub fn price(&self) -> Option<f64> {
        self.price_usd.parse::<f64>().ok().filter(|p| p.is_finite())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsResponse {
    pub data: Vec<AssetSnapshotRecord>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// One point of the `/assets/:id/history` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    /// Unix milliseconds.
    pub time: i64,
    pub price_usd: String,
}

impl HistoryPoint {
    pub fn price(&self) -> Option<f64> {
        self.price_usd.parse::<f64>().ok().filter(|p| p.is_finite())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryResponse {
    data: Vec<HistoryPoint>,
}

impl CoinCapRestClient {
    pub fn new(base_url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {key}")
                    .parse()
                    .context("Invalid CoinCap api key")?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .context("Failed to build CoinCapRestClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Typed full-universe snapshot.
    pub async fn assets(&self, limit: u32) -> Result<AssetsResponse, PipelineError> {
        let body = self
            .get_text("/assets", &[("limit", limit.to_string())])
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedMessage(format!("assets response: {e}")))
    }

    /// Snapshot payload exactly as upstream returned it (pass-through routes).
    pub async fn assets_raw(&self, limit: u32) -> Result<serde_json::Value, PipelineError> {
        let body = self
            .get_text("/assets", &[("limit", limit.to_string())])
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedMessage(format!("assets response: {e}")))
    }

    /// Typed history pull, ordered as upstream returns it.
    pub async fn history(
        &self,
        asset_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<Vec<HistoryPoint>, PipelineError> {
        let body = self.get_history_text(asset_id, start_ms, end_ms, interval).await?;
        let resp: HistoryResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedMessage(format!("history response: {e}")))?;
        Ok(resp.data)
    }

    /// History payload verbatim (pass-through routes).
    pub async fn history_raw(
        &self,
        asset_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        let body = self.get_history_text(asset_id, start_ms, end_ms, interval).await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedMessage(format!("history response: {e}")))
    }

    async fn get_history_text(
        &self,
        asset_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<String, PipelineError> {
        self.get_text(
            &format!("/assets/{asset_id}/history"),
            &[
                ("start", start_ms.to_string()),
                ("end", end_ms.to_string()),
                ("interval", interval.to_string()),
            ],
        )
        .await
    }

    async fn get_text(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<String, PipelineError> {
        let url = self.url(path);
        trace!(%url, "coincap request");

        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("GET {path}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::TransientNetwork(format!(
                "GET {path} {status}: {text}"
            )));
        }

        resp.text()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("GET {path} body: {e}")))
    }
}
