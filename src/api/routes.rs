//! HTTP and WebSocket surface.
//!
//! Pass-through routes (`/api/market`, `/api/history/:id`) proxy CoinCap
//! verbatim and never touch pipeline state; `/api/asset/:id` reads the live
//! AssetState store; `/ws` streams snapshot and tick events; `/health`
//! reports per-loop lifecycle state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::broadcaster::Broadcaster;
use crate::error::PipelineError;
use crate::feeds::CoinCapRestClient;
use crate::market::{AssetState, AssetStateStore};
use crate::models::{Config, WsServerEvent};
use crate::supervisor::{LoopState, LoopStatusRegistry};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rest: Arc<CoinCapRestClient>,
    pub market: Arc<AssetStateStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub statuses: Arc<LoopStatusRegistry>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/market", get(get_market))
        .route("/api/history/:asset_id", get(get_history))
        .route("/api/asset/:asset_id", get(get_asset))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: state.broadcaster.subscriber_count(),
        tracked_assets: state.market.len(),
        loops: state.statuses.snapshot(),
    })
}

/// Full-universe snapshot, upstream payload verbatim.
async fn get_market(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let payload = state.rest.assets_raw(state.config.snapshot_limit).await?;
    Ok(Json(payload))
}

/// Per-asset history, upstream payload verbatim. `range` selects the window
/// and interval bucket; unrecognized input falls back to `24hr`.
async fn get_history(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let range = params.range.as_deref().unwrap_or("24hr");
    let end_ms = Utc::now().timestamp_millis();
    let (start_ms, interval) = range_to_query(range, end_ms);
    debug!(asset = %asset_id, range, interval, "history pass-through");

    let payload = state
        .rest
        .history_raw(&asset_id, start_ms, end_ms, interval)
        .await?;
    Ok(Json(payload))
}

/// Live derived state for one asset.
async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<AssetState>, ApiError> {
    state
        .market
        .read(&asset_id)
        .map(Json)
        .ok_or(ApiError::NotFound(format!("Asset {} not tracked", asset_id)))
}

/// Map a UI range keyword onto a CoinCap (start, interval) pair.
fn range_to_query(range: &str, end_ms: i64) -> (i64, &'static str) {
    match range {
        "max" => (0, "d1"),
        "1yr" => (end_ms - 365 * DAY_MS, "d1"),
        "3m" => (end_ms - 90 * DAY_MS, "h12"),
        "1m" => (end_ms - 30 * DAY_MS, "h1"),
        "7d" => (end_ms - 7 * DAY_MS, "h1"),
        _ => (end_ms - DAY_MS, "m5"),
    }
}

// ===== WebSocket =====

/// WebSocket handler for real-time snapshot/tick streaming
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.broadcaster.subscribe();
    debug!(
        subscribers = state.broadcaster.subscriber_count(),
        "ws client connected"
    );

    // On connect, replay the current per-asset state so the client isn't
    // empty until the next poll cycle lands.
    for asset_id in state.market.known_assets() {
        let Some(snapshot) = state.market.read(&asset_id) else {
            continue;
        };
        let msg = serde_json::to_string(&json!({ "type": "asset_state", "data": snapshot }))
            .unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break; // broadcaster gone, shutting down
                };
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!("Failed to serialize ws event: {}", e);
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    let _ = socket.send(Message::Text("pong".to_string())).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    debug!(dropped = subscription.dropped(), "ws client disconnected");
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct HistoryQuery {
    range: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    subscribers: usize,
    tracked_assets: usize,
    loops: HashMap<&'static str, LoopState>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Upstream(PipelineError),
    NotFound(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Upstream(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Upstream(err) => {
                tracing::error!("Upstream error: {}", err);
                (StatusCode::BAD_GATEWAY, "Upstream unavailable".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_mapping_matches_ui_options() {
        let end = 1_000 * DAY_MS;
        assert_eq!(range_to_query("max", end), (0, "d1"));
        assert_eq!(range_to_query("1yr", end), (end - 365 * DAY_MS, "d1"));
        assert_eq!(range_to_query("3m", end), (end - 90 * DAY_MS, "h12"));
        assert_eq!(range_to_query("1m", end), (end - 30 * DAY_MS, "h1"));
        assert_eq!(range_to_query("7d", end), (end - 7 * DAY_MS, "h1"));
        assert_eq!(range_to_query("24hr", end), (end - DAY_MS, "m5"));
    }

    #[test]
    fn unknown_range_defaults_to_24hr() {
        let end = 500 * DAY_MS;
        assert_eq!(range_to_query("fortnight", end), (end - DAY_MS, "m5"));
        assert_eq!(range_to_query("", end), (end - DAY_MS, "m5"));
    }

    #[test]
    fn upstream_error_converts() {
        let err = PipelineError::TransientNetwork("timeout".to_string());
        let api_err: ApiError = err.into();
        match api_err {
            ApiError::Upstream(_) => (),
            _ => panic!("Expected Upstream error"),
        }
    }
}
