//! HTTP API for the station control plane
//!
//! Read-only views over the cache snapshots and history for web players and
//! the dashboard, plus one rate-limited control action (skip).

use crate::executor::{CommandExecutor, ExecError};
use crate::history::{HistoryEntry, HistoryStore};
use crate::metadata::current_timestamp_ms;
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::snapshot::{NowPlayingView, SnapshotStore, UpNextView};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

/// Default and maximum page size for `/history`
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Minimum spacing between skip requests, independent of the pool's own gate.
pub struct SkipGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl SkipGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Claim the next skip slot, or report how long until one is free.
    pub async fn try_claim(&self) -> Result<(), Duration> {
        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last {
            let elapsed = now.duration_since(previous);
            if elapsed < self.min_interval {
                return Err(self.min_interval - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }
}

/// Shared state behind every handler
#[derive(Clone)]
pub struct ApiState {
    pub snapshots: SnapshotStore,
    pub history: Arc<HistoryStore>,
    pub metrics: SharedMetrics,
    pub executor: CommandExecutor,
    pub skip_gate: Arc<SkipGate>,
    pub skip_command: String,
    pub read_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipResponse {
    pub ok: bool,
    pub message: String,
}

fn skip_reply(status: StatusCode, ok: bool, message: String) -> Response {
    (status, Json(SkipResponse { ok, message })).into_response()
}

/// Handler for GET /now-playing
async fn get_now_playing(State(state): State<ApiState>) -> Json<NowPlayingView> {
    Json(state.snapshots.now_playing_view(current_timestamp_ms()))
}

/// Handler for GET /up-next
async fn get_up_next(State(state): State<ApiState>) -> Json<UpNextView> {
    Json(state.snapshots.up_next_view(current_timestamp_ms()))
}

/// Handler for GET /history?limit=N
async fn get_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<HistoryEntry>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Json(state.history.recent(limit))
}

/// Handler for GET /metrics
async fn get_metrics(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.metrics.read().await.clone();
    snapshot.pool = state.executor.pool().stats().await;
    Json(snapshot)
}

/// Handler for POST /skip
///
/// * `200` - skip sent
/// * `429` - another skip happened too recently
/// * `502` - the control socket rejected the command
/// * `503` - no control connection could be obtained
async fn post_skip(State(state): State<ApiState>) -> Response {
    if let Err(wait) = state.skip_gate.try_claim().await {
        return skip_reply(
            StatusCode::TOO_MANY_REQUESTS,
            false,
            format!("skip throttled, retry in {}s", wait.as_secs().max(1)),
        );
    }

    match state
        .executor
        .execute(&state.skip_command, state.read_timeout)
        .await
    {
        Ok(_) => {
            info!("skip sent");
            state.metrics.write().await.skips_sent += 1;
            skip_reply(StatusCode::OK, true, "skipped".to_string())
        }
        Err(ExecError::Rejected(reply)) => {
            warn!(reply = %reply, "skip rejected by control socket");
            skip_reply(StatusCode::BAD_GATEWAY, false, reply)
        }
        Err(e) => {
            warn!(error = %e, "skip failed");
            skip_reply(StatusCode::SERVICE_UNAVAILABLE, false, e.to_string())
        }
    }
}

/// Creates the axum Router with every API endpoint
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/now-playing", get(get_now_playing))
        .route("/up-next", get(get_up_next))
        .route("/history", get(get_history))
        .route("/metrics", get(get_metrics))
        .route("/skip", post(post_skip))
        .with_state(state)
}

/// Runs the API server until `shutdown` flips to true
///
/// # Arguments
/// * `state` - Shared handler state
/// * `bind` - Listen address, e.g. `127.0.0.1:7878`
/// * `shutdown` - Graceful shutdown signal
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_api_server(
    state: ApiState,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let app = create_api_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
