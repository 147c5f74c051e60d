//! Health and metrics handlers.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub store: String,
    /// Number of hours currently held in the local store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<usize>,
    pub uptime_seconds: i64,
}

/// GET /health - Basic health check
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Readiness check (verifies the local store opens)
pub async fn ready_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let uptime_seconds = (chrono::Utc::now() - state.started_at).num_seconds();

    // A missing store is fine: the first request bootstraps it.
    let (ready, store, hours) = match state
        .engine
        .sync_engine()
        .read_store(|store| Ok(store.len()))
        .await
    {
        Ok(Some(hours)) => (true, "ok".to_string(), Some(hours)),
        Ok(None) => (true, "empty".to_string(), None),
        Err(e) => (false, format!("error: {}", e), None),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = ReadyResponse {
        ready,
        store,
        hours,
        uptime_seconds,
    };
    (status, Json(response)).into_response()
}

/// GET /metrics - Prometheus metrics
pub async fn metrics_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
