use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use cs_telemetry::metrics::global_metrics;

use super::ApiState;

/// GET /api/health
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "webhook_queue_depth": state.engine.queue_depth(),
    }))
}

/// GET /metrics -- Prometheus text format.
pub(crate) async fn metrics() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        global_metrics().export_prometheus(),
    )
}
