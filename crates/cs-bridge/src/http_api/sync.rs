use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use cs_sync::{RestoreReport, RunReport};

use super::ApiState;
use crate::api_error::ApiError;

const DEFAULT_RUNS: usize = 20;
const MAX_RUNS: usize = 200;

/// Body of `POST /api/sync/import`. Empty body means "everything".
#[derive(Debug, Default, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub reservation_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunsQuery {
    limit: Option<usize>,
}

/// POST /api/sync/preview
pub(crate) async fn preview(State(state): State<Arc<ApiState>>) -> Result<Json<RunReport>, ApiError> {
    Ok(Json(state.engine.preview().await?))
}

/// POST /api/sync/import
pub(crate) async fn import(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<Json<RunReport>, ApiError> {
    let request: ImportRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ImportRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let allowlist = match request.reservation_ids {
        Some(ids) if ids.iter().any(|id| id.trim().is_empty()) => {
            return Err(ApiError::BadRequest("reservation_ids must not contain empty ids".into()));
        }
        Some(ids) => Some(ids.into_iter().collect::<HashSet<_>>()),
        None => None,
    };
    Ok(Json(state.engine.import(allowlist).await?))
}

/// POST /api/sync/restore
pub(crate) async fn restore(State(state): State<Arc<ApiState>>) -> Result<Json<RestoreReport>, ApiError> {
    Ok(Json(state.engine.restore().await?))
}

/// GET /api/sync/runs?limit=N
pub(crate) async fn list_runs(
    State(state): State<Arc<ApiState>>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Vec<RunReport>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_RUNS).clamp(1, MAX_RUNS);
    Ok(Json(state.engine.runs(limit).await?))
}
