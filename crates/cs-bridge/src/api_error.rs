//! HTTP API error type, rendered as `{"error": msg}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cs_sync::SyncError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid webhook signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A reconciliation or restore run is already active.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::RunInProgress => ApiError::Conflict(e.to_string()),
            SyncError::EventNotFound(id) => ApiError::NotFound(format!("webhook event {id}")),
            other => {
                error!(error = %other, "sync request failed");
                ApiError::InternalError(other.to_string())
            }
        }
    }
}
