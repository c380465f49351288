use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use cs_sync::{Delivery, IngressOutcome, RejectReason, EVENT_ID_HEADER, SIGNATURE_HEADER};

use super::ApiState;
use crate::api_error::ApiError;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /webhooks/channel -- persist and enqueue; never waits for the
/// event to be applied.
pub(crate) async fn receive(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let delivery = Delivery {
        body: &body,
        signature: header(&headers, SIGNATURE_HEADER),
        source_event_id: header(&headers, EVENT_ID_HEADER),
    };
    match state.engine.ingress().receive(delivery).await? {
        IngressOutcome::Accepted { event_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "event_id": event_id})),
        )),
        IngressOutcome::Duplicate { dedup_key } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"status": "duplicate", "dedup_key": dedup_key})),
        )),
        IngressOutcome::Rejected(RejectReason::BadSignature) => {
            Err(ApiError::Unauthorized("invalid webhook signature".into()))
        }
        IngressOutcome::Rejected(RejectReason::Malformed(reason)) => Err(ApiError::BadRequest(reason)),
    }
}
