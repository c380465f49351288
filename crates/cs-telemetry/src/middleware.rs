use axum::{
    body::Body,
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::metrics::{global_metrics, names};

/// Records `http_requests_total{method,path,status}` and
/// `http_request_duration_seconds{method,path}`.
///
/// `path` is the matched route template when there is one, so ids in the
/// URL do not explode label cardinality; unmatched requests share one
/// label.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let labels = [("method", method.as_str()), ("path", path.as_str())];
    let m = global_metrics();
    m.increment_counter(
        names::HTTP_REQUESTS_TOTAL,
        &[labels[0], labels[1], ("status", status.as_str())],
    );
    m.record_histogram_with(names::HTTP_REQUEST_DURATION, &labels, start.elapsed().as_secs_f64());

    response
}
