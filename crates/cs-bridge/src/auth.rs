//! API key guard for the trigger endpoints.
//!
//! Requests must carry the key in `X-API-Key` or `Authorization: Bearer`.
//! Without a configured key every request passes (development mode). The
//! webhook receiver is mounted outside this layer; it authenticates by
//! signature instead.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{HeaderMap, Request, Response, StatusCode},
    response::IntoResponse,
};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AuthLayer {
    api_key: Option<Arc<String>>,
}

impl AuthLayer {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::new),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            api_key: self.api_key.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    api_key: Option<Arc<String>>,
}

fn provided_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
}

fn key_matches(expected: &str, provided: Option<&str>) -> bool {
    provided.is_some_and(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())))
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let allowed = match &self.api_key {
            None => true,
            Some(expected) => key_matches(expected, provided_key(req.headers())),
        };
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if allowed {
                return inner.call(req).await;
            }
            warn!(path = %req.uri().path(), "rejected request without a valid api key");
            Ok((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "unauthorized"})),
            )
                .into_response())
        })
    }
}
