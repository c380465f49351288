// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------
//
// Webhook receiver, sync trigger endpoints, health and metrics. This file
// owns the router and its middleware stack.

mod misc;
pub mod state;
mod sync;
mod webhooks;

pub use state::ApiState;
pub use sync::ImportRequest;

pub use self::router::{api_router, api_router_with_auth, MAX_BODY_BYTES};

mod router {
    use super::*;
    use axum::{
        extract::DefaultBodyLimit,
        middleware as axum_middleware,
        routing::{get, post},
        Router,
    };
    use std::sync::Arc;
    use tower_http::trace::TraceLayer;

    use crate::auth::AuthLayer;
    use cs_telemetry::middleware::metrics_middleware;
    use cs_telemetry::tracing_setup::request_id_middleware;

    /// Upper bound for webhook and trigger request bodies.
    pub const MAX_BODY_BYTES: usize = 1024 * 1024;

    /// Router without an API key (development mode).
    pub fn api_router(state: Arc<ApiState>) -> Router {
        api_router_with_auth(state, None)
    }

    /// `/api/*` requires `api_key` when it is `Some`. The webhook receiver
    /// and `/metrics` stay outside the auth layer.
    pub fn api_router_with_auth(state: Arc<ApiState>, api_key: Option<String>) -> Router {
        let api = Router::new()
            .route("/api/health", get(misc::health))
            .route("/api/sync/preview", post(sync::preview))
            .route("/api/sync/import", post(sync::import))
            .route("/api/sync/restore", post(sync::restore))
            .route("/api/sync/runs", get(sync::list_runs))
            .layer(AuthLayer::new(api_key));

        Router::new()
            .route("/webhooks/channel", post(webhooks::receive))
            .route("/metrics", get(misc::metrics))
            .merge(api)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(axum_middleware::from_fn(metrics_middleware))
            .layer(axum_middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
