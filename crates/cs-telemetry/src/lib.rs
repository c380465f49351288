//! Observability for the channel sync engine.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: labelled counters, gauges and histograms with Prometheus export
//! - **Middleware**: per-request `x-request-id` spans and HTTP request metrics

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
