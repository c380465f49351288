//! Subscriber setup. Logs go to stderr so the reports the daemon prints on
//! stdout stay machine-readable.

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

/// Dependencies that are chatty below `warn` on every request.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rusqlite=warn"];

/// `RUST_LOG` wins outright; otherwise `default_level` plus the quiet
/// targets.
fn filter(default_level: &str) -> EnvFilter {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return from_env;
    }
    QUIET_TARGETS
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::new(default_level), EnvFilter::add_directive)
}

/// Human-readable output, e.g. `default_level = "info"` or
/// `"cs_sync=debug,warn"`. Later calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, format = "text", "logging initialised");
}

/// JSON lines, one object per event with span fields flattened in.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, format = "json", "logging initialised");
}

/// Pick the output format from the `[logging]` settings.
pub fn init(service_name: &str, level: &str, json: bool) {
    if json {
        init_logging_json(service_name, level);
    } else {
        init_logging(service_name, level);
    }
}
