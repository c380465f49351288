//! Reliability plumbing for calls against the channel manager.
//!
//! - [`pacing`]: minimum inter-call delay plus bounded exponential backoff
//! - [`breaker`]: run-wide failure-ratio circuit breaker
//! - [`shutdown`]: process shutdown and per-run cooperative cancellation

use std::time::Duration;

pub mod breaker;
pub mod pacing;
pub mod shutdown;

/// How a failed outbound call should be treated by pacing and the breaker.
pub trait CallError: std::fmt::Display {
    /// Worth another attempt after backoff (timeouts, 5xx, 429).
    fn is_retryable(&self) -> bool;

    /// Delay the server asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Counts against the run-wide breaker. A definitive answer such as
    /// "not found" says nothing bad about the upstream.
    fn is_upstream_failure(&self) -> bool {
        self.is_retryable()
    }
}
