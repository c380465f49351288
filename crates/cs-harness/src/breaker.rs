use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cs_core::config::ReconcileConfig;
use tokio::sync::Mutex;
use tracing::warn;

use crate::CallError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker has tripped; the call was not attempted.
    #[error("run breaker is open, call not attempted")]
    Open,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The call ran and failed.
    #[error("{0}")]
    Inner(E),
}

// ---------------------------------------------------------------------------
// State / config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Stays open for the rest of the run.
    Open,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Calls observed before the ratio is evaluated.
    pub min_calls: u32,
    /// Failure share at or above which the breaker trips.
    pub failure_ratio: f64,
    pub call_timeout: Duration,
}

impl BreakerConfig {
    pub fn from_config(cfg: &ReconcileConfig, call_timeout: Duration) -> Self {
        Self {
            min_calls: cfg.breaker_min_calls,
            failure_ratio: cfg.breaker_failure_ratio,
            call_timeout,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default(), Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub calls: u32,
    pub failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    counts: BreakerCounts,
}

// ---------------------------------------------------------------------------
// RunBreaker
// ---------------------------------------------------------------------------

/// Failure-ratio circuit breaker scoped to one reconciliation run.
///
/// Unlike a service breaker it never half-opens: once the upstream looks
/// unhealthy the rest of the run stops calling it and the caller records
/// whatever is left as unverified.
#[derive(Debug, Clone)]
pub struct RunBreaker {
    config: BreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl RunBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                counts: BreakerCounts::default(),
            })),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == BreakerState::Open
    }

    pub async fn counts(&self) -> BreakerCounts {
        self.inner.lock().await.counts
    }

    /// Execute `f` unless the breaker is open. Timeouts and errors for which
    /// [`CallError::is_upstream_failure`] holds count as failures.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: CallError,
    {
        if self.is_open().await {
            return Err(BreakerError::Open);
        }
        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(v)) => {
                self.record(false).await;
                Ok(v)
            }
            Ok(Err(e)) => {
                self.record(e.is_upstream_failure()).await;
                Err(BreakerError::Inner(e))
            }
            Err(_elapsed) => {
                self.record(true).await;
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Record an outcome observed outside [`RunBreaker::call`].
    pub async fn record(&self, failed: bool) {
        let mut guard = self.inner.lock().await;
        guard.counts.calls += 1;
        if failed {
            guard.counts.failures += 1;
        }
        if guard.state == BreakerState::Closed && self.should_trip(guard.counts) {
            warn!(
                calls = guard.counts.calls,
                failures = guard.counts.failures,
                ratio = self.config.failure_ratio,
                "run breaker tripped, halting channel calls for this run"
            );
            guard.state = BreakerState::Open;
        }
    }

    /// Open immediately, e.g. after an authentication failure.
    pub async fn trip(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == BreakerState::Closed {
            warn!("run breaker tripped manually");
            guard.state = BreakerState::Open;
        }
    }

    fn should_trip(&self, counts: BreakerCounts) -> bool {
        counts.calls >= self.config.min_calls.max(1)
            && f64::from(counts.failures) / f64::from(counts.calls) >= self.config.failure_ratio
    }
}
