use std::future::Future;
use std::time::Duration;

use cs_core::config::PacingConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::CallError;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Minimum gap between the start of two outbound calls.
    pub min_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl PacingPolicy {
    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    /// `backoff_base * 2^retry`, capped at `backoff_max`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Pacer
// ---------------------------------------------------------------------------

/// Shared gate in front of the channel API.
///
/// Callers reserve the next free slot under a short lock and sleep outside
/// it, so concurrent callers queue up `min_delay` apart instead of bursting.
#[derive(Debug)]
pub struct Pacer {
    policy: PacingPolicy,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            next_slot: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Wait until this caller may start a call.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.policy.min_delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Run `op` under pacing, retrying retryable failures with backoff.
    ///
    /// After `max_retries` retries the last error is returned; the caller
    /// decides what a failure means for the record at hand.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: CallError,
    {
        let mut retry = 0u32;
        loop {
            self.wait_turn().await;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    let backoff = self.policy.backoff(retry);
                    let delay = e.retry_after().map_or(backoff, |ra| ra.max(backoff));
                    warn!(
                        call = label,
                        retry = retry + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable channel error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    debug!(call = label, retries = retry, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = PacingPolicy {
            min_delay: Duration::ZERO,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(3000),
        };
        assert_eq!(p.backoff(0), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_millis(3000));
        assert_eq!(p.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn default_policy_matches_config_defaults() {
        let p = PacingPolicy::default();
        assert_eq!(p.min_delay, Duration::from_millis(200));
        assert_eq!(p.max_retries, 3);
    }
}
