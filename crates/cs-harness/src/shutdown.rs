use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Process-wide shutdown coordinator.
///
/// Long-running loops (webhook workers, the reconcile schedule, the HTTP
/// server) `select!` on [`ShutdownSignal::subscribe`]; reconciliation runs
/// poll a [`CancelFlag`] linked to it between pages and items.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown requested");
            let _ = self.trigger.send(());
        }
    }

    /// A per-run cancellation flag that also trips on process shutdown.
    pub fn cancel_flag(&self) -> CancelFlag {
        CancelFlag {
            own: Arc::new(AtomicBool::new(false)),
            process: Some(self.shutting_down.clone()),
        }
    }

    /// Called by a worker once it has finished its in-flight item.
    pub fn confirm_drained(&self) {
        self.drained_tx.send_modify(|n| *n += 1);
    }

    /// Wait until `expected` workers confirmed, or `timeout` elapses.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drained_rx.borrow();
            if current >= expected {
                return DrainResult::Complete(current);
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drained_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drained_rx.borrow();
                    warn!(confirmed, expected, "drain timed out");
                    return DrainResult::Timeout {
                        confirmed,
                        expected,
                    };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Confirms drain for its worker when dropped.
pub struct DrainGuard {
    signal: ShutdownSignal,
}

impl DrainGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Cooperative cancellation for a single run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    own: Arc<AtomicBool>,
    process: Option<Arc<AtomicBool>>,
}

impl CancelFlag {
    /// A flag not linked to process shutdown.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::Relaxed)
            || self
                .process
                .as_ref()
                .map(|p| p.load(Ordering::Relaxed))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_are_woken() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let woke = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(woke.is_ok());
    }

    #[test]
    fn cancel_flag_follows_process_shutdown() {
        let signal = ShutdownSignal::new();
        let flag = signal.cancel_flag();
        let other = signal.cancel_flag();
        assert!(!flag.is_cancelled());

        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(!other.is_cancelled());

        signal.trigger();
        assert!(other.is_cancelled());
    }

    #[test]
    fn standalone_flag() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let mut signal = ShutdownSignal::new();
        let g1 = DrainGuard::new(signal.clone());
        let g2 = DrainGuard::new(signal.clone());
        signal.trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
            drop(g2);
        });
        assert!(signal
            .wait_for_drain(2, Duration::from_secs(1))
            .await
            .is_complete());
    }

    #[tokio::test]
    async fn drain_times_out() {
        let mut signal = ShutdownSignal::new();
        let _held = DrainGuard::new(signal.clone());
        let res = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            res,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }
}
