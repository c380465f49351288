//! Restore job: re-validates reservations cancelled by the sync engine and
//! reverts the ones the source still reports as active.

use std::sync::Arc;

use cs_core::config::ReconcileConfig;
use cs_core::store::Store;
use cs_core::types::CancellationReason;
use cs_harness::shutdown::CancelFlag;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::guard::{DecisionReason, RestoreVerdict, SafetyGuard};
use crate::reconcile::ErrorLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub examined: u64,
    pub restored: u64,
    pub still_cancelled: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub job_id: Uuid,
    pub stats: RestoreStats,
    pub restored_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct RestoreJob {
    store: Store,
    guard: SafetyGuard,
    max_errors: usize,
    running: Arc<Mutex<()>>,
}

impl RestoreJob {
    pub fn new(store: Store, guard: SafetyGuard) -> Self {
        Self {
            store,
            guard,
            max_errors: ReconcileConfig::default().max_errors,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Cap on `RestoreReport::errors`; the rest are summarised in one entry.
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Look up every engine-cancelled reservation by id. Ones found with an
    /// active status get that status and the remote fields back.
    /// Cancellations entered locally are never touched.
    pub async fn run(&self, cancel: CancelFlag) -> Result<RestoreReport> {
        let _running = self.running.try_lock().map_err(|_| SyncError::RunInProgress)?;
        let job_id = Uuid::new_v4();
        let candidates = self
            .store
            .list_cancelled_by_reason(&[
                CancellationReason::VerifiedAbsent,
                CancellationReason::RemoteCancelled,
            ])
            .await?;
        info!(%job_id, candidates = candidates.len(), "restore job started");

        let mut report = RestoreReport {
            job_id,
            stats: RestoreStats::default(),
            restored_ids: Vec::new(),
            errors: Vec::new(),
        };
        let mut errors = ErrorLog::new(self.max_errors);
        for local in candidates {
            if cancel.is_cancelled() {
                errors.push("restore job cancelled".into());
                break;
            }
            report.stats.examined += 1;
            let id = local.external_id.clone();
            match self.guard.verify_for_restore(&local).await {
                RestoreVerdict::StillCancelled => report.stats.still_cancelled += 1,
                RestoreVerdict::Skip(DecisionReason::AuthFailed(msg)) => {
                    report.stats.skipped += 1;
                    errors.push(format!("aborted: channel authentication failed: {msg}"));
                    break;
                }
                RestoreVerdict::Skip(reason) => {
                    report.stats.skipped += 1;
                    warn!(reservation = %id, ?reason, "restore skipped");
                    errors.push(format!("reservation {id}: {reason:?}"));
                }
                RestoreVerdict::Restore(patch) => {
                    let key = format!("restore:{job_id}:{id}");
                    match self.store.restore_reservation(patch, Some(&key)).await {
                        Ok(o) if o.changed => {
                            info!(reservation = %id, status = %o.entity.status, "reservation restored");
                            report.stats.restored += 1;
                            report.restored_ids.push(id);
                        }
                        Ok(_) => report.stats.still_cancelled += 1,
                        Err(e) => {
                            report.stats.skipped += 1;
                            warn!(reservation = %id, error = %e, "restore write failed");
                            errors.push(format!("reservation {id}: {e}"));
                        }
                    }
                }
            }
        }

        report.errors = errors.finish();
        info!(
            %job_id,
            examined = report.stats.examined,
            restored = report.stats.restored,
            still_cancelled = report.stats.still_cancelled,
            skipped = report.stats.skipped,
            "restore job finished"
        );
        Ok(report)
    }
}
