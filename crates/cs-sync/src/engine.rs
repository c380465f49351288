//! Wiring of the sync components behind one handle, plus the report shapes
//! returned to trigger callers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cs_channel::{ChannelApi, Mapper};
use cs_core::config::Config;
use cs_core::store::Store;
use cs_core::types::{EntityStats, ReconciliationRun, ReservationStats, RunStatus};
use cs_harness::shutdown::ShutdownSignal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::guard::SafetyGuard;
use crate::incremental::{spawn_workers, IncrementalSync};
use crate::ingress::WebhookIngress;
use crate::reconcile::{ReconcileMode, ReconcileRequest, Reconciler};
use crate::restore::{RestoreJob, RestoreReport};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

impl From<EntityStats> for EntitySummary {
    fn from(s: EntityStats) -> Self {
        Self {
            fetched: s.fetched,
            created: s.created,
            updated: s.updated,
            failed: s.failed,
        }
    }
}

/// Stats object returned by the preview and import triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: ReconcileMode,
    pub status: RunStatus,
    pub guests: EntitySummary,
    pub properties: EntitySummary,
    pub reservations: ReservationStats,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn from_run(run: &ReconciliationRun) -> Self {
        Self {
            run_id: run.run_id,
            mode: if run.dry_run {
                ReconcileMode::Preview
            } else {
                ReconcileMode::Apply
            },
            status: run.status,
            guests: run.stats.guests.into(),
            properties: run.stats.properties.into(),
            reservations: run.stats.reservations,
            errors: run.errors.clone(),
        }
    }

    /// `Err(PartialBatchFailure)` when any record failed or was left
    /// unverified.
    pub fn ensure_clean(&self) -> Result<()> {
        let failed = self.guests.failed + self.properties.failed + self.reservations.failed;
        let unverified = self.reservations.skipped_as_unverified;
        if failed > 0 || unverified > 0 {
            return Err(SyncError::PartialBatchFailure { failed, unverified });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Owns the ingress queue and every job that reads or writes canonical
/// data. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    store: Store,
    ingress: WebhookIngress,
    incremental: IncrementalSync,
    reconciler: Reconciler,
    restore: RestoreJob,
    queue_tx: flume::Sender<Uuid>,
    queue_rx: flume::Receiver<Uuid>,
    shutdown: ShutdownSignal,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        store: Store,
        api: Arc<dyn ChannelApi>,
        mapper: Arc<Mapper>,
        webhook_secret: Option<String>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(config.webhook.queue_capacity.max(1));
        let guard = SafetyGuard::new(api.clone(), mapper.clone());
        let retries = u64::from(config.pacing.max_retries);
        let call_timeout = Duration::from_secs(config.channel.request_timeout_secs * (retries + 1))
            + Duration::from_millis(config.pacing.backoff_max_ms * retries);

        Self {
            ingress: WebhookIngress::new(store.clone(), queue_tx.clone(), webhook_secret),
            incremental: IncrementalSync::new(
                store.clone(),
                api.clone(),
                mapper.clone(),
                guard.clone(),
            ),
            reconciler: Reconciler::new(
                store.clone(),
                api,
                mapper,
                guard.clone(),
                config.reconcile.clone(),
            )
            .with_call_timeout(call_timeout),
            restore: RestoreJob::new(store.clone(), guard)
                .with_max_errors(config.reconcile.max_errors),
            store,
            queue_tx,
            queue_rx,
            shutdown,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ingress(&self) -> &WebhookIngress {
        &self.ingress
    }

    pub fn incremental(&self) -> &IncrementalSync {
        &self.incremental
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_tx.len()
    }

    /// Start the webhook workers and re-drive any events left pending by a
    /// previous process.
    pub fn start_workers(&self, workers: usize) -> Vec<JoinHandle<()>> {
        let handles = spawn_workers(
            self.incremental.clone(),
            self.queue_rx.clone(),
            workers,
            &self.shutdown,
        );
        let sync = self.incremental.clone();
        let queue = self.queue_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.sweep_backlog(&queue).await {
                error!(error = %e, "backlog sweep failed");
            }
        });
        handles
    }

    pub async fn preview(&self) -> Result<RunReport> {
        let run = self
            .reconciler
            .run(ReconcileRequest::preview(), self.shutdown.cancel_flag())
            .await?;
        Ok(RunReport::from_run(&run))
    }

    /// Full import; `reservation_ids` restricts which reservations are
    /// applied or considered for absence.
    pub async fn import(&self, reservation_ids: Option<HashSet<String>>) -> Result<RunReport> {
        let request = ReconcileRequest {
            mode: ReconcileMode::Apply,
            reservation_ids,
        };
        let run = self
            .reconciler
            .run(request, self.shutdown.cancel_flag())
            .await?;
        Ok(RunReport::from_run(&run))
    }

    pub async fn restore(&self) -> Result<RestoreReport> {
        self.restore.run(self.shutdown.cancel_flag()).await
    }

    pub async fn runs(&self, limit: usize) -> Result<Vec<RunReport>> {
        let runs = self.store.list_runs(limit).await?;
        Ok(runs.iter().map(RunReport::from_run).collect())
    }

    /// Scheduled full import every `interval` until shutdown. A tick that
    /// finds a run in progress is skipped.
    pub fn spawn_schedule(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {
                        match engine.import(None).await {
                            Ok(report) => info!(
                                run_id = %report.run_id,
                                status = ?report.status,
                                "scheduled reconciliation done"
                            ),
                            Err(SyncError::RunInProgress) => {
                                info!("scheduled reconciliation skipped, a run is in progress");
                            }
                            Err(e) => error!(error = %e, "scheduled reconciliation failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use cs_core::types::RunMode;

    use super::*;

    #[test]
    fn report_carries_trigger_shape() {
        let mut run = ReconciliationRun::start(RunMode::Full, true);
        run.stats.guests.fetched = 4;
        run.stats.reservations.skipped_as_unverified = 1;
        run.errors.push("reservation R9: timed out".into());

        let report = RunReport::from_run(&run);
        assert_eq!(report.mode, ReconcileMode::Preview);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["mode"], "preview");
        assert_eq!(v["guests"]["fetched"], 4);
        assert!(v["guests"].get("unchanged").is_none());
        assert_eq!(v["reservations"]["skipped_as_unverified"], 1);
        assert_eq!(v["errors"][0], "reservation R9: timed out");
    }

    #[test]
    fn unverified_records_make_a_report_unclean() {
        let mut run = ReconciliationRun::start(RunMode::Full, false);
        assert!(RunReport::from_run(&run).ensure_clean().is_ok());
        run.stats.reservations.skipped_as_unverified = 2;
        let err = RunReport::from_run(&run).ensure_clean().unwrap_err();
        assert!(matches!(
            err,
            SyncError::PartialBatchFailure {
                failed: 0,
                unverified: 2
            }
        ));
    }
}
