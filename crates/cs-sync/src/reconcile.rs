//! Full reconciliation: fetch the remote collections for the sync window,
//! apply creates and updates, and hand local reservations missing from a
//! complete snapshot to the safety guard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use cs_channel::{ChannelApi, DateFilter, Mapper, MappingError, Resource};
use cs_core::config::ReconcileConfig;
use cs_core::store::Store;
use cs_core::types::{
    DateRange, EntityKind, EntityStats, ReconciliationRun, ReservationPatch, ReservationStatus,
    RunMode, RunStatus,
};
use cs_harness::breaker::{BreakerConfig, BreakerError, RunBreaker};
use cs_harness::shutdown::CancelFlag;
use cs_telemetry::metrics::{global_metrics, names, record_reconcile_records};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::guard::SafetyGuard;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    #[default]
    Apply,
    /// Fetch and diff only; nothing is written.
    Preview,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileRequest {
    pub mode: ReconcileMode,
    /// Restrict applied reservations and absence candidates to these ids.
    pub reservation_ids: Option<HashSet<String>>,
}

impl ReconcileRequest {
    pub fn apply() -> Self {
        Self::default()
    }

    pub fn preview() -> Self {
        Self {
            mode: ReconcileMode::Preview,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Why a run stopped early.
enum Halt {
    Cancelled,
    Auth(String),
}

/// Bounded error list; overflow is summarised as one trailing entry.
#[derive(Debug, Default)]
pub(crate) struct ErrorLog {
    max: usize,
    items: Vec<String>,
    overflow: u64,
}

impl ErrorLog {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, msg: String) {
        if self.items.len() < self.max {
            self.items.push(msg);
        } else {
            self.overflow += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.overflow == 0
    }

    pub(crate) fn finish(mut self) -> Vec<String> {
        if self.overflow > 0 {
            self.items.push(format!("... and {} more", self.overflow));
        }
        self.items
    }
}

struct RunState {
    run: ReconciliationRun,
    errors: ErrorLog,
    breaker: RunBreaker,
    cancel: CancelFlag,
    preview: bool,
    allow: Option<HashSet<String>>,
    /// Every collection walk reached its last page.
    walks_complete: bool,
}

impl RunState {
    fn error(&mut self, msg: String) {
        warn!(run_id = %self.run.run_id, "{msg}");
        self.errors.push(msg);
    }

    fn check_cancel(&self) -> std::result::Result<(), Halt> {
        if self.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn allowed(&self, id: Option<&str>) -> bool {
        match (&self.allow, id) {
            (None, _) => true,
            (Some(allow), Some(id)) => allow.contains(id),
            (Some(_), None) => false,
        }
    }
}

fn tally(stats: &mut EntityStats, created: bool, changed: bool) {
    if created {
        stats.created += 1;
    } else if changed {
        stats.updated += 1;
    } else {
        stats.unchanged += 1;
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    api: Arc<dyn ChannelApi>,
    mapper: Arc<Mapper>,
    guard: SafetyGuard,
    config: ReconcileConfig,
    call_timeout: Duration,
    running: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(
        store: Store,
        api: Arc<dyn ChannelApi>,
        mapper: Arc<Mapper>,
        guard: SafetyGuard,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            api,
            mapper,
            guard,
            config,
            call_timeout: Duration::from_secs(120),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Upper bound for one paced channel call, retries included.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sync window around `today`, both ends inclusive.
    pub fn window(&self, today: NaiveDate) -> DateFilter {
        let back = Days::new(self.config.window_days_back.max(0) as u64);
        let forward = Days::new(self.config.window_days_forward.max(0) as u64);
        DateFilter {
            from: today.checked_sub_days(back).unwrap_or(today),
            to: today.checked_add_days(forward).unwrap_or(today),
            date_type: self.config.date_type,
        }
    }

    /// Run one full reconciliation. Always returns the run record with its
    /// stats, whatever happened to individual records.
    pub async fn run(&self, req: ReconcileRequest, cancel: CancelFlag) -> Result<ReconciliationRun> {
        let _running = self.running.try_lock().map_err(|_| SyncError::RunInProgress)?;
        let preview = req.mode == ReconcileMode::Preview;
        let mut st = RunState {
            run: ReconciliationRun::start(RunMode::Full, preview),
            errors: ErrorLog::new(self.config.max_errors),
            breaker: RunBreaker::new(BreakerConfig::from_config(&self.config, self.call_timeout)),
            cancel,
            preview,
            allow: req.reservation_ids,
            walks_complete: true,
        };
        if !preview {
            self.store.save_run(&st.run).await?;
        }
        let filter = self.window(Utc::now().date_naive());
        info!(
            run_id = %st.run.run_id,
            preview,
            from = %filter.from,
            to = %filter.to,
            date_type = filter.date_type.as_str(),
            "reconciliation started"
        );

        let halt = self.execute(&mut st, &filter).await.err();
        self.finish(st, halt).await
    }

    async fn execute(&self, st: &mut RunState, filter: &DateFilter) -> std::result::Result<(), Halt> {
        self.sync_simple(st, EntityKind::Property).await?;
        self.sync_simple(st, EntityKind::Guest).await?;
        if let Some(seen) = self.sync_reservations(st, filter).await? {
            self.verify_absences(st, filter, seen).await?;
        }
        Ok(())
    }

    async fn finish(&self, mut st: RunState, halt: Option<Halt>) -> Result<ReconciliationRun> {
        let stats = &st.run.stats;
        let unclean = stats.total_failed() > 0
            || stats.reservations.skipped_as_unverified > 0
            || !st.walks_complete
            || !st.errors.is_empty();
        st.run.status = match halt {
            Some(Halt::Cancelled) => {
                st.errors.push("run cancelled before completion".into());
                RunStatus::Cancelled
            }
            Some(Halt::Auth(msg)) => {
                st.errors.push(format!("aborted: channel authentication failed: {msg}"));
                RunStatus::Failed
            }
            None if unclean => RunStatus::Partial,
            None => RunStatus::Completed,
        };
        st.run.finished_at = Some(Utc::now());
        st.run.errors = std::mem::take(&mut st.errors).finish();

        let r = &st.run.stats.reservations;
        record_reconcile_records("created", r.created);
        record_reconcile_records("updated", r.updated);
        record_reconcile_records("failed", r.failed);
        record_reconcile_records("cancelled", r.cancelled);
        record_reconcile_records("skipped_as_unverified", r.skipped_as_unverified);
        let status = format!("{:?}", st.run.status).to_lowercase();
        global_metrics().increment_counter(names::RECONCILE_RUNS_TOTAL, &[("status", status.as_str())]);

        if !st.preview {
            self.store.save_run(&st.run).await?;
        }
        info!(
            run_id = %st.run.run_id,
            status = %status,
            fetched = r.fetched,
            created = r.created,
            updated = r.updated,
            failed = r.failed,
            cancelled = r.cancelled,
            skipped_as_unverified = r.skipped_as_unverified,
            "reconciliation finished"
        );
        Ok(st.run)
    }

    // -- listings and clients -----------------------------------------------

    /// Listings and clients: additive only, no absence handling.
    async fn sync_simple(&self, st: &mut RunState, kind: EntityKind) -> std::result::Result<(), Halt> {
        let resource = Resource::for_kind(kind);
        let res = match self.api.fetch_collection(resource, None, 0, &st.cancel).await {
            Ok(r) => r,
            Err(e) if e.is_auth() => return Err(Halt::Auth(e.to_string())),
            Err(e) => {
                st.walks_complete = false;
                st.error(format!("{resource}: {e}"));
                return Ok(());
            }
        };
        for failure in &res.failures {
            st.breaker.record(true).await;
            st.error(format!("{resource} page at skip {}: {}", failure.skip, failure.error));
        }
        let lost = u64::from(self.api.page_size()) * res.failures.len() as u64;
        match kind {
            EntityKind::Property => st.run.stats.properties.failed += lost,
            _ => st.run.stats.guests.failed += lost,
        }
        st.walks_complete &= res.complete;
        st.check_cancel()?;

        for raw in &res.items {
            st.check_cancel()?;
            match kind {
                EntityKind::Property => self.apply_property(st, raw).await,
                _ => self.apply_guest(st, raw).await,
            }
        }
        Ok(())
    }

    async fn apply_property(&self, st: &mut RunState, raw: &Value) {
        st.run.stats.properties.fetched += 1;
        let patch = match self.mapper.map_property(raw) {
            Ok(p) => p,
            Err(e) => {
                st.run.stats.properties.failed += 1;
                st.error(format!("listing: {e}"));
                return;
            }
        };
        let id = patch.external_id.clone();
        let result = if st.preview {
            self.store
                .get_property_by_external_id(&id)
                .await
                .map(|existing| match existing {
                    None => (true, true),
                    Some(mut p) => (false, patch.merge_into(&mut p)),
                })
        } else {
            self.store
                .upsert_property(patch, None)
                .await
                .map(|o| (o.created, o.changed))
        };
        match result {
            Ok((created, changed)) => tally(&mut st.run.stats.properties, created, changed),
            Err(e) => {
                st.run.stats.properties.failed += 1;
                st.error(format!("listing {id}: {e}"));
            }
        }
    }

    async fn apply_guest(&self, st: &mut RunState, raw: &Value) {
        st.run.stats.guests.fetched += 1;
        let patch = match self.mapper.map_guest(raw) {
            Ok(p) => p,
            Err(e) => {
                st.run.stats.guests.failed += 1;
                st.error(format!("client: {e}"));
                return;
            }
        };
        let id = patch.external_id.clone();
        let result = if st.preview {
            self.store
                .get_guest_by_external_id(&id)
                .await
                .map(|existing| match existing {
                    None => (true, true),
                    Some(mut g) => (false, patch.merge_into(&mut g)),
                })
        } else {
            self.store
                .upsert_guest(patch, None)
                .await
                .map(|o| (o.created, o.changed))
        };
        match result {
            Ok((created, changed)) => tally(&mut st.run.stats.guests, created, changed),
            Err(e) => {
                st.run.stats.guests.failed += 1;
                st.error(format!("client {id}: {e}"));
            }
        }
    }

    // -- reservations -------------------------------------------------------

    /// Walk the reservations feed page by page, applying as it goes and
    /// persisting the cursor after each page. A page that still fails after
    /// its retries is recorded and skipped; only auth errors, an open
    /// breaker, the page cap or cancellation end the walk early.
    ///
    /// Returns the remote id set only when it is a complete snapshot: the
    /// walk started at offset 0, lost no page and reached the last one.
    async fn sync_reservations(
        &self,
        st: &mut RunState,
        filter: &DateFilter,
    ) -> std::result::Result<Option<HashSet<String>>, Halt> {
        let cursor_key = format!("reservations:{}", filter.key());
        let start = if st.preview {
            0
        } else {
            match self.store.get_cursor(&cursor_key).await {
                Ok(c) => c.unwrap_or(0),
                Err(e) => {
                    warn!(error = %e, "could not read cursor, starting from 0");
                    0
                }
            }
        };
        if start > 0 {
            info!(skip = start, "resuming reservation walk from saved cursor");
        }

        let mut seen = HashSet::new();
        let mut skip = start;
        let mut pages = 0u32;
        let mut lost_pages = 0u32;
        let page_size = u64::from(self.api.page_size());
        let reached_end = loop {
            st.check_cancel()?;
            if pages >= self.api.max_pages() {
                st.error(format!("reservations: stopped after {pages} pages at skip {skip}"));
                break false;
            }
            let fetched = st
                .breaker
                .call(|| self.api.fetch_page(Resource::Reservations, Some(filter), skip))
                .await;
            pages += 1;
            match fetched {
                Ok(page) => {
                    for raw in &page.items {
                        st.check_cancel()?;
                        self.apply_reservation_record(st, raw, &mut seen).await;
                    }
                    match page.next_cursor {
                        Some(next) => skip = next,
                        None => break true,
                    }
                }
                Err(BreakerError::Inner(e)) if e.is_auth() => return Err(Halt::Auth(e.to_string())),
                Err(BreakerError::Open) => {
                    st.error(format!("reservations: circuit open, walk stopped at skip {skip}"));
                    break false;
                }
                Err(e) => {
                    // The page's records are unknown; count a full page as lost
                    // and carry on with the next one.
                    st.error(format!("reservations page at skip {skip}: {e}"));
                    st.run.stats.reservations.failed += page_size;
                    lost_pages += 1;
                    skip += page_size;
                }
            }
            if !st.preview {
                if let Err(e) = self.store.set_cursor(&cursor_key, skip).await {
                    warn!(error = %e, "could not persist cursor");
                }
            }
        };

        if reached_end && !st.preview {
            if let Err(e) = self.store.clear_cursor(&cursor_key).await {
                warn!(error = %e, "could not clear cursor");
            }
        }
        if !reached_end || lost_pages > 0 {
            if lost_pages > 0 {
                info!(lost_pages, "walk skipped failed pages, absence check deferred");
            }
            st.walks_complete = false;
            return Ok(None);
        }
        if start > 0 {
            info!("walk was resumed, absence check deferred to the next full walk");
            return Ok(None);
        }
        Ok(Some(seen))
    }

    async fn apply_reservation_record(&self, st: &mut RunState, raw: &Value, seen: &mut HashSet<String>) {
        st.run.stats.reservations.fetched += 1;
        let id = Mapper::external_id(raw, EntityKind::Reservation);
        if let Some(id) = &id {
            seen.insert(id.clone());
        }
        if !st.allowed(id.as_deref()) {
            return;
        }
        let patch = match self.mapper.map_reservation(raw) {
            Ok(p) => p,
            Err(MappingError::NotAReservation(_)) => {
                st.run.stats.reservations.ignored += 1;
                return;
            }
            Err(e) => {
                st.run.stats.reservations.failed += 1;
                st.error(format!("reservation {}: {e}", id.as_deref().unwrap_or("<no id>")));
                return;
            }
        };
        let ext = patch.external_id.clone();

        let current = match self.store.get_reservation_by_external_id(&ext).await {
            Ok(c) => c,
            Err(e) => {
                st.run.stats.reservations.failed += 1;
                st.error(format!("reservation {ext}: {e}"));
                return;
            }
        };
        let before = current.as_ref().map(|c| c.status);

        let result = if st.preview {
            Ok(match current {
                None => (true, true, patch.status),
                Some(mut c) => {
                    let changed = patch.merge_into(&mut c);
                    (false, changed, Some(c.status))
                }
            })
        } else {
            let permit = self.guard.permit_for_remote(current.as_ref(), &patch);
            self.store
                .upsert_reservation(patch, None, permit.as_ref())
                .await
                .map(|o| (o.created, o.changed, Some(o.entity.status)))
        };

        let r = &mut st.run.stats.reservations;
        match result {
            Ok((created, changed, after)) => {
                if created {
                    r.created += 1;
                } else if changed {
                    r.updated += 1;
                    if after == Some(ReservationStatus::Cancelled)
                        && before != Some(ReservationStatus::Cancelled)
                    {
                        r.cancelled += 1;
                    }
                } else {
                    r.unchanged += 1;
                }
            }
            Err(e) => {
                r.failed += 1;
                st.error(format!("reservation {ext}: {e}"));
            }
        }
    }

    /// Local active reservations absent from the snapshot are candidates,
    /// never cancellations. Each goes to the guard for a direct lookup.
    async fn verify_absences(
        &self,
        st: &mut RunState,
        filter: &DateFilter,
        seen: HashSet<String>,
    ) -> std::result::Result<(), Halt> {
        let Some(window) = filter
            .to
            .succ_opt()
            .and_then(|end| DateRange::new(filter.from, end))
        else {
            return Ok(());
        };
        let local = match self
            .store
            .list_active_reservation_ids(window, filter.date_type)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                st.error(format!("listing local reservations: {e}"));
                return Ok(());
            }
        };
        let candidates: Vec<String> = local
            .into_iter()
            .filter(|id| !seen.contains(id))
            .filter(|id| st.allowed(Some(id.as_str())))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        info!(
            run_id = %st.run.run_id,
            candidates = candidates.len(),
            remote = seen.len(),
            "local reservations missing from snapshot, verifying each"
        );

        for (i, id) in candidates.iter().enumerate() {
            let remaining = (candidates.len() - i) as u64;
            if st.cancel.is_cancelled() {
                st.run.stats.reservations.skipped_as_unverified += remaining;
                return Err(Halt::Cancelled);
            }
            let local = match self.store.get_reservation_by_external_id(id).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    st.run.stats.reservations.skipped_as_unverified += 1;
                    st.error(format!("reservation {id}: {e}"));
                    continue;
                }
            };
            let decision = self.guard.should_cancel(&local, Some(&st.breaker)).await;
            if decision.is_auth_failure() {
                st.run.stats.reservations.skipped_as_unverified += remaining;
                return Err(Halt::Auth(format!("{:?}", decision.reason)));
            }
            if !decision.cancel {
                st.run.stats.reservations.skipped_as_unverified += 1;
                continue;
            }
            if st.preview {
                st.run.stats.reservations.cancelled += 1;
                continue;
            }
            let key = format!("reconcile:{}:{id}", st.run.run_id);
            match self
                .store
                .upsert_reservation(
                    ReservationPatch::status_only(id.clone(), ReservationStatus::Cancelled),
                    Some(&key),
                    decision.permit(),
                )
                .await
            {
                Ok(_) => st.run.stats.reservations.cancelled += 1,
                Err(e) => {
                    st.run.stats.reservations.failed += 1;
                    st.error(format!("cancelling reservation {id}: {e}"));
                }
            }
        }
        Ok(())
    }
}
