//! Incremental sync: per-event mapping and upsert for webhook deliveries.

use std::sync::Arc;

use cs_channel::{ChannelApi, Mapper, MappingError, Resource, WebhookEnvelope};
use cs_core::store::{Store, StoreError};
use cs_core::types::{
    EntityKind, ReservationPatch, ReservationStatus, WebhookEvent, WebhookEventStatus,
};
use cs_harness::shutdown::{DrainGuard, ShutdownSignal};
use cs_telemetry::metrics::{global_metrics, names, record_webhook_event};
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::guard::SafetyGuard;

/// Rows re-driven per backlog sweep.
const BACKLOG_BATCH: usize = 500;

#[derive(Clone)]
pub struct IncrementalSync {
    store: Store,
    api: Arc<dyn ChannelApi>,
    mapper: Arc<Mapper>,
    guard: SafetyGuard,
    /// Event ids currently being handled; a re-enqueued id is skipped.
    in_flight: Arc<DashMap<Uuid, ()>>,
}

/// How one event ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub status: WebhookEventStatus,
    pub error: Option<String>,
}

impl EventOutcome {
    fn processed() -> Self {
        Self {
            status: WebhookEventStatus::Processed,
            error: None,
        }
    }

    fn ignored(note: impl Into<String>) -> Self {
        Self {
            status: WebhookEventStatus::Ignored,
            error: Some(note.into()),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WebhookEventStatus::Failed,
            error: Some(error.into()),
        }
    }
}

impl IncrementalSync {
    pub fn new(
        store: Store,
        api: Arc<dyn ChannelApi>,
        mapper: Arc<Mapper>,
        guard: SafetyGuard,
    ) -> Self {
        Self {
            store,
            api,
            mapper,
            guard,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Map and apply one stored event, then record how it ended.
    ///
    /// Returns `None` when the event was not pending or is already being
    /// handled by another worker.
    pub async fn process_event(&self, event_id: Uuid) -> Result<Option<EventOutcome>> {
        if self.in_flight.insert(event_id, ()).is_some() {
            debug!(%event_id, "event already in flight");
            return Ok(None);
        }
        let result = self.process_inner(event_id).await;
        self.in_flight.remove(&event_id);
        result
    }

    async fn process_inner(&self, event_id: Uuid) -> Result<Option<EventOutcome>> {
        let event = self
            .store
            .get_webhook_event(event_id)
            .await?
            .ok_or(SyncError::EventNotFound(event_id))?;
        if event.status != WebhookEventStatus::Pending {
            return Ok(None);
        }

        let outcome = match self.apply(&event).await {
            Ok(o) => o,
            Err(e) => EventOutcome::failed(e.to_string()),
        };
        match outcome.status {
            WebhookEventStatus::Failed => error!(
                %event_id,
                external_id = event.external_id.as_deref().unwrap_or(""),
                error = outcome.error.as_deref().unwrap_or(""),
                "webhook event failed"
            ),
            WebhookEventStatus::Ignored => info!(
                %event_id,
                note = outcome.error.as_deref().unwrap_or(""),
                "webhook event ignored"
            ),
            _ => debug!(%event_id, "webhook event processed"),
        }
        self.store
            .mark_webhook_event(event_id, outcome.status, outcome.error.clone())
            .await?;
        record_webhook_event(match outcome.status {
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Ignored => "ignored",
            _ => "failed",
        });
        Ok(Some(outcome))
    }

    async fn apply(&self, event: &WebhookEvent) -> Result<EventOutcome> {
        let body: Value = match serde_json::from_str(&event.raw_body) {
            Ok(v) => v,
            Err(e) => return Ok(EventOutcome::failed(format!("unparseable body: {e}"))),
        };
        let envelope = WebhookEnvelope::parse(&body);
        let (Some(kind), Some(record)) = (envelope.kind, envelope.record.as_ref()) else {
            return Ok(EventOutcome::ignored("no entity record in payload"));
        };
        let key = format!("webhook:{}", event.dedup_key);

        match kind {
            EntityKind::Reservation => self.apply_reservation(&envelope, record, &key).await,
            EntityKind::Property => match self.mapper.map_property(record) {
                Ok(p) => {
                    self.store.upsert_property(p, Some(&key)).await?;
                    Ok(EventOutcome::processed())
                }
                Err(e) => Ok(EventOutcome::failed(e.to_string())),
            },
            EntityKind::Guest => match self.mapper.map_guest(record) {
                Ok(g) => {
                    self.store.upsert_guest(g, Some(&key)).await?;
                    Ok(EventOutcome::processed())
                }
                Err(e) => Ok(EventOutcome::failed(e.to_string())),
            },
        }
    }

    async fn apply_reservation(
        &self,
        envelope: &WebhookEnvelope,
        record: &Value,
        key: &str,
    ) -> Result<EventOutcome> {
        let explicit_cancel = envelope.is_cancellation();
        let mut patch = match self.mapper.map_reservation(record) {
            Ok(p) => p,
            Err(MappingError::NotAReservation(t)) => {
                return Ok(EventOutcome::ignored(format!("calendar block of type {t}")));
            }
            Err(e) if explicit_cancel => {
                let Some(id) = envelope.external_id.clone() else {
                    return Ok(EventOutcome::failed(e.to_string()));
                };
                warn!(reservation = %id, error = %e, "cancellation event with unmappable record, applying status only");
                ReservationPatch::new(id)
            }
            Err(e) => return Ok(EventOutcome::failed(e.to_string())),
        };
        if explicit_cancel {
            patch.status = Some(ReservationStatus::Cancelled);
        }

        let current = self
            .store
            .get_reservation_by_external_id(&patch.external_id)
            .await?;
        if current.is_none() && explicit_cancel && patch.check_in.is_none() {
            return Ok(EventOutcome::ignored(format!(
                "cancellation for unknown reservation {}",
                patch.external_id
            )));
        }
        if let Some(listing) = &patch.property_external_id {
            self.ensure_listing(listing).await?;
        }
        let permit = self.guard.permit_for_remote(current.as_ref(), &patch);

        match self
            .store
            .upsert_reservation(patch, Some(key), permit.as_ref())
            .await
        {
            Ok(outcome) => {
                if outcome.replayed {
                    debug!(key, "idempotency key already applied");
                }
                Ok(EventOutcome::processed())
            }
            Err(e @ (StoreError::Incomplete { .. }
            | StoreError::InvalidRange { .. }
            | StoreError::CalendarOverlap { .. })) => Ok(EventOutcome::failed(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Import a listing the store has never seen before a reservation points
    /// at it. Lookup or mapping failures leave the store to create a bare
    /// placeholder, which the next full reconcile fills in.
    async fn ensure_listing(&self, external_id: &str) -> Result<()> {
        if self.store.get_property_by_external_id(external_id).await?.is_some() {
            return Ok(());
        }
        let raw = match self.api.fetch_by_id(Resource::Listings, external_id).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(listing = external_id, error = %e, "could not fetch unknown listing, using placeholder");
                return Ok(());
            }
        };
        match self.mapper.map_property(&raw) {
            Ok(patch) if patch.external_id == external_id => {
                let outcome = self.store.upsert_property(patch, None).await?;
                info!(listing = external_id, created = outcome.created, "imported listing for incoming reservation");
            }
            Ok(patch) => warn!(
                listing = external_id,
                returned = %patch.external_id,
                "listing lookup returned a different record, using placeholder"
            ),
            Err(e) => warn!(listing = external_id, error = %e, "unmappable listing, using placeholder"),
        }
        Ok(())
    }

    /// Re-enqueue events still `pending`, e.g. after a restart or a full
    /// queue. Returns how many were queued.
    pub async fn sweep_backlog(&self, queue: &flume::Sender<Uuid>) -> Result<usize> {
        let pending = self
            .store
            .list_webhook_events(WebhookEventStatus::Pending, BACKLOG_BATCH)
            .await?;
        let mut queued = 0;
        for event in pending {
            if self.in_flight.contains_key(&event.id) {
                continue;
            }
            if queue.send_async(event.id).await.is_err() {
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            info!(queued, "re-enqueued pending webhook events");
        }
        Ok(queued)
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Spawn `workers` tasks draining `queue` until shutdown. Each worker
/// finishes its current event, then confirms drain.
pub fn spawn_workers(
    sync: IncrementalSync,
    queue: flume::Receiver<Uuid>,
    workers: usize,
    shutdown: &ShutdownSignal,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|n| {
            let sync = sync.clone();
            let queue = queue.clone();
            let signal = shutdown.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                let _drain = DrainGuard::new(signal.clone());
                debug!(worker = n, "webhook worker started");
                loop {
                    if signal.is_shutting_down() {
                        break;
                    }
                    let event_id = tokio::select! {
                        _ = stop.recv() => break,
                        next = queue.recv_async() => match next {
                            Ok(id) => id,
                            Err(_) => break,
                        },
                    };
                    global_metrics().set_gauge(names::WEBHOOK_QUEUE_DEPTH, queue.len() as i64);
                    if let Err(e) = sync.process_event(event_id).await {
                        error!(worker = n, %event_id, error = %e, "webhook worker error");
                    }
                }
                debug!(worker = n, "webhook worker stopped");
            })
        })
        .collect()
}
