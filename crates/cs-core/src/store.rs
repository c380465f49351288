use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::calendar::{self, BlockState, BlockTransition, CalendarBlock};
use crate::config::DateType;
use crate::types::{
    CanonicalGuest, CanonicalProperty, CanonicalReservation, CancellationReason, Channel,
    ContactInfo, DateRange, EntityKind, GuestPatch, Price, PropertyPatch, ReconciliationRun,
    ReservationPatch, ReservationStatus, SyncChangeLogEntry, TransitionPermit, WebhookEvent,
    WebhookEventStatus,
};

/// Attempts of the read-merge-write cycle before a conflict is surfaced.
const MAX_WRITE_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// Another writer changed the row between our read and write.
    #[error("concurrent write conflict on {0}")]
    Conflict(String),

    #[error("block {range} for property {property_external_id} overlaps reservation {existing}")]
    CalendarOverlap {
        property_external_id: String,
        range: DateRange,
        existing: String,
    },

    #[error("moving reservation {external_id} from {from} to {to} requires verification")]
    CancellationRequiresVerification {
        external_id: String,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("cannot create {kind} {external_id}: missing {field}")]
    Incomplete {
        kind: EntityKind,
        external_id: String,
        field: &'static str,
    },

    #[error("reservation {external_id} has check_out {check_out} not after check_in {check_in}")]
    InvalidRange {
        external_id: String,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What an upsert did.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome<T> {
    pub entity: T,
    pub created: bool,
    /// At least one stored field differs from before.
    pub changed: bool,
    /// The idempotency key was already applied; `entity` is the prior result.
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Transactional SQLite store for canonical entities, the change log,
/// calendar blocks, raw webhook events, and reconciliation bookkeeping.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS properties (
                        internal_id  TEXT PRIMARY KEY,
                        external_id  TEXT NOT NULL UNIQUE,
                        name         TEXT,
                        address      TEXT,
                        amenities    TEXT NOT NULL,
                        raw_payload  TEXT NOT NULL,
                        version      INTEGER NOT NULL,
                        created_at   TEXT NOT NULL,
                        updated_at   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS guests (
                        internal_id  TEXT PRIMARY KEY,
                        external_id  TEXT UNIQUE,
                        name         TEXT,
                        email        TEXT,
                        phone        TEXT,
                        email_norm   TEXT,
                        phone_norm   TEXT,
                        raw_payload  TEXT NOT NULL,
                        version      INTEGER NOT NULL,
                        created_at   TEXT NOT NULL,
                        updated_at   TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_guests_email ON guests(email_norm);
                    CREATE INDEX IF NOT EXISTS idx_guests_phone ON guests(phone_norm);

                    CREATE TABLE IF NOT EXISTS reservations (
                        internal_id          TEXT PRIMARY KEY,
                        external_id          TEXT NOT NULL UNIQUE,
                        property_ref         TEXT NOT NULL REFERENCES properties(internal_id),
                        property_external_id TEXT NOT NULL,
                        guest_ref            TEXT,
                        guest_external_id    TEXT,
                        check_in             TEXT NOT NULL,
                        check_out            TEXT NOT NULL,
                        status               TEXT NOT NULL,
                        channel              TEXT NOT NULL,
                        price_minor          INTEGER,
                        currency             TEXT,
                        raw_payload          TEXT NOT NULL,
                        cancelled_at         TEXT,
                        cancellation_reason  TEXT,
                        booked_on            TEXT,
                        version              INTEGER NOT NULL,
                        created_at           TEXT NOT NULL,
                        updated_at           TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_reservations_status   ON reservations(status);
                    CREATE INDEX IF NOT EXISTS idx_reservations_check_in ON reservations(check_in);

                    CREATE TABLE IF NOT EXISTS change_log (
                        idempotency_key  TEXT PRIMARY KEY,
                        entity_kind      TEXT NOT NULL,
                        entity_id        TEXT NOT NULL,
                        field_or_payload TEXT NOT NULL,
                        result           TEXT NOT NULL,
                        applied_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log(entity_id);

                    CREATE TABLE IF NOT EXISTS calendar_blocks (
                        reservation_id TEXT PRIMARY KEY REFERENCES reservations(internal_id),
                        property_ref   TEXT NOT NULL,
                        start_date     TEXT NOT NULL,
                        end_date       TEXT NOT NULL,
                        created_at     TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_blocks_property_range
                        ON calendar_blocks(property_ref, start_date, end_date);

                    CREATE TABLE IF NOT EXISTS webhook_events (
                        id              TEXT PRIMARY KEY,
                        dedup_key       TEXT NOT NULL UNIQUE,
                        source_event_id TEXT,
                        action          TEXT,
                        entity_kind     TEXT,
                        external_id     TEXT,
                        raw_body        TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        error           TEXT,
                        received_at     TEXT NOT NULL,
                        processed_at    TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_webhook_events_status ON webhook_events(status);

                    CREATE TABLE IF NOT EXISTS reconciliation_runs (
                        run_id      TEXT PRIMARY KEY,
                        started_at  TEXT NOT NULL,
                        finished_at TEXT,
                        mode        TEXT NOT NULL,
                        dry_run     INTEGER NOT NULL,
                        status      TEXT NOT NULL,
                        stats       TEXT NOT NULL,
                        errors      TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS sync_cursors (
                        cursor_key TEXT PRIMARY KEY,
                        position   INTEGER NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Run `f` inside an immediate transaction, retrying the whole
    /// read-merge-write cycle when it reports a [`StoreError::Conflict`].
    async fn write<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Transaction<'_>) -> Result<T> + Clone + Send + 'static,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let f = f.clone();
            let res = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    match f(&tx) {
                        Ok(v) => {
                            tx.commit()?;
                            Ok(Ok(v))
                        }
                        Err(e) => Ok(Err(e)),
                    }
                })
                .await?;
            match res {
                Err(StoreError::Conflict(detail)) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(what, attempt, %detail, "write conflict, retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
        Err(StoreError::Conflict(format!("{what}: retries exhausted")))
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub async fn upsert_property(
        &self,
        patch: PropertyPatch,
        idempotency_key: Option<&str>,
    ) -> Result<UpsertOutcome<CanonicalProperty>> {
        let key = idempotency_key.map(str::to_string);
        self.write("upsert_property", move |tx| {
            apply_property(tx, &patch, key.as_deref())
        })
        .await
    }

    pub async fn get_property_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CanonicalProperty>> {
        let external_id = external_id.to_string();
        let found = self
            .conn
            .call(move |conn| Ok(select_property(conn, &external_id)?))
            .await?;
        Ok(found)
    }

    // -----------------------------------------------------------------------
    // Guests
    // -----------------------------------------------------------------------

    pub async fn upsert_guest(
        &self,
        patch: GuestPatch,
        idempotency_key: Option<&str>,
    ) -> Result<UpsertOutcome<CanonicalGuest>> {
        let key = idempotency_key.map(str::to_string);
        self.write("upsert_guest", move |tx| {
            apply_guest(tx, &patch, key.as_deref())
        })
        .await
    }

    pub async fn get_guest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CanonicalGuest>> {
        let external_id = external_id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_guest_where(
                    conn,
                    "external_id = ?1",
                    rusqlite::params![external_id],
                )?)
            })
            .await?;
        Ok(found)
    }

    /// Insert a guest that did not come from the channel (no external id).
    pub async fn insert_local_guest(
        &self,
        name: Option<String>,
        contact: ContactInfo,
    ) -> Result<CanonicalGuest> {
        self.write("insert_local_guest", move |tx| {
            let now = Utc::now();
            let guest = CanonicalGuest {
                internal_id: Uuid::new_v4(),
                external_id: None,
                name: name.clone(),
                contact: contact.clone(),
                raw_origin_payload: serde_json::json!({}),
                version: 1,
                created_at: now,
                updated_at: now,
            };
            insert_guest_row(tx, &guest)?;
            Ok(guest)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Create or merge a reservation keyed by its external id.
    ///
    /// Only fields present in `patch` are written. A transition that cancels
    /// the reservation or releases its calendar block needs a `permit`
    /// covering exactly that reservation and target status. The status
    /// write and the block change commit together.
    pub async fn upsert_reservation(
        &self,
        patch: ReservationPatch,
        idempotency_key: Option<&str>,
        permit: Option<&TransitionPermit>,
    ) -> Result<UpsertOutcome<CanonicalReservation>> {
        let key = idempotency_key.map(str::to_string);
        let permit = permit.cloned();
        self.write("upsert_reservation", move |tx| {
            apply_reservation(tx, &patch, key.as_deref(), permit.as_ref())
        })
        .await
    }

    /// Revert a cancellation. `patch` must carry the active status the
    /// source reports for the reservation.
    pub async fn restore_reservation(
        &self,
        patch: ReservationPatch,
        idempotency_key: Option<&str>,
    ) -> Result<UpsertOutcome<CanonicalReservation>> {
        let key = idempotency_key.map(str::to_string);
        self.write("restore_reservation", move |tx| {
            let current = select_reservation(tx, &patch.external_id)?
                .ok_or_else(|| StoreError::NotFound(patch.external_id.clone()))?;
            let target = patch.status.unwrap_or(ReservationStatus::Cancelled);
            if current.status != ReservationStatus::Cancelled
                || target == ReservationStatus::Cancelled
            {
                return Ok(UpsertOutcome {
                    entity: current,
                    created: false,
                    changed: false,
                    replayed: false,
                });
            }
            apply_reservation(tx, &patch, key.as_deref(), None)
        })
        .await
    }

    pub async fn get_reservation_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CanonicalReservation>> {
        let external_id = external_id.to_string();
        let found = self
            .conn
            .call(move |conn| Ok(select_reservation(conn, &external_id)?))
            .await?;
        Ok(found)
    }

    /// External ids of non-cancelled reservations whose `date_type` date
    /// falls in `window`.
    pub async fn list_active_reservation_ids(
        &self,
        window: DateRange,
        date_type: DateType,
    ) -> Result<Vec<String>> {
        let column = match date_type {
            DateType::Arrival => "check_in",
            DateType::Departure => "check_out",
            // Channel booking date, falling back to the day we first saw it.
            DateType::Creation => "COALESCE(booked_on, substr(created_at, 1, 10))",
        };
        let sql = format!(
            "SELECT external_id FROM reservations
             WHERE status != 'cancelled' AND {column} >= ?1 AND {column} < ?2
             ORDER BY external_id"
        );
        let from = window.start.to_string();
        let to = window.end.to_string();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![from, to], |r| r.get(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
            })
            .await?;
        Ok(ids)
    }

    pub async fn list_cancelled_by_reason(
        &self,
        reasons: &[CancellationReason],
    ) -> Result<Vec<CanonicalReservation>> {
        let reasons: Vec<String> = reasons.iter().map(|r| r.as_str().to_string()).collect();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{RESERVATION_SELECT} WHERE status = 'cancelled' ORDER BY cancelled_at"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let r = row_to_reservation(row)?;
                    if r
                        .cancellation_reason
                        .map(|c| reasons.iter().any(|want| want == c.as_str()))
                        .unwrap_or(false)
                    {
                        out.push(r);
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(found)
    }

    pub async fn list_reservations_for_property(
        &self,
        property_ref: Uuid,
    ) -> Result<Vec<CanonicalReservation>> {
        let property_ref = property_ref.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{RESERVATION_SELECT} WHERE property_ref = ?1 ORDER BY check_in"
                ))?;
                let mut rows = stmt.query(rusqlite::params![property_ref])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_reservation(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(found)
    }

    // -----------------------------------------------------------------------
    // Calendar blocks and change log
    // -----------------------------------------------------------------------

    pub async fn blocks_for_property(&self, property_ref: Uuid) -> Result<Vec<CalendarBlock>> {
        let property_ref = property_ref.to_string();
        let blocks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT reservation_id, property_ref, start_date, end_date
                     FROM calendar_blocks WHERE property_ref = ?1 ORDER BY start_date",
                )?;
                let mut rows = stmt.query(rusqlite::params![property_ref])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_block(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(blocks)
    }

    pub async fn change_log_for(&self, entity_id: Uuid) -> Result<Vec<SyncChangeLogEntry>> {
        let entity_id = entity_id.to_string();
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT idempotency_key, entity_kind, entity_id, field_or_payload, applied_at
                     FROM change_log WHERE entity_id = ?1 ORDER BY applied_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![entity_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(SyncChangeLogEntry {
                        idempotency_key: row.get(0)?,
                        entity_kind: enum_from_sql(1, &row.get::<_, String>(1)?)?,
                        entity_id: parse_uuid(2, &row.get::<_, String>(2)?)?,
                        field_or_payload: parse_json(3, &row.get::<_, String>(3)?)?,
                        applied_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(entries)
    }

    pub async fn count_change_log(&self) -> Result<u64> {
        let n = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM change_log", [], |r| {
                    r.get::<_, u64>(0)
                })?)
            })
            .await?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Webhook events
    // -----------------------------------------------------------------------

    /// Persist a raw delivery. Returns `false` when its dedup key was
    /// already stored.
    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let e = event.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT INTO webhook_events (id, dedup_key, source_event_id, action,
                        entity_kind, external_id, raw_body, status, error, received_at, processed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(dedup_key) DO NOTHING",
                    rusqlite::params![
                        e.id.to_string(),
                        e.dedup_key,
                        e.source_event_id,
                        e.action,
                        e.entity_kind.map(|k| k.as_str()),
                        e.external_id,
                        e.raw_body,
                        webhook_status_sql(e.status),
                        e.error,
                        e.received_at.to_rfc3339(),
                        e.processed_at.map(|d| d.to_rfc3339()),
                    ],
                )?;
                Ok(n == 1)
            })
            .await?;
        Ok(inserted)
    }

    pub async fn mark_webhook_event(
        &self,
        id: Uuid,
        status: WebhookEventStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE webhook_events SET status = ?2, error = ?3, processed_at = ?4
                     WHERE id = ?1",
                    rusqlite::params![id, webhook_status_sql(status), error, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_webhook_event(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{WEBHOOK_SELECT} WHERE id = ?1"))?;
                Ok(stmt
                    .query_row(rusqlite::params![id], row_to_webhook_event)
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn list_webhook_events(
        &self,
        status: WebhookEventStatus,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>> {
        let status = webhook_status_sql(status);
        let limit = limit as i64;
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{WEBHOOK_SELECT} WHERE status = ?1 ORDER BY received_at LIMIT ?2"
                ))?;
                let rows = stmt.query_map(rusqlite::params![status, limit], row_to_webhook_event)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(found)
    }

    // -----------------------------------------------------------------------
    // Reconciliation runs and cursors
    // -----------------------------------------------------------------------

    pub async fn save_run(&self, run: &ReconciliationRun) -> Result<()> {
        let run_id = run.run_id.to_string();
        let started_at = run.started_at.to_rfc3339();
        let finished_at = run.finished_at.map(|d| d.to_rfc3339());
        let mode = enum_to_sql(&run.mode)?;
        let status = enum_to_sql(&run.status)?;
        let dry_run = run.dry_run;
        let stats = serde_json::to_string(&run.stats)?;
        let errors = serde_json::to_string(&run.errors)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO reconciliation_runs
                        (run_id, started_at, finished_at, mode, dry_run, status, stats, errors)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(run_id) DO UPDATE SET
                        finished_at=excluded.finished_at, status=excluded.status,
                        stats=excluded.stats, errors=excluded.errors",
                    rusqlite::params![
                        run_id, started_at, finished_at, mode, dry_run, status, stats, errors
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<ReconciliationRun>> {
        let run_id = run_id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{RUN_SELECT} WHERE run_id = ?1"))?;
                Ok(stmt.query_row(rusqlite::params![run_id], row_to_run).optional()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<ReconciliationRun>> {
        let limit = limit as i64;
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{RUN_SELECT} ORDER BY started_at DESC LIMIT ?1"))?;
                let rows = stmt.query_map(rusqlite::params![limit], row_to_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn get_cursor(&self, cursor_key: &str) -> Result<Option<u64>> {
        let cursor_key = cursor_key.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT position FROM sync_cursors WHERE cursor_key = ?1",
                        rusqlite::params![cursor_key],
                        |r| r.get::<_, u64>(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn set_cursor(&self, cursor_key: &str, position: u64) -> Result<()> {
        let cursor_key = cursor_key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (cursor_key, position, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(cursor_key) DO UPDATE SET
                        position=excluded.position, updated_at=excluded.updated_at",
                    rusqlite::params![cursor_key, position, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear_cursor(&self, cursor_key: &str) -> Result<()> {
        let cursor_key = cursor_key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM sync_cursors WHERE cursor_key = ?1",
                    rusqlite::params![cursor_key],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transactional apply functions
// ---------------------------------------------------------------------------

fn apply_property(
    tx: &Transaction<'_>,
    patch: &PropertyPatch,
    key: Option<&str>,
) -> Result<UpsertOutcome<CanonicalProperty>> {
    if let Some(prior) = replayed::<CanonicalProperty>(tx, key)? {
        return Ok(prior);
    }
    let now = Utc::now();
    let outcome = match select_property(tx, &patch.external_id)? {
        None => {
            let mut property = CanonicalProperty {
                internal_id: Uuid::new_v4(),
                external_id: patch.external_id.clone(),
                name: None,
                address: None,
                amenities: Vec::new(),
                raw_origin_payload: serde_json::json!({}),
                version: 1,
                created_at: now,
                updated_at: now,
            };
            patch.merge_into(&mut property);
            insert_property_row(tx, &property)?;
            UpsertOutcome {
                entity: property,
                created: true,
                changed: true,
                replayed: false,
            }
        }
        Some(existing) => {
            let mut property = existing.clone();
            let changed = patch.merge_into(&mut property);
            if changed {
                property.version = existing.version + 1;
                property.updated_at = now;
                let n = tx.execute(
                    "UPDATE properties SET name=?3, address=?4, amenities=?5, raw_payload=?6,
                        version=?7, updated_at=?8
                     WHERE internal_id=?1 AND version=?2",
                    rusqlite::params![
                        property.internal_id.to_string(),
                        existing.version,
                        property.name,
                        property.address.as_ref().map(|v| v.to_string()),
                        serde_json::to_string(&property.amenities)?,
                        property.raw_origin_payload.to_string(),
                        property.version,
                        property.updated_at.to_rfc3339(),
                    ],
                )?;
                if n == 0 {
                    return Err(StoreError::Conflict(format!("property {}", patch.external_id)));
                }
            }
            UpsertOutcome {
                entity: property,
                created: false,
                changed,
                replayed: false,
            }
        }
    };
    record_change(tx, key, EntityKind::Property, patch, &outcome)?;
    Ok(outcome)
}

fn apply_guest(
    tx: &Transaction<'_>,
    patch: &GuestPatch,
    key: Option<&str>,
) -> Result<UpsertOutcome<CanonicalGuest>> {
    if let Some(prior) = replayed::<CanonicalGuest>(tx, key)? {
        return Ok(prior);
    }
    let now = Utc::now();
    let existing = match select_guest_where(
        tx,
        "external_id = ?1",
        rusqlite::params![patch.external_id],
    )? {
        Some(g) => Some(g),
        None => find_guest_by_contact(tx, patch)?,
    };

    let outcome = match existing {
        None => {
            let mut guest = CanonicalGuest {
                internal_id: Uuid::new_v4(),
                external_id: Some(patch.external_id.clone()),
                name: None,
                contact: ContactInfo::default(),
                raw_origin_payload: serde_json::json!({}),
                version: 1,
                created_at: now,
                updated_at: now,
            };
            patch.merge_into(&mut guest);
            insert_guest_row(tx, &guest)?;
            UpsertOutcome {
                entity: guest,
                created: true,
                changed: true,
                replayed: false,
            }
        }
        Some(existing) => {
            let mut guest = existing.clone();
            let changed = patch.merge_into(&mut guest);
            if changed {
                guest.version = existing.version + 1;
                guest.updated_at = now;
                let n = tx.execute(
                    "UPDATE guests SET external_id=?3, name=?4, email=?5, phone=?6,
                        email_norm=?7, phone_norm=?8, raw_payload=?9, version=?10, updated_at=?11
                     WHERE internal_id=?1 AND version=?2",
                    rusqlite::params![
                        guest.internal_id.to_string(),
                        existing.version,
                        guest.external_id,
                        guest.name,
                        guest.contact.email,
                        guest.contact.phone,
                        guest.contact.normalized_email(),
                        guest.contact.normalized_phone(),
                        guest.raw_origin_payload.to_string(),
                        guest.version,
                        guest.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| conflict_on_unique(e, &patch.external_id))?;
                if n == 0 {
                    return Err(StoreError::Conflict(format!("guest {}", patch.external_id)));
                }
            }
            UpsertOutcome {
                entity: guest,
                created: false,
                changed,
                replayed: false,
            }
        }
    };
    record_change(tx, key, EntityKind::Guest, patch, &outcome)?;
    Ok(outcome)
}

/// Secondary dedup: a guest created outside the channel (no external id)
/// whose normalised email or phone matches.
fn find_guest_by_contact(
    conn: &rusqlite::Connection,
    patch: &GuestPatch,
) -> Result<Option<CanonicalGuest>> {
    let contact = ContactInfo {
        email: patch.email.clone(),
        phone: patch.phone.clone(),
    };
    if let Some(email) = contact.normalized_email() {
        if let Some(g) = select_guest_where(
            conn,
            "external_id IS NULL AND email_norm = ?1",
            rusqlite::params![email],
        )? {
            return Ok(Some(g));
        }
    }
    if let Some(phone) = contact.normalized_phone() {
        return Ok(select_guest_where(
            conn,
            "external_id IS NULL AND phone_norm = ?1",
            rusqlite::params![phone],
        )?);
    }
    Ok(None)
}

fn apply_reservation(
    tx: &Transaction<'_>,
    patch: &ReservationPatch,
    key: Option<&str>,
    permit: Option<&TransitionPermit>,
) -> Result<UpsertOutcome<CanonicalReservation>> {
    if let Some(prior) = replayed::<CanonicalReservation>(tx, key)? {
        debug!(external_id = %patch.external_id, "idempotency key already applied");
        return Ok(prior);
    }
    let now = Utc::now();

    let outcome = match select_reservation(tx, &patch.external_id)? {
        None => {
            let incomplete = |field| StoreError::Incomplete {
                kind: EntityKind::Reservation,
                external_id: patch.external_id.clone(),
                field,
            };
            let property_external_id = patch
                .property_external_id
                .clone()
                .ok_or_else(|| incomplete("property"))?;
            let check_in = patch.check_in.ok_or_else(|| incomplete("check_in"))?;
            let check_out = patch.check_out.ok_or_else(|| incomplete("check_out"))?;
            let status = patch.status.ok_or_else(|| incomplete("status"))?;
            ensure_range(&patch.external_id, check_in, check_out)?;

            let property_ref = ensure_property(tx, &property_external_id, now)?;
            let guest_ref = resolve_guest_ref(tx, patch.guest_external_id.as_deref())?;
            let cancelled = status == ReservationStatus::Cancelled;
            let reservation = CanonicalReservation {
                internal_id: Uuid::new_v4(),
                external_id: patch.external_id.clone(),
                property_ref,
                property_external_id,
                guest_ref,
                guest_external_id: patch.guest_external_id.clone(),
                check_in,
                check_out,
                status,
                channel: patch.channel.unwrap_or(Channel::Direct),
                price: patch.price.clone(),
                raw_origin_payload: patch
                    .raw_payload
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
                cancelled_at: cancelled.then_some(now),
                cancellation_reason: cancelled.then(|| {
                    permit
                        .and_then(|p| p.reason())
                        .unwrap_or(CancellationReason::RemoteCancelled)
                }),
                booked_on: patch.booked_on,
                version: 1,
                created_at: now,
                updated_at: now,
            };
            insert_reservation_row(tx, &reservation)
                .map_err(|e| conflict_on_unique(e, &patch.external_id))?;
            let transition = calendar::on_reservation_change(None, &block_state(&reservation));
            apply_block(tx, &reservation, transition, now)?;
            UpsertOutcome {
                entity: reservation,
                created: true,
                changed: true,
                replayed: false,
            }
        }
        Some(existing) => {
            let mut next = existing.clone();
            let mut changed = patch.merge_into(&mut next);

            if existing.status != next.status
                && calendar::requires_permit(existing.status, next.status)
            {
                let allowed = permit
                    .map(|p| p.covers(&next.external_id, next.status))
                    .unwrap_or(false);
                if !allowed {
                    return Err(StoreError::CancellationRequiresVerification {
                        external_id: next.external_id.clone(),
                        from: existing.status,
                        to: next.status,
                    });
                }
            }
            ensure_range(&next.external_id, next.check_in, next.check_out)?;

            if next.property_external_id != existing.property_external_id {
                next.property_ref = ensure_property(tx, &next.property_external_id, now)?;
            }
            if next.guest_ref.is_none() || next.guest_external_id != existing.guest_external_id {
                let resolved = resolve_guest_ref(tx, next.guest_external_id.as_deref())?;
                if resolved.is_some() && resolved != next.guest_ref {
                    next.guest_ref = resolved;
                    changed = true;
                }
            }

            if next.status != existing.status {
                if next.status == ReservationStatus::Cancelled {
                    next.cancelled_at = Some(now);
                    next.cancellation_reason = Some(
                        permit
                            .and_then(|p| p.reason())
                            .unwrap_or(CancellationReason::RemoteCancelled),
                    );
                } else if existing.status == ReservationStatus::Cancelled {
                    next.cancelled_at = None;
                    next.cancellation_reason = None;
                }
            }

            if changed {
                next.version = existing.version + 1;
                next.updated_at = now;
                update_reservation_row(tx, &next, existing.version)?;
                let transition = calendar::on_reservation_change(
                    Some(&block_state(&existing)),
                    &block_state(&next),
                );
                apply_block(tx, &next, transition, now)?;
            }
            UpsertOutcome {
                entity: next,
                created: false,
                changed,
                replayed: false,
            }
        }
    };
    record_change(tx, key, EntityKind::Reservation, patch, &outcome)?;
    Ok(outcome)
}

fn ensure_range(external_id: &str, check_in: NaiveDate, check_out: NaiveDate) -> Result<()> {
    if DateRange::new(check_in, check_out).is_none() {
        return Err(StoreError::InvalidRange {
            external_id: external_id.to_string(),
            check_in,
            check_out,
        });
    }
    Ok(())
}

fn block_state(r: &CanonicalReservation) -> BlockState {
    BlockState {
        status: r.status,
        stay: r.stay(),
        property_ref: r.property_ref,
    }
}

fn apply_block(
    tx: &Transaction<'_>,
    reservation: &CanonicalReservation,
    transition: BlockTransition,
    now: DateTime<Utc>,
) -> Result<()> {
    let reservation_id = reservation.internal_id.to_string();
    match transition {
        BlockTransition::Keep => Ok(()),
        BlockTransition::Remove => {
            tx.execute(
                "DELETE FROM calendar_blocks WHERE reservation_id = ?1",
                rusqlite::params![reservation_id],
            )?;
            debug!(external_id = %reservation.external_id, "calendar block removed");
            Ok(())
        }
        BlockTransition::Create(range) | BlockTransition::Replace(range) => {
            let property_ref = reservation.property_ref.to_string();
            let clash: Option<String> = tx
                .query_row(
                    "SELECT r.external_id FROM calendar_blocks b
                     JOIN reservations r ON r.internal_id = b.reservation_id
                     WHERE b.property_ref = ?1 AND b.start_date < ?3 AND b.end_date > ?2
                       AND b.reservation_id != ?4
                     LIMIT 1",
                    rusqlite::params![
                        property_ref,
                        range.start.to_string(),
                        range.end.to_string(),
                        reservation_id
                    ],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(existing) = clash {
                return Err(StoreError::CalendarOverlap {
                    property_external_id: reservation.property_external_id.clone(),
                    range,
                    existing,
                });
            }
            tx.execute(
                "INSERT INTO calendar_blocks (reservation_id, property_ref, start_date, end_date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(reservation_id) DO UPDATE SET
                    property_ref=excluded.property_ref, start_date=excluded.start_date,
                    end_date=excluded.end_date",
                rusqlite::params![
                    reservation_id,
                    property_ref,
                    range.start.to_string(),
                    range.end.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            debug!(external_id = %reservation.external_id, %range, "calendar block written");
            Ok(())
        }
    }
}

/// Find the property by external id, creating a placeholder on first sighting.
fn ensure_property(tx: &Transaction<'_>, external_id: &str, now: DateTime<Utc>) -> Result<Uuid> {
    if let Some(p) = select_property(tx, external_id)? {
        return Ok(p.internal_id);
    }
    let property = CanonicalProperty {
        internal_id: Uuid::new_v4(),
        external_id: external_id.to_string(),
        name: None,
        address: None,
        amenities: Vec::new(),
        raw_origin_payload: serde_json::json!({}),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    insert_property_row(tx, &property)?;
    Ok(property.internal_id)
}

fn resolve_guest_ref(conn: &rusqlite::Connection, external_id: Option<&str>) -> Result<Option<Uuid>> {
    let Some(external_id) = external_id else {
        return Ok(None);
    };
    let guest = select_guest_where(conn, "external_id = ?1", rusqlite::params![external_id])?;
    Ok(guest.map(|g| g.internal_id))
}

fn replayed<T: DeserializeOwned>(
    conn: &rusqlite::Connection,
    key: Option<&str>,
) -> Result<Option<UpsertOutcome<T>>> {
    let Some(key) = key else {
        return Ok(None);
    };
    let result: Option<String> = conn
        .query_row(
            "SELECT result FROM change_log WHERE idempotency_key = ?1",
            rusqlite::params![key],
            |r| r.get(0),
        )
        .optional()?;
    match result {
        Some(json) => Ok(Some(UpsertOutcome {
            entity: serde_json::from_str(&json)?,
            created: false,
            changed: false,
            replayed: true,
        })),
        None => Ok(None),
    }
}

/// Append to the change log. Unchanged writes without a caller key are not
/// mutations and leave no row.
fn record_change<P: serde::Serialize, T: serde::Serialize + HasInternalId>(
    tx: &Transaction<'_>,
    key: Option<&str>,
    kind: EntityKind,
    patch: &P,
    outcome: &UpsertOutcome<T>,
) -> Result<()> {
    if key.is_none() && !outcome.changed {
        return Ok(());
    }
    let key = key
        .map(str::to_string)
        .unwrap_or_else(|| format!("local:{}", Uuid::new_v4()));
    tx.execute(
        "INSERT INTO change_log (idempotency_key, entity_kind, entity_id, field_or_payload, result, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            key,
            kind.as_str(),
            outcome.entity.internal_id().to_string(),
            serde_json::to_string(patch)?,
            serde_json::to_string(&outcome.entity)?,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| conflict_on_unique(e, &key))?;
    Ok(())
}

trait HasInternalId {
    fn internal_id(&self) -> Uuid;
}

impl HasInternalId for CanonicalProperty {
    fn internal_id(&self) -> Uuid {
        self.internal_id
    }
}

impl HasInternalId for CanonicalGuest {
    fn internal_id(&self) -> Uuid {
        self.internal_id
    }
}

impl HasInternalId for CanonicalReservation {
    fn internal_id(&self) -> Uuid {
        self.internal_id
    }
}

/// A unique-constraint failure means a concurrent writer got there first.
fn conflict_on_unique(e: rusqlite::Error, what: &str) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(what.to_string())
        }
        _ => StoreError::from(e),
    }
}

// ---------------------------------------------------------------------------
// Row writes
// ---------------------------------------------------------------------------

fn insert_property_row(conn: &rusqlite::Connection, p: &CanonicalProperty) -> Result<()> {
    conn.execute(
        "INSERT INTO properties (internal_id, external_id, name, address, amenities,
            raw_payload, version, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        rusqlite::params![
            p.internal_id.to_string(),
            p.external_id,
            p.name,
            p.address.as_ref().map(|v| v.to_string()),
            serde_json::to_string(&p.amenities)?,
            p.raw_origin_payload.to_string(),
            p.version,
            p.created_at.to_rfc3339(),
            p.updated_at.to_rfc3339(),
        ],
    )
    .map_err(|e| conflict_on_unique(e, &p.external_id))?;
    Ok(())
}

fn insert_guest_row(conn: &rusqlite::Connection, g: &CanonicalGuest) -> Result<()> {
    conn.execute(
        "INSERT INTO guests (internal_id, external_id, name, email, phone, email_norm,
            phone_norm, raw_payload, version, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        rusqlite::params![
            g.internal_id.to_string(),
            g.external_id,
            g.name,
            g.contact.email,
            g.contact.phone,
            g.contact.normalized_email(),
            g.contact.normalized_phone(),
            g.raw_origin_payload.to_string(),
            g.version,
            g.created_at.to_rfc3339(),
            g.updated_at.to_rfc3339(),
        ],
    )
    .map_err(|e| conflict_on_unique(e, g.external_id.as_deref().unwrap_or("local guest")))?;
    Ok(())
}

fn insert_reservation_row(
    conn: &rusqlite::Connection,
    r: &CanonicalReservation,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO reservations (internal_id, external_id, property_ref, property_external_id,
            guest_ref, guest_external_id, check_in, check_out, status, channel, price_minor,
            currency, raw_payload, cancelled_at, cancellation_reason, version, created_at, updated_at,
            booked_on)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
        rusqlite::params![
            r.internal_id.to_string(),
            r.external_id,
            r.property_ref.to_string(),
            r.property_external_id,
            r.guest_ref.map(|u| u.to_string()),
            r.guest_external_id,
            r.check_in.to_string(),
            r.check_out.to_string(),
            r.status.as_str(),
            r.channel.as_str(),
            r.price.as_ref().map(|p| p.amount_minor),
            r.price.as_ref().map(|p| p.currency.clone()),
            r.raw_origin_payload.to_string(),
            r.cancelled_at.map(|d| d.to_rfc3339()),
            r.cancellation_reason.map(|c| c.as_str()),
            r.version,
            r.created_at.to_rfc3339(),
            r.updated_at.to_rfc3339(),
            r.booked_on.map(|d| d.to_string()),
        ],
    )
}

fn update_reservation_row(
    conn: &rusqlite::Connection,
    r: &CanonicalReservation,
    expected_version: i64,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE reservations SET property_ref=?3, property_external_id=?4, guest_ref=?5,
            guest_external_id=?6, check_in=?7, check_out=?8, status=?9, channel=?10,
            price_minor=?11, currency=?12, raw_payload=?13, cancelled_at=?14,
            cancellation_reason=?15, version=?16, updated_at=?17, booked_on=?18
         WHERE internal_id=?1 AND version=?2",
        rusqlite::params![
            r.internal_id.to_string(),
            expected_version,
            r.property_ref.to_string(),
            r.property_external_id,
            r.guest_ref.map(|u| u.to_string()),
            r.guest_external_id,
            r.check_in.to_string(),
            r.check_out.to_string(),
            r.status.as_str(),
            r.channel.as_str(),
            r.price.as_ref().map(|p| p.amount_minor),
            r.price.as_ref().map(|p| p.currency.clone()),
            r.raw_origin_payload.to_string(),
            r.cancelled_at.map(|d| d.to_rfc3339()),
            r.cancellation_reason.map(|c| c.as_str()),
            r.version,
            r.updated_at.to_rfc3339(),
            r.booked_on.map(|d| d.to_string()),
        ],
    )?;
    if n == 0 {
        return Err(StoreError::Conflict(format!("reservation {}", r.external_id)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row reads
// ---------------------------------------------------------------------------

const RESERVATION_SELECT: &str = "SELECT internal_id, external_id, property_ref,
    property_external_id, guest_ref, guest_external_id, check_in, check_out, status, channel,
    price_minor, currency, raw_payload, cancelled_at, cancellation_reason, version, created_at,
    updated_at, booked_on FROM reservations";

const WEBHOOK_SELECT: &str = "SELECT id, dedup_key, source_event_id, action, entity_kind,
    external_id, raw_body, status, error, received_at, processed_at FROM webhook_events";

const RUN_SELECT: &str = "SELECT run_id, started_at, finished_at, mode, dry_run, status, stats,
    errors FROM reconciliation_runs";

fn select_property(
    conn: &rusqlite::Connection,
    external_id: &str,
) -> rusqlite::Result<Option<CanonicalProperty>> {
    conn.query_row(
        "SELECT internal_id, external_id, name, address, amenities, raw_payload, version,
                created_at, updated_at
         FROM properties WHERE external_id = ?1",
        rusqlite::params![external_id],
        row_to_property,
    )
    .optional()
}

fn select_guest_where(
    conn: &rusqlite::Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Option<CanonicalGuest>> {
    conn.query_row(
        &format!(
            "SELECT internal_id, external_id, name, email, phone, raw_payload, version,
                    created_at, updated_at
             FROM guests WHERE {clause} LIMIT 1"
        ),
        params,
        row_to_guest,
    )
    .optional()
}

fn select_reservation(
    conn: &rusqlite::Connection,
    external_id: &str,
) -> rusqlite::Result<Option<CanonicalReservation>> {
    conn.query_row(
        &format!("{RESERVATION_SELECT} WHERE external_id = ?1"),
        rusqlite::params![external_id],
        row_to_reservation,
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn enum_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| conversion_error(idx, e))
}

fn enum_to_sql<T: serde::Serialize>(val: &T) -> Result<String> {
    match serde_json::to_value(val)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn webhook_status_sql(status: WebhookEventStatus) -> &'static str {
    match status {
        WebhookEventStatus::Pending => "pending",
        WebhookEventStatus::Processed => "processed",
        WebhookEventStatus::Failed => "failed",
        WebhookEventStatus::Ignored => "ignored",
        WebhookEventStatus::Rejected => "rejected",
    }
}

fn row_to_property(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalProperty> {
    let address: Option<String> = row.get(3)?;
    let amenities: String = row.get(4)?;
    Ok(CanonicalProperty {
        internal_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        external_id: row.get(1)?,
        name: row.get(2)?,
        address: address.map(|a| parse_json(3, &a)).transpose()?,
        amenities: serde_json::from_str(&amenities).map_err(|e| conversion_error(4, e))?,
        raw_origin_payload: parse_json(5, &row.get::<_, String>(5)?)?,
        version: row.get(6)?,
        created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_ts(8, &row.get::<_, String>(8)?)?,
    })
}

fn row_to_guest(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalGuest> {
    Ok(CanonicalGuest {
        internal_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        external_id: row.get(1)?,
        name: row.get(2)?,
        contact: ContactInfo {
            email: row.get(3)?,
            phone: row.get(4)?,
        },
        raw_origin_payload: parse_json(5, &row.get::<_, String>(5)?)?,
        version: row.get(6)?,
        created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_ts(8, &row.get::<_, String>(8)?)?,
    })
}

fn row_to_reservation(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalReservation> {
    let guest_ref: Option<String> = row.get(4)?;
    let price_minor: Option<i64> = row.get(10)?;
    let currency: Option<String> = row.get(11)?;
    let cancelled_at: Option<String> = row.get(13)?;
    let reason: Option<String> = row.get(14)?;
    let booked_on: Option<String> = row.get(18)?;
    Ok(CanonicalReservation {
        internal_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        external_id: row.get(1)?,
        property_ref: parse_uuid(2, &row.get::<_, String>(2)?)?,
        property_external_id: row.get(3)?,
        guest_ref: guest_ref.map(|g| parse_uuid(4, &g)).transpose()?,
        guest_external_id: row.get(5)?,
        check_in: parse_date(6, &row.get::<_, String>(6)?)?,
        check_out: parse_date(7, &row.get::<_, String>(7)?)?,
        status: enum_from_sql(8, &row.get::<_, String>(8)?)?,
        channel: enum_from_sql(9, &row.get::<_, String>(9)?)?,
        price: price_minor.map(|amount_minor| Price {
            amount_minor,
            currency: currency.unwrap_or_default(),
        }),
        raw_origin_payload: parse_json(12, &row.get::<_, String>(12)?)?,
        cancelled_at: cancelled_at.map(|c| parse_ts(13, &c)).transpose()?,
        cancellation_reason: reason.map(|r| enum_from_sql(14, &r)).transpose()?,
        booked_on: booked_on.map(|d| parse_date(18, &d)).transpose()?,
        version: row.get(15)?,
        created_at: parse_ts(16, &row.get::<_, String>(16)?)?,
        updated_at: parse_ts(17, &row.get::<_, String>(17)?)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<CalendarBlock> {
    Ok(CalendarBlock {
        source_reservation_ref: parse_uuid(0, &row.get::<_, String>(0)?)?,
        property_ref: parse_uuid(1, &row.get::<_, String>(1)?)?,
        date_range: DateRange {
            start: parse_date(2, &row.get::<_, String>(2)?)?,
            end: parse_date(3, &row.get::<_, String>(3)?)?,
        },
    })
}

fn row_to_webhook_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookEvent> {
    let kind: Option<String> = row.get(4)?;
    let processed_at: Option<String> = row.get(10)?;
    Ok(WebhookEvent {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        dedup_key: row.get(1)?,
        source_event_id: row.get(2)?,
        action: row.get(3)?,
        entity_kind: kind.map(|k| enum_from_sql(4, &k)).transpose()?,
        external_id: row.get(5)?,
        raw_body: row.get(6)?,
        status: enum_from_sql(7, &row.get::<_, String>(7)?)?,
        error: row.get(8)?,
        received_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        processed_at: processed_at.map(|p| parse_ts(10, &p)).transpose()?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReconciliationRun> {
    let finished_at: Option<String> = row.get(2)?;
    let stats: String = row.get(6)?;
    let errors: String = row.get(7)?;
    Ok(ReconciliationRun {
        run_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        started_at: parse_ts(1, &row.get::<_, String>(1)?)?,
        finished_at: finished_at.map(|f| parse_ts(2, &f)).transpose()?,
        mode: enum_from_sql(3, &row.get::<_, String>(3)?)?,
        dry_run: row.get(4)?,
        status: enum_from_sql(5, &row.get::<_, String>(5)?)?,
        stats: serde_json::from_str(&stats).map_err(|e| conversion_error(6, e))?,
        errors: serde_json::from_str(&errors).map_err(|e| conversion_error(7, e))?,
    })
}
