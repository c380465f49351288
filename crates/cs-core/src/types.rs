use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ReservationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 6] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::CheckedIn,
        ReservationStatus::CheckedOut,
        ReservationStatus::Cancelled,
        ReservationStatus::NoShow,
    ];

    /// Statuses that hold the property's calendar for the stay.
    pub fn is_occupying(self) -> bool {
        matches!(
            self,
            ReservationStatus::Confirmed
                | ReservationStatus::CheckedIn
                | ReservationStatus::CheckedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::NoShow => "no_show",
        }
    }

    /// Parse one of the canonical status names. Remote vocabularies go
    /// through the channel mapper's table instead.
    pub fn from_canonical(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Sales channel a reservation was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Airbnb,
    BookingCom,
    Decolar,
    Expedia,
    Direct,
    Other,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Airbnb => "airbnb",
            Channel::BookingCom => "booking_com",
            Channel::Decolar => "decolar",
            Channel::Expedia => "expedia",
            Channel::Direct => "direct",
            Channel::Other => "other",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Small enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// A direct lookup confirmed the reservation no longer exists upstream.
    VerifiedAbsent,
    /// The source reported the reservation as cancelled.
    RemoteCancelled,
}

impl CancellationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancellationReason::VerifiedAbsent => "verified_absent",
            CancellationReason::RemoteCancelled => "remote_cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Property,
    Guest,
    Reservation,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Property => "property",
            EntityKind::Guest => "guest",
            EntityKind::Reservation => "reservation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DateRange
// ---------------------------------------------------------------------------

/// Half-open day range `[start, end)`. The end day is not included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` unless `start < end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Monetary amount in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_minor: i64,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Canonical entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub internal_id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub address: Option<serde_json::Value>,
    pub amenities: Vec<String>,
    pub raw_origin_payload: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ContactInfo {
    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().and_then(normalize_email)
    }

    pub fn normalized_phone(&self) -> Option<String> {
        self.phone.as_deref().and_then(normalize_phone)
    }
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let e = raw.trim().to_lowercase();
    (!e.is_empty() && e.contains('@')).then_some(e)
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() >= 6).then_some(digits)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalGuest {
    pub internal_id: Uuid,
    pub external_id: Option<String>,
    pub name: Option<String>,
    pub contact: ContactInfo,
    pub raw_origin_payload: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReservation {
    pub internal_id: Uuid,
    pub external_id: String,
    pub property_ref: Uuid,
    pub property_external_id: String,
    pub guest_ref: Option<Uuid>,
    pub guest_external_id: Option<String>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub status: ReservationStatus,
    pub channel: Channel,
    pub price: Option<Price>,
    pub raw_origin_payload: serde_json::Value,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<CancellationReason>,
    /// When the booking was made on the channel, if the channel said so.
    pub booked_on: Option<NaiveDate>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalReservation {
    pub fn stay(&self) -> DateRange {
        DateRange {
            start: self.check_in,
            end: self.check_out,
        }
    }
}

// ---------------------------------------------------------------------------
// Patch types
// ---------------------------------------------------------------------------
//
// A patch carries only the fields the source actually sent. `None` means
// "not present" and never clears a stored value.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyPatch {
    pub external_id: String,
    pub name: Option<String>,
    pub address: Option<serde_json::Value>,
    pub amenities: Option<Vec<String>>,
    pub raw_payload: Option<serde_json::Value>,
}

impl PropertyPatch {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Self::default()
        }
    }

    /// Apply present fields onto `target`. Returns `true` if anything changed.
    pub fn merge_into(&self, target: &mut CanonicalProperty) -> bool {
        let mut changed = false;
        changed |= merge_opt(&mut target.name, &self.name);
        changed |= merge_opt(&mut target.address, &self.address);
        changed |= merge_value(&mut target.amenities, &self.amenities);
        if let Some(raw) = &self.raw_payload {
            changed |= merge_raw(&mut target.raw_origin_payload, raw);
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestPatch {
    pub external_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
}

impl GuestPatch {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Self::default()
        }
    }

    pub fn merge_into(&self, target: &mut CanonicalGuest) -> bool {
        let mut changed = false;
        if target.external_id.is_none() {
            target.external_id = Some(self.external_id.clone());
            changed = true;
        }
        changed |= merge_opt(&mut target.name, &self.name);
        changed |= merge_opt(&mut target.contact.email, &self.email);
        changed |= merge_opt(&mut target.contact.phone, &self.phone);
        if let Some(raw) = &self.raw_payload {
            changed |= merge_raw(&mut target.raw_origin_payload, raw);
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservationPatch {
    pub external_id: String,
    pub property_external_id: Option<String>,
    pub guest_external_id: Option<String>,
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
    pub channel: Option<Channel>,
    pub price: Option<Price>,
    pub booked_on: Option<NaiveDate>,
    pub raw_payload: Option<serde_json::Value>,
}

impl ReservationPatch {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Self::default()
        }
    }

    /// A patch that only moves the status.
    pub fn status_only(external_id: impl Into<String>, status: ReservationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::new(external_id)
        }
    }

    /// Apply present fields onto `target`. Status is merged like any other
    /// field; the store decides whether the transition is allowed.
    pub fn merge_into(&self, target: &mut CanonicalReservation) -> bool {
        let mut changed = false;
        changed |= merge_value(&mut target.property_external_id, &self.property_external_id);
        if self.guest_external_id.is_some() {
            changed |= merge_opt(&mut target.guest_external_id, &self.guest_external_id);
        }
        changed |= merge_value(&mut target.check_in, &self.check_in);
        changed |= merge_value(&mut target.check_out, &self.check_out);
        changed |= merge_value(&mut target.status, &self.status);
        changed |= merge_value(&mut target.channel, &self.channel);
        changed |= merge_opt(&mut target.price, &self.price);
        changed |= merge_opt(&mut target.booked_on, &self.booked_on);
        if let Some(raw) = &self.raw_payload {
            changed |= merge_raw(&mut target.raw_origin_payload, raw);
        }
        changed
    }
}

fn merge_value<T: PartialEq + Clone>(slot: &mut T, incoming: &Option<T>) -> bool {
    match incoming {
        Some(v) if slot != v => {
            *slot = v.clone();
            true
        }
        _ => false,
    }
}

fn merge_opt<T: PartialEq + Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(v) if slot.as_ref() != Some(v) => {
            *slot = Some(v.clone());
            true
        }
        _ => false,
    }
}

/// Deep-merge `patch` into `target`. Objects merge key by key, `null` in the
/// patch never replaces an existing value, anything else replaces.
pub fn merge_raw(target: &mut serde_json::Value, patch: &serde_json::Value) -> bool {
    match (target, patch) {
        (_, serde_json::Value::Null) => false,
        (serde_json::Value::Object(t), serde_json::Value::Object(p)) => {
            let mut changed = false;
            for (key, value) in p {
                match t.get_mut(key) {
                    Some(existing) => changed |= merge_raw(existing, value),
                    None if !value.is_null() => {
                        t.insert(key.clone(), value.clone());
                        changed = true;
                    }
                    None => {}
                }
            }
            changed
        }
        (t, p) => {
            if t != p {
                *t = p.clone();
                true
            } else {
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChangeLogEntry {
    pub idempotency_key: String,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub field_or_payload: serde_json::Value,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transition permit
// ---------------------------------------------------------------------------

/// Authorisation for a status change that cancels a reservation or releases
/// its calendar block. Issued only by the reconciliation safety guard after
/// it has seen strong evidence; the store refuses such transitions without
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPermit {
    external_id: String,
    to: ReservationStatus,
    reason: Option<CancellationReason>,
}

impl TransitionPermit {
    pub fn issue(
        external_id: impl Into<String>,
        to: ReservationStatus,
        reason: Option<CancellationReason>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            to,
            reason,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn to(&self) -> ReservationStatus {
        self.to
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        self.reason
    }

    pub fn covers(&self, external_id: &str, to: ReservationStatus) -> bool {
        self.external_id == external_id && self.to == to
    }
}

// ---------------------------------------------------------------------------
// Reconciliation runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationStats {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// Remote records that are owner blocks rather than reservations.
    pub ignored: u64,
    pub cancelled: u64,
    pub skipped_as_unverified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub guests: EntityStats,
    pub properties: EntityStats,
    pub reservations: ReservationStats,
}

impl RunStats {
    pub fn total_failed(&self) -> u64 {
        self.guests.failed + self.properties.failed + self.reservations.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mode: RunMode,
    pub dry_run: bool,
    pub status: RunStatus,
    pub stats: RunStats,
    pub errors: Vec<String>,
}

impl ReconciliationRun {
    pub fn start(mode: RunMode, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            mode,
            dry_run,
            status: RunStatus::Running,
            stats: RunStats::default(),
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Processed,
    Failed,
    Ignored,
    Rejected,
}

/// A webhook delivery exactly as received, plus its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub dedup_key: String,
    pub source_event_id: Option<String>,
    pub action: Option<String>,
    pub entity_kind: Option<EntityKind>,
    pub external_id: Option<String>,
    pub raw_body: String,
    pub status: WebhookEventStatus,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
