use std::collections::BTreeMap;

use chrono::NaiveDate;
use cs_core::config::MappingConfig;
use cs_core::types::{
    Channel, EntityKind, GuestPatch, Price, PropertyPatch, ReservationPatch, ReservationStatus,
};
use serde_json::Value;
use thiserror::Error;

use crate::raw::RawRecord;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// A remote status with no entry in the table. Surfaced, never guessed.
    #[error("unmapped remote status '{0}'")]
    UnmappedStatus(String),

    #[error("{kind} record is missing {field}")]
    MissingField {
        kind: EntityKind,
        field: &'static str,
    },

    #[error("invalid date in {field}: '{value}'")]
    InvalidDate { field: &'static str, value: String },

    #[error("check-out {check_out} is not after check-in {check_in}")]
    InvalidRange {
        check_in: NaiveDate,
        check_out: NaiveDate,
    },

    /// Owner blocks and maintenance holds share the reservations feed.
    #[error("remote type '{0}' is a calendar block, not a reservation")]
    NotAReservation(String),

    #[error("status override '{remote}' -> {requested} conflicts with built-in {builtin}")]
    StatusOverrideConflict {
        remote: String,
        builtin: ReservationStatus,
        requested: ReservationStatus,
    },
}

// ---------------------------------------------------------------------------
// Status table
// ---------------------------------------------------------------------------

const BUILTIN_STATUSES: &[(&str, ReservationStatus)] = &[
    ("booked", ReservationStatus::Confirmed),
    ("contract", ReservationStatus::Confirmed),
    ("reserved", ReservationStatus::Pending),
    ("canceled", ReservationStatus::Cancelled),
    ("cancelled", ReservationStatus::Cancelled),
    ("no_show", ReservationStatus::NoShow),
    ("pending", ReservationStatus::Pending),
    ("confirmed", ReservationStatus::Confirmed),
    ("checked_in", ReservationStatus::CheckedIn),
    ("checked_out", ReservationStatus::CheckedOut),
];

const BLOCK_TYPES: &[&str] = &["blocked", "maintenance", "unavailable", "owner_block"];

/// Finite remote-status → canonical-status lookup.
#[derive(Debug, Clone)]
pub struct StatusTable {
    entries: BTreeMap<String, ReservationStatus>,
}

impl StatusTable {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_STATUSES
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
        }
    }

    /// Built-in table extended with operator entries. Re-declaring a
    /// built-in key with the same target is allowed; a different target is
    /// a conflict.
    pub fn with_overrides(overrides: &[(String, ReservationStatus)]) -> Result<Self, MappingError> {
        let mut table = Self::builtin();
        for (remote, status) in overrides {
            let key = remote.trim().to_lowercase();
            if let Some(&builtin) = table.entries.get(&key) {
                if builtin != *status {
                    return Err(MappingError::StatusOverrideConflict {
                        remote: key,
                        builtin,
                        requested: *status,
                    });
                }
            }
            table.entries.insert(key, *status);
        }
        Ok(table)
    }

    pub fn lookup(&self, raw: &str) -> Result<ReservationStatus, MappingError> {
        let key = raw.trim().to_lowercase();
        if let Some(status) = self.entries.get(&key) {
            return Ok(*status);
        }
        if BLOCK_TYPES.contains(&key.as_str()) {
            return Err(MappingError::NotAReservation(key));
        }
        Err(MappingError::UnmappedStatus(raw.trim().to_string()))
    }

    pub fn known_values(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Field candidates
// ---------------------------------------------------------------------------

const RESERVATION_ID: &[&str] = &["_id", "id", "reservationId"];
const LISTING_ID: &[&str] = &["_id", "id", "listingId"];
const CLIENT_ID: &[&str] = &["_id", "id", "clientId"];
const LISTING_REF: &[&str] = &["_idlisting", "listingId", "propertyId"];
const CLIENT_REF: &[&str] = &["_idclient", "clientId"];
const CHECK_IN: &[&str] = &["checkInDate", "checkIn", "check_in"];
const CHECK_OUT: &[&str] = &["checkOutDate", "checkOut", "check_out"];
const CREATED: &[&str] = &["creationDate", "createdAt", "_createdAt"];
const STATUS: &[&str] = &["type", "status"];
const TOTAL: &[&str] = &["price._f_total", "_f_total"];
const CURRENCY: &[&str] = &["price.currency", "currency"];
const PARTNER: &[&str] = &["partner.name", "partnerCode", "source", "platform", "ota", "channel"];
const PROPERTY_NAME: &[&str] = &["internalName", "_mstitle.pt_BR", "_mstitle.en_US", "name"];

fn ids_for(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Property => LISTING_ID,
        EntityKind::Guest => CLIENT_ID,
        EntityKind::Reservation => RESERVATION_ID,
    }
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MappedEntity {
    Property(PropertyPatch),
    Guest(GuestPatch),
    Reservation(ReservationPatch),
}

impl MappedEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            MappedEntity::Property(_) => EntityKind::Property,
            MappedEntity::Guest(_) => EntityKind::Guest,
            MappedEntity::Reservation(_) => EntityKind::Reservation,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            MappedEntity::Property(p) => &p.external_id,
            MappedEntity::Guest(g) => &g.external_id,
            MappedEntity::Reservation(r) => &r.external_id,
        }
    }
}

/// Converts raw channel records into canonical patches. Only fields the
/// record actually carries end up `Some`, and the raw record always rides
/// along as `raw_payload`.
#[derive(Debug, Clone, Default)]
pub struct Mapper {
    statuses: StatusTable,
}

impl Mapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &MappingConfig) -> Result<Self, MappingError> {
        Ok(Self {
            statuses: StatusTable::with_overrides(&cfg.overrides())?,
        })
    }

    pub fn statuses(&self) -> &StatusTable {
        &self.statuses
    }

    pub fn external_id(raw: &Value, kind: EntityKind) -> Option<String> {
        RawRecord(raw).first_str(ids_for(kind))
    }

    pub fn map(&self, raw: &Value, kind: EntityKind) -> Result<MappedEntity, MappingError> {
        Ok(match kind {
            EntityKind::Property => MappedEntity::Property(self.map_property(raw)?),
            EntityKind::Guest => MappedEntity::Guest(self.map_guest(raw)?),
            EntityKind::Reservation => MappedEntity::Reservation(self.map_reservation(raw)?),
        })
    }

    /// Map the remote status of `raw`, if it has one.
    pub fn status_of(&self, raw: &Value) -> Result<Option<ReservationStatus>, MappingError> {
        RawRecord(raw)
            .first_str(STATUS)
            .map(|s| self.statuses.lookup(&s))
            .transpose()
    }

    pub fn map_reservation(&self, raw: &Value) -> Result<ReservationPatch, MappingError> {
        let rec = RawRecord(raw);
        let external_id = rec.first_str(RESERVATION_ID).ok_or(MappingError::MissingField {
            kind: EntityKind::Reservation,
            field: "_id",
        })?;

        let status = self.status_of(raw)?;
        let check_in = date_field(&rec, CHECK_IN, "checkInDate")?;
        let check_out = date_field(&rec, CHECK_OUT, "checkOutDate")?;
        if let (Some(ci), Some(co)) = (check_in, check_out) {
            if co <= ci {
                return Err(MappingError::InvalidRange {
                    check_in: ci,
                    check_out: co,
                });
            }
        }

        let price = rec.first_f64(TOTAL).map(|total| Price {
            amount_minor: (total * 100.0).round() as i64,
            currency: rec.first_str(CURRENCY).unwrap_or_else(|| "BRL".into()),
        });

        Ok(ReservationPatch {
            external_id,
            property_external_id: rec.first_str(LISTING_REF),
            guest_external_id: rec.first_str(CLIENT_REF),
            check_in,
            check_out,
            status,
            channel: rec.has_any(PARTNER).then(|| classify_channel(raw)),
            price,
            booked_on: date_field(&rec, CREATED, "creationDate").ok().flatten(),
            raw_payload: Some(raw.clone()),
        })
    }

    pub fn map_guest(&self, raw: &Value) -> Result<GuestPatch, MappingError> {
        let rec = RawRecord(raw);
        let external_id = rec.first_str(CLIENT_ID).ok_or(MappingError::MissingField {
            kind: EntityKind::Guest,
            field: "_id",
        })?;
        let name = rec.first_str(&["name"]).or_else(|| {
            let parts: Vec<String> = [rec.first_str(&["fName"]), rec.first_str(&["lName"])]
                .into_iter()
                .flatten()
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });
        Ok(GuestPatch {
            external_id,
            name,
            email: rec.first_str(&["email", "emails.0.adr"]),
            phone: rec.first_str(&["phone", "phones.0.iso"]),
            raw_payload: Some(raw.clone()),
        })
    }

    pub fn map_property(&self, raw: &Value) -> Result<PropertyPatch, MappingError> {
        let rec = RawRecord(raw);
        let external_id = rec.first_str(LISTING_ID).ok_or(MappingError::MissingField {
            kind: EntityKind::Property,
            field: "_id",
        })?;
        let amenities = rec.path("amenities").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|a| match a {
                    Value::String(s) => Some(s.clone()),
                    obj @ Value::Object(_) => RawRecord(obj).first_str(&["_id", "id", "name"]),
                    _ => None,
                })
                .collect()
        });
        Ok(PropertyPatch {
            external_id,
            name: rec.first_str(PROPERTY_NAME),
            address: rec.path("address").filter(|a| a.is_object()).cloned(),
            amenities,
            raw_payload: Some(raw.clone()),
        })
    }
}

fn date_field(
    rec: &RawRecord<'_>,
    candidates: &[&str],
    field: &'static str,
) -> Result<Option<NaiveDate>, MappingError> {
    let Some(value) = rec.first_str(candidates) else {
        return Ok(None);
    };
    value
        .get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .map(Some)
        .ok_or(MappingError::InvalidDate { field, value })
}

// ---------------------------------------------------------------------------
// Channel attribution
// ---------------------------------------------------------------------------

const CHANNEL_NEEDLES: &[(&str, Channel)] = &[
    ("airbnb", Channel::Airbnb),
    ("booking", Channel::BookingCom),
    ("decolar", Channel::Decolar),
    ("expedia", Channel::Expedia),
    ("direct", Channel::Direct),
    ("website", Channel::Direct),
    ("site", Channel::Direct),
];

/// Attribute a reservation to a sales channel from its partner fields.
/// No partner information means a direct booking; anything unrecognised is
/// `Other`.
pub fn classify_channel(raw: &Value) -> Channel {
    let rec = RawRecord(raw);
    let haystack = PARTNER
        .iter()
        .filter_map(|p| rec.first_str(&[*p]))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if haystack.trim().is_empty() {
        return Channel::Direct;
    }
    CHANNEL_NEEDLES
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, c)| *c)
        .unwrap_or(Channel::Other)
}
