use cs_core::types::EntityKind;
use serde_json::Value;

use crate::mapper::Mapper;
use crate::raw::RawRecord;

/// Keys under which a webhook body carries the changed record.
const RECORD_KEYS: &[&str] = &["payload", "data", "reservation", "booking"];

const CANCELLATION_ACTIONS: &[&str] = &[
    "reservation.canceled",
    "reservation.cancelled",
    "reservation.deleted",
];

/// The parts of a webhook body the ingress and workers care about.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub action: Option<String>,
    pub kind: Option<EntityKind>,
    pub record: Option<Value>,
    pub external_id: Option<String>,
    pub source_event_id: Option<String>,
}

impl WebhookEnvelope {
    /// Parse `{action, payload, _dt}` style bodies. Never fails; missing
    /// pieces stay `None` and the caller decides whether that is fatal.
    pub fn parse(body: &Value) -> Self {
        let rec = RawRecord(body);
        let action = rec.first_str(&["action", "event"]).map(|a| a.to_lowercase());
        let record = RECORD_KEYS
            .iter()
            .find_map(|k| body.get(*k).filter(|v| v.is_object()))
            .cloned();
        let kind = action.as_deref().and_then(kind_from_action);
        let external_id = match (&record, kind) {
            (Some(r), Some(k)) => Mapper::external_id(r, k),
            (Some(r), None) => RawRecord(r).first_str(&["_id", "id"]),
            _ => None,
        };
        Self {
            action,
            kind,
            record,
            external_id,
            source_event_id: rec.first_str(&["eventId", "event_id"]),
        }
    }

    /// Explicit remote cancellation: strong evidence on its own.
    pub fn is_cancellation(&self) -> bool {
        self.action
            .as_deref()
            .is_some_and(|a| CANCELLATION_ACTIONS.contains(&a))
    }
}

fn kind_from_action(action: &str) -> Option<EntityKind> {
    let prefix = action.split('.').next()?;
    match prefix {
        "reservation" | "reservations" | "booking" => Some(EntityKind::Reservation),
        "listing" | "listings" | "property" => Some(EntityKind::Property),
        "client" | "clients" | "guest" => Some(EntityKind::Guest),
        _ => None,
    }
}
