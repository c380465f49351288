use std::fmt;

use cs_core::types::EntityKind;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Listings,
    Clients,
    Reservations,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Listings, Resource::Clients, Resource::Reservations];

    pub fn path(self) -> &'static str {
        match self {
            Resource::Listings => "/content/listings",
            Resource::Clients => "/booking/clients",
            Resource::Reservations => "/booking/reservations",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Listings => "listings",
            Resource::Clients => "clients",
            Resource::Reservations => "reservations",
        }
    }

    pub fn entity_kind(self) -> EntityKind {
        match self {
            Resource::Listings => EntityKind::Property,
            Resource::Clients => EntityKind::Guest,
            Resource::Reservations => EntityKind::Reservation,
        }
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Property => Resource::Listings,
            EntityKind::Guest => Resource::Clients,
            EntityKind::Reservation => Resource::Reservations,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys under which list endpoints wrap their array.
const WRAPPER_KEYS: [&str; 5] = ["data", "reservations", "listings", "clients", "items"];

/// Pull the record array out of a list response, which is either a bare
/// array or an object wrapping one. `None` when neither shape matches.
pub fn extract_items(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => WRAPPER_KEYS.iter().find_map(|k| match map.remove(*k) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// Read-only view over a channel record whose field names vary between
/// endpoints and API versions.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a>(pub &'a Value);

impl<'a> RawRecord<'a> {
    /// Resolve a dotted path such as `price._f_total` or `phones.0.iso`.
    pub fn path(&self, path: &str) -> Option<&'a Value> {
        let mut cur = self.0;
        for seg in path.split('.') {
            cur = match cur {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!cur.is_null()).then_some(cur)
    }

    /// First candidate path holding a non-empty string (numbers are
    /// rendered as strings).
    pub fn first_str(&self, candidates: &[&str]) -> Option<String> {
        candidates.iter().find_map(|p| match self.path(p)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// First candidate path holding a number or numeric string.
    pub fn first_f64(&self, candidates: &[&str]) -> Option<f64> {
        candidates.iter().find_map(|p| match self.path(p)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    }

    pub fn has_any(&self, candidates: &[&str]) -> bool {
        candidates.iter().any(|p| self.path(p).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_from_bare_array_or_wrapper() {
        assert_eq!(extract_items(json!([{"_id": "a"}])).map(|v| v.len()), Some(1));
        assert_eq!(
            extract_items(json!({"data": [{"_id": "a"}, {"_id": "b"}]})).map(|v| v.len()),
            Some(2)
        );
        assert_eq!(
            extract_items(json!({"reservations": []})).map(|v| v.len()),
            Some(0)
        );
        assert!(extract_items(json!({"error": "nope"})).is_none());
        assert!(extract_items(json!("text")).is_none());
    }

    #[test]
    fn dotted_paths() {
        let v = json!({
            "price": {"_f_total": 1500.5, "currency": "BRL"},
            "phones": [{"iso": "+5511988887777"}],
            "empty": "  ",
            "nothing": null,
            "_id": 42
        });
        let r = RawRecord(&v);
        assert_eq!(r.first_f64(&["price._f_total"]), Some(1500.5));
        assert_eq!(r.first_str(&["phones.0.iso"]).as_deref(), Some("+5511988887777"));
        assert_eq!(r.first_str(&["empty", "price.currency"]).as_deref(), Some("BRL"));
        assert_eq!(r.first_str(&["_id"]).as_deref(), Some("42"));
        assert!(r.path("nothing").is_none());
        assert!(!r.has_any(&["nothing", "missing"]));
    }

    #[test]
    fn resource_paths() {
        assert_eq!(Resource::Reservations.path(), "/booking/reservations");
        assert_eq!(Resource::for_kind(EntityKind::Guest), Resource::Clients);
        for r in Resource::ALL {
            assert_eq!(Resource::for_kind(r.entity_kind()), r);
        }
    }
}
