//! Typed views of upstream catalog records.
//!
//! Upstream payloads are loosely typed: identifiers may be numbers or
//! strings, labels may be plain strings or per-language maps. Records are
//! decoded leniently here and everything not modelled is kept in `extra`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reasons a payload is rejected at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRecord {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no uid")]
    MissingUid,
}

/// Start and end of one occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub department: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One event of an agenda.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRecord {
    pub uid: String,
    pub agenda_uid: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub conditions: Option<String>,
    pub date_range: Option<String>,
    pub first_timing: Option<Timing>,
    pub last_timing: Option<Timing>,
    pub location: Option<Location>,
    pub keywords: Vec<String>,
    pub status: Option<String>,
    pub attendance_mode: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Upstream fields with no typed counterpart, kept as received.
    pub extra: Map<String, Value>,
}

const EVENT_FIELDS: &[&str] = &[
    "uid",
    "agendaUid",
    "title",
    "description",
    "longDescription",
    "conditions",
    "dateRange",
    "firstTiming",
    "lastTiming",
    "location",
    "keywords",
    "status",
    "attendanceMode",
    "createdAt",
    "updatedAt",
];

impl EventRecord {
    /// Decode an upstream payload. `agenda_uid` overrides any value in the
    /// payload; pass `None` when decoding a stored document.
    pub fn from_value(value: &Value, agenda_uid: Option<&str>) -> Result<Self, InvalidRecord> {
        let object = value.as_object().ok_or(InvalidRecord::NotAnObject)?;
        let uid = object
            .get("uid")
            .and_then(identifier)
            .ok_or(InvalidRecord::MissingUid)?;

        let agenda_uid = match agenda_uid {
            Some(agenda_uid) => agenda_uid.to_string(),
            None => object
                .get("agendaUid")
                .and_then(identifier)
                .unwrap_or_default(),
        };

        let extra = object
            .iter()
            .filter(|(key, _)| !EVENT_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            uid,
            agenda_uid,
            title: object.get("title").and_then(text),
            description: object.get("description").and_then(text),
            long_description: object.get("longDescription").and_then(text),
            conditions: object.get("conditions").and_then(text),
            date_range: object.get("dateRange").and_then(text),
            first_timing: object.get("firstTiming").and_then(timing),
            last_timing: object.get("lastTiming").and_then(timing),
            location: object.get("location").and_then(location),
            keywords: object.get("keywords").map(keywords).unwrap_or_default(),
            status: object.get("status").and_then(label),
            attendance_mode: object.get("attendanceMode").and_then(label),
            created_at: object.get("createdAt").and_then(timestamp),
            updated_at: object.get("updatedAt").and_then(timestamp),
            extra,
        })
    }

    /// Serialize back into a stored document body.
    pub fn to_value(&self) -> Value {
        let mut object = self.extra.clone();
        object.insert("uid".into(), Value::String(self.uid.clone()));
        object.insert("agendaUid".into(), Value::String(self.agenda_uid.clone()));
        insert_opt(&mut object, "title", self.title.clone());
        insert_opt(&mut object, "description", self.description.clone());
        insert_opt(&mut object, "longDescription", self.long_description.clone());
        insert_opt(&mut object, "conditions", self.conditions.clone());
        insert_opt(&mut object, "dateRange", self.date_range.clone());
        if let Some(timing) = &self.first_timing {
            object.insert("firstTiming".into(), timing_value(timing));
        }
        if let Some(timing) = &self.last_timing {
            object.insert("lastTiming".into(), timing_value(timing));
        }
        if let Some(location) = &self.location {
            object.insert(
                "location".into(),
                serde_json::to_value(location).unwrap_or(Value::Null),
            );
        }
        if !self.keywords.is_empty() {
            object.insert(
                "keywords".into(),
                Value::Array(self.keywords.iter().cloned().map(Value::String).collect()),
            );
        }
        insert_opt(&mut object, "status", self.status.clone());
        insert_opt(&mut object, "attendanceMode", self.attendance_mode.clone());
        insert_opt(&mut object, "createdAt", self.created_at.map(format_timestamp));
        insert_opt(&mut object, "updatedAt", self.updated_at.map(format_timestamp));
        Value::Object(object)
    }

    /// True when either timestamp is at or after `watermark`.
    pub fn changed_since(&self, watermark: DateTime<Utc>) -> bool {
        self.created_at.is_some_and(|t| t >= watermark)
            || self.updated_at.is_some_and(|t| t >= watermark)
    }
}

/// One agenda (event source) of the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgendaRecord {
    pub uid: String,
    pub title: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
}

impl AgendaRecord {
    pub fn from_value(value: &Value) -> Result<Self, InvalidRecord> {
        let object = value.as_object().ok_or(InvalidRecord::NotAnObject)?;
        let uid = object
            .get("uid")
            .and_then(identifier)
            .ok_or(InvalidRecord::MissingUid)?;
        let extra = object
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "uid" | "title" | "updatedAt"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            uid,
            title: object.get("title").and_then(text),
            updated_at: object.get("updatedAt").and_then(timestamp),
            extra,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.extra.clone();
        object.insert("uid".into(), Value::String(self.uid.clone()));
        insert_opt(&mut object, "title", self.title.clone());
        insert_opt(&mut object, "updatedAt", self.updated_at.map(format_timestamp));
        Value::Object(object)
    }
}

/// Canonical timestamp text. Fixed width, so stored values order
/// lexicographically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp; anything else is treated as missing.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn insert_opt(object: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        object.insert(key.into(), Value::String(value));
    }
}

fn timing_value(timing: &Timing) -> Value {
    serde_json::json!({
        "begin": timing.begin.map(format_timestamp),
        "end": timing.end.map(format_timestamp),
    })
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Plain text, or the French (else first) entry of a per-language map.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("fr")
            .and_then(Value::as_str)
            .or_else(|| map.values().find_map(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Status and attendance codes arrive as numbers, strings, or
/// `{id, label}` objects when labels are requested.
fn label(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) if map.contains_key("label") => map.get("label").and_then(text),
        other => text(other),
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

fn timing(value: &Value) -> Option<Timing> {
    let object = value.as_object()?;
    Some(Timing {
        begin: object.get("begin").and_then(timestamp),
        end: object.get("end").and_then(timestamp),
    })
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn location(value: &Value) -> Option<Location> {
    let object = value.as_object()?;
    Some(Location {
        name: object.get("name").and_then(text),
        address: object.get("address").and_then(text),
        city: object.get("city").and_then(text),
        department: object.get("department").and_then(text),
        region: object.get("region").and_then(text),
        postal_code: object.get("postalCode").and_then(label),
        latitude: object.get("latitude").and_then(coordinate),
        longitude: object.get("longitude").and_then(coordinate),
    })
}

fn keywords(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        // Per-language map of keyword lists.
        Value::Object(map) => map
            .get("fr")
            .or_else(|| map.values().next())
            .map(keywords)
            .unwrap_or_default(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{AgendaRecord, EventRecord, InvalidRecord};
    use serde_json::json;

    #[test]
    fn decodes_loosely_typed_event() {
        let payload = json!({
            "uid": 4242,
            "title": {"fr": "Concert", "en": "Gig"},
            "longDescription": "Un long texte",
            "status": 1,
            "keywords": {"fr": ["jazz", "plein air"]},
            "location": {"city": "Toulouse", "postalCode": 31000, "latitude": "43.6"},
            "updatedAt": "2024-05-01T10:00:00+02:00",
            "createdAt": "not a date",
            "image": {"base": "https://img"}
        });

        let event = EventRecord::from_value(&payload, Some("77")).expect("decode");
        assert_eq!(event.uid, "4242");
        assert_eq!(event.agenda_uid, "77");
        assert_eq!(event.title.as_deref(), Some("Concert"));
        assert_eq!(event.status.as_deref(), Some("1"));
        assert_eq!(event.keywords, vec!["jazz", "plein air"]);
        let location = event.location.as_ref().expect("location");
        assert_eq!(location.postal_code.as_deref(), Some("31000"));
        assert_eq!(location.latitude, Some(43.6));
        assert!(event.created_at.is_none());
        assert_eq!(
            event.updated_at.map(|t| t.to_rfc3339()),
            Some("2024-05-01T08:00:00+00:00".to_string())
        );
        assert!(event.extra.contains_key("image"));
    }

    #[test]
    fn stored_body_round_trips() {
        let payload = json!({"uid": "a", "title": "T", "updatedAt": "2024-01-01T00:00:00Z", "x": [1]});
        let event = EventRecord::from_value(&payload, Some("ag")).expect("decode");
        let stored = event.to_value();
        let decoded = EventRecord::from_value(&stored, None).expect("decode stored");
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_invalid_payloads() {
        assert_eq!(
            EventRecord::from_value(&json!([1, 2]), None),
            Err(InvalidRecord::NotAnObject)
        );
        assert_eq!(
            EventRecord::from_value(&json!({"title": "no id"}), None),
            Err(InvalidRecord::MissingUid)
        );
        assert_eq!(
            AgendaRecord::from_value(&json!({"uid": ""})),
            Err(InvalidRecord::MissingUid)
        );
    }
}
