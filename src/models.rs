use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::Result;

/// Subject or object of an event (user, host, service account).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Entity {
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One normalized activity record pulled off the event stream.
///
/// The schema is deliberately loose: producers across sources populate
/// different subsets, so every field decodes as optional and rule-specific
/// values ride in `attributes`. Rules treat a missing field as a non-match,
/// never as an error.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Event {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    /// Producer-assigned ISO-8601 timestamp. Window bookkeeping uses store
    /// time, not this value.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub actor: Option<Entity>,
    #[serde(default)]
    pub target: Option<Entity>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Event {
    /// Numeric attribute lookup tolerant of integer or float encodings.
    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        let value = self.attributes.get(name)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().and_then(|a| a.id.as_deref())
    }
}

/// Decode a raw message payload into an `Event`.
///
/// Fails only on undecodable bytes or invalid JSON; missing fields are fine.
pub fn decode_event(payload: &[u8]) -> Result<Event> {
    let text = std::str::from_utf8(payload)?;
    let event: Event = serde_json::from_str(text)?;
    Ok(event)
}

/// Output record generated by a rule at trigger time. Immutable once built;
/// published exactly once per generation, with `alert_id` as the idempotency
/// key against redelivery-induced duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub tenant_id: String,
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: u8,
    pub rule_name: String,
    pub rule_description: String,
    pub actor: Option<Entity>,
    pub target: Option<Entity>,
    pub details: serde_json::Map<String, Value>,
    /// Contributing event ids, capped at 10 by the generating rule.
    pub related_events: Vec<String>,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_tolerates_missing_fields() {
        let event = decode_event(br#"{"tenant_id": "tenant-a"}"#).unwrap();
        assert_eq!(event.tenant_id.as_deref(), Some("tenant-a"));
        assert!(event.event_id.is_none());
        assert!(event.actor.is_none());
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(decode_event(b"{not json").is_err());
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(decode_event(&[0xff, 0xfe, 0x7b]).is_err());
    }

    #[test]
    fn entity_type_field_renames() {
        let event = decode_event(
            br#"{"actor": {"type": "user", "id": "u1", "name": "Jo"}}"#,
        )
        .unwrap();
        let actor = event.actor.unwrap();
        assert_eq!(actor.entity_type.as_deref(), Some("user"));
        assert_eq!(actor.id.as_deref(), Some("u1"));
    }

    #[test]
    fn attr_u64_handles_int_and_float() {
        let mut event = Event::default();
        event.attributes.insert("a".into(), json!(3));
        event.attributes.insert("b".into(), json!(2.0));
        event.attributes.insert("c".into(), json!("nope"));
        assert_eq!(event.attr_u64("a"), Some(3));
        assert_eq!(event.attr_u64("b"), Some(2));
        assert_eq!(event.attr_u64("c"), None);
        assert_eq!(event.attr_u64("missing"), None);
    }
}
