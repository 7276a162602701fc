// Entity snapshot types as reported by the controller
// Attribute bags are a closed variant instead of free-form JSON

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value sentinel for an entity whose integration cannot reach it
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Value sentinel for an entity whose value is not known
pub const STATE_UNKNOWN: &str = "unknown";

/// Attribute value reported alongside an entity state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

pub type Attributes = BTreeMap<String, AttributeValue>;

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => {
                AttributeValue::Number(n.as_f64().unwrap_or_default())
            }
            serde_json::Value::String(s) => AttributeValue::Text(s),
            serde_json::Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            serde_json::Value::Object(map) => AttributeValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, AttributeValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Last known state of one entity on one controller instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,

    /// Scalar value as reported, e.g. "on", "21.5", "unavailable"
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Attributes::new(),
            last_updated,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Identifier prefix before the first '.', e.g. "sensor"
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }

    pub fn friendly_name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(AttributeValue::as_str)
            .unwrap_or(&self.entity_id)
    }
}

/// Domain part of an entity id; the whole id when there is no separator
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map(|(domain, _)| domain)
        .unwrap_or(entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_controller_state_object() {
        let raw = serde_json::json!({
            "entity_id": "sensor.outdoor_temp",
            "state": "21.5",
            "attributes": {
                "unit_of_measurement": "°C",
                "friendly_name": "Outdoor",
                "precision": 1,
                "options": ["a", "b"],
                "extra": null
            },
            "last_changed": "2024-05-01T10:00:00.000000+00:00",
            "last_updated": "2024-05-01T10:00:00.000000+00:00",
            "context": {"id": "abc"}
        });

        let state: EntityState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.domain(), "sensor");
        assert_eq!(state.friendly_name(), "Outdoor");
        assert_eq!(state.attributes["precision"], AttributeValue::Number(1.0));
        assert_eq!(state.attributes["extra"], AttributeValue::Null);
        assert!(matches!(state.attributes["options"], AttributeValue::List(ref l) if l.len() == 2));
    }

    #[test]
    fn test_domain_without_separator() {
        assert_eq!(entity_domain("orphan"), "orphan");
        assert_eq!(entity_domain("light.kitchen.ceiling"), "light");
    }

    #[test]
    fn test_attribute_from_json() {
        let value = AttributeValue::from(serde_json::json!({"nested": {"on": true}}));
        match value {
            AttributeValue::Map(map) => match &map["nested"] {
                AttributeValue::Map(inner) => assert_eq!(inner["on"].as_bool(), Some(true)),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
