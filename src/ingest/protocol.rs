// Websocket message types for the controller event stream

use crate::state::EntityState;
use serde::Deserialize;
use serde_json::{json, Value};

pub const EVENT_STATE_CHANGED: &str = "state_changed";
pub const EVENT_CALL_SERVICE: &str = "call_service";

/// Server to client message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    AuthRequired,
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<ResultError>,
    },
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: EventEnvelope,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ResultError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a state_changed event; a null new_state means the entity was removed
#[derive(Debug, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

#[derive(Debug, Deserialize)]
pub struct CallServiceData {
    pub domain: String,
    pub service: String,
}

impl CallServiceData {
    /// Service calls that may change which entities an integration owns
    pub fn is_reload(&self) -> bool {
        self.service == "reload"
            || self.service == "reload_config_entry"
            || (self.domain == "homeassistant" && self.service.starts_with("reload"))
    }
}

/// Parse one text frame; the server may coalesce several messages into an array
pub fn parse_frame(text: &str) -> Result<Vec<Inbound>, serde_json::Error> {
    if text.trim_start().starts_with('[') {
        serde_json::from_str(text)
    } else {
        serde_json::from_str(text).map(|message| vec![message])
    }
}

pub fn auth(access_token: &str) -> String {
    json!({ "type": "auth", "access_token": access_token }).to_string()
}

pub fn subscribe_events(id: u64, event_type: &str) -> String {
    json!({ "id": id, "type": "subscribe_events", "event_type": event_type }).to_string()
}

pub fn ping(id: u64) -> String {
    json!({ "id": id, "type": "ping" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_state_changed_event() {
        let raw = r#"{"id": 1, "type": "event", "event": {"event_type": "state_changed", "data": {
            "entity_id": "light.kitchen",
            "old_state": null,
            "new_state": {"entity_id": "light.kitchen", "state": "on", "attributes": {},
                          "last_updated": "2024-05-01T10:00:00+00:00"}
        }, "origin": "LOCAL"}}"#;

        let messages = parse_frame(raw).unwrap();
        let Inbound::Event { event, .. } = &messages[0] else {
            panic!("expected event");
        };
        let data: StateChangedData = serde_json::from_value(event.data.clone()).unwrap();
        assert_eq!(data.new_state.unwrap().state, "on");
    }

    #[test]
    fn test_removed_entity_has_null_new_state() {
        let data: StateChangedData =
            serde_json::from_value(json!({"entity_id": "light.old", "new_state": null})).unwrap();
        assert!(data.new_state.is_none());
    }

    #[test]
    fn test_coalesced_and_unknown_messages() {
        let raw = r#"[{"type": "auth_required", "ha_version": "2024.5.0"},
                      {"type": "something_new", "x": 1},
                      {"id": 2, "type": "result", "success": false, "error": {"code": "unknown_command", "message": "nope"}}]"#;
        let messages = parse_frame(raw).unwrap();
        assert!(matches!(messages[0], Inbound::AuthRequired));
        assert!(matches!(messages[1], Inbound::Other));
        assert!(matches!(messages[2], Inbound::Result { id: 2, success: false, .. }));
    }

    #[test]
    fn test_reload_detection() {
        let reload = |domain: &str, service: &str| CallServiceData {
            domain: domain.into(),
            service: service.into(),
        };
        assert!(reload("automation", "reload").is_reload());
        assert!(reload("homeassistant", "reload_all").is_reload());
        assert!(!reload("light", "turn_on").is_reload());
    }
}
