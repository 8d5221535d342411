//! Event types consumed by triggers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload carried by an event
pub type EventPayload = serde_json::Map<String, serde_json::Value>;

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    /// Get the event type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event that rules can react to
///
/// Events come from outside the engine (state providers, webhook receivers)
/// or from the scheduler when a time trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The type of event
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Component that produced the event
    #[serde(default)]
    pub source: String,

    /// Entity the event is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// The event data
    #[serde(default)]
    pub data: EventPayload,

    /// When the event was produced
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with current timestamp and empty payload
    pub fn new(event_type: impl Into<EventType>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            entity_id: None,
            data: EventPayload::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the entity the event refers to
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Replace the payload
    pub fn with_data(mut self, data: EventPayload) -> Self {
        self.data = data;
        self
    }

    /// Add a single payload field
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Set the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_builder() {
        let event = Event::new("state_changed", "hub")
            .with_entity_id("sensor.test")
            .with_field("new_state", json!("on"));

        assert_eq!(event.event_type, "state_changed");
        assert_eq!(event.entity_id.as_deref(), Some("sensor.test"));
        assert_eq!(event.data["new_state"], "on");
    }

    #[test]
    fn test_event_json_uses_type_key() {
        let event: Event = serde_json::from_value(json!({
            "type": "webhook",
            "data": {"webhook_id": "door"}
        }))
        .unwrap();

        assert_eq!(event.event_type.as_str(), "webhook");
        assert_eq!(event.source, "");
        assert!(event.entity_id.is_none());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "webhook");
        assert!(value.get("entity_id").is_none());
    }
}
