//! Event types for Event Sourcing
//!
//! This module defines the immutable records of the append-only log.
//! Events and snapshots share one collection per partition and are told
//! apart by the `kind` tag of [`StoredRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EntityKey;

/// An event as submitted by command handling, before the log stamps it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub type_name: String,
    /// Schema version of the payload; overwritten with the latest known version on append
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<String>,
    pub payload: Value,
}

fn default_version() -> u32 {
    1
}

impl NewEvent {
    /// Create a new event with an empty request id and no user
    pub fn new(type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            type_name: type_name.into(),
            version: 1,
            request_id: String::new(),
            current_user: None,
            payload,
        }
    }

    /// Set the request that produced this event
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the user that issued the command
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.current_user = Some(user.into());
        self
    }
}

/// An immutable event in the event log
///
/// Events are the source of truth. Within one partition they are totally
/// ordered by `created_at`, and `sequence` is their 1-based position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub type_name: String,
    pub entity_type_name: String,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    /// Schema version of `payload`
    pub version: u32,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<String>,
    pub payload: Value,
}

impl Event {
    /// Stamp a submitted event with its partition, position and timestamp
    pub fn from_new(
        key: &EntityKey,
        event: NewEvent,
        sequence: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            type_name: event.type_name,
            entity_type_name: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            version: event.version,
            sequence,
            created_at,
            request_id: event.request_id,
            current_user: event.current_user,
            payload: event.payload,
        }
    }

    /// Partition key of this event
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type_name, &self.entity_id)
    }

    /// Parse the payload as a specific type
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Materialized entity state at a position in its event stream
///
/// Snapshots only bound replay cost: deleting every snapshot must not change
/// any computed state. A newer snapshot supersedes an older one; neither is
/// ever edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entity_type_name: String,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    /// Schema version of `state`
    pub version: u32,
    /// Sequence of the last event incorporated
    pub sequence: u64,
    /// `created_at` of the last event incorporated; replay resumes after it
    pub created_at: DateTime<Utc>,
    pub snapshotted_at: DateTime<Utc>,
    /// `null` marks a deleted entity
    pub state: Value,
}

impl Snapshot {
    /// Partition key of this snapshot
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type_name, &self.entity_id)
    }
}

/// One line of a partition: either an event or a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Event(Event),
    Snapshot(Snapshot),
}

impl StoredRecord {
    /// Serialize record to JSON string (for JSONL)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize record from JSON string
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        let key = EntityKey::new("Post", "p-1");
        let new = NewEvent::new("PostCreated", json!({"title": "Hello"}))
            .with_request_id("req-9")
            .with_user("ana");
        Event::from_new(&key, new, 1, Utc::now())
    }

    #[test]
    fn test_event_serialization() {
        let event = sample_event();
        let line = StoredRecord::Event(event.clone()).to_json_line().unwrap();

        assert!(line.contains("\"kind\":\"event\""));
        assert!(line.contains("\"typeName\":\"PostCreated\""));
        assert!(line.contains("\"entityID\":\"p-1\""));
        assert!(line.contains("\"requestID\":\"req-9\""));

        match StoredRecord::from_json_line(&line).unwrap() {
            StoredRecord::Event(parsed) => assert_eq!(parsed, event),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_kind_tag() {
        let snapshot = Snapshot {
            entity_type_name: "Post".to_string(),
            entity_id: "p-1".to_string(),
            version: 2,
            sequence: 7,
            created_at: Utc::now(),
            snapshotted_at: Utc::now(),
            state: json!({"title": "Hello"}),
        };

        let line = StoredRecord::Snapshot(snapshot.clone())
            .to_json_line()
            .unwrap();
        assert!(line.contains("\"kind\":\"snapshot\""));

        let parsed = StoredRecord::from_json_line(&line).unwrap();
        assert_eq!(parsed, StoredRecord::Snapshot(snapshot));
    }

    #[test]
    fn test_parse_payload() {
        #[derive(Deserialize)]
        struct PostCreated {
            title: String,
        }

        let event = sample_event();
        let payload: PostCreated = event.parse_payload().unwrap();
        assert_eq!(payload.title, "Hello");
        assert_eq!(event.current_user.as_deref(), Some("ana"));
    }
}
