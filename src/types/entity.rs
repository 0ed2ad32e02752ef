//! Entity types for the materialized state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Partition key of the event log: one aggregate instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Current state of one entity, as produced by the reducer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub entity_type: String,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    /// Reduced state; `null` marks a deleted entity
    pub state: Value,
    /// Schema version of `state`
    pub schema_version: u32,
    /// Sequence of the last event folded into `state`
    pub stream_version: u64,
    pub last_event_at: DateTime<Utc>,
}

impl EntityState {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    /// Whether the last reducer marked this entity as deleted
    pub fn is_tombstone(&self) -> bool {
        self.state.is_null()
    }

    /// Parse the state as a specific type
    pub fn parse_state<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.state)
    }

    /// Look up a dotted field path inside the state
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.state, |value, segment| value.get(segment))
    }
}
