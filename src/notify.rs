//! Change feed
//!
//! Every reduction and read-model write the materializer performs is
//! broadcast to subscribers over a `tokio::sync::broadcast` channel, so
//! transport adapters can push updates without polling. Slow subscribers
//! lag and miss messages; `sequence_id` lets them detect the gap.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::projector::ReadModelChange;
use crate::types::EntityState;

/// What changed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeNotification {
    /// An entity was reduced to a new stream version
    EntityReduced {
        entity_type: String,
        entity_id: String,
        stream_version: u64,
        /// The entity is now a tombstone
        deleted: bool,
    },

    ReadModelUpdated {
        read_model_type: String,
        id: String,
        version: u64,
    },

    ReadModelDeleted { read_model_type: String, id: String },

    /// A data-migration job completed
    DataMigrationFinished { name: String },
}

impl ChangeNotification {
    pub fn entity_reduced(entity: &EntityState) -> Self {
        ChangeNotification::EntityReduced {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            stream_version: entity.stream_version,
            deleted: entity.is_tombstone(),
        }
    }
}

impl From<ReadModelChange> for ChangeNotification {
    fn from(change: ReadModelChange) -> Self {
        match change {
            ReadModelChange::Updated {
                read_model_type,
                id,
                version,
            } => ChangeNotification::ReadModelUpdated {
                read_model_type,
                id,
                version,
            },
            ReadModelChange::Deleted {
                read_model_type,
                id,
            } => ChangeNotification::ReadModelDeleted {
                read_model_type,
                id,
            },
        }
    }
}

/// Notification wrapper with metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    #[serde(flatten)]
    pub notification: ChangeNotification,

    /// Monotonically increasing sequence ID for gap detection
    pub sequence_id: u64,

    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Broadcast channel of change notifications
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeMessage>,
    sequence_counter: AtomicU64,
}

impl ChangeFeed {
    /// Create a feed buffering `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence_counter: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, notification: ChangeNotification) {
        let seq = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let msg = ChangeMessage {
            notification,
            sequence_id: seq,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        // No receivers is fine
        let _ = self.tx.send(msg);
    }

    /// Number of messages published so far
    pub fn current_sequence_id(&self) -> u64 {
        self.sequence_counter.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeMessage> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_increments_without_subscribers() {
        let feed = ChangeFeed::new(16);
        feed.publish(ChangeNotification::DataMigrationFinished {
            name: "backfill".to_string(),
        });
        assert_eq!(feed.current_sequence_id(), 1);
        assert_eq!(feed.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let feed = ChangeFeed::new(16);
        let mut rx = feed.subscribe();

        feed.publish(ReadModelChange::Updated {
            read_model_type: "CarView".to_string(),
            id: "c-1".to_string(),
            version: 1,
        }
        .into());
        feed.publish(ChangeNotification::ReadModelDeleted {
            read_model_type: "CarView".to_string(),
            id: "c-1".to_string(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence_id, 0);
        assert!(matches!(first.notification, ChangeNotification::ReadModelUpdated { version: 1, .. }));
        assert_eq!(second.sequence_id, 1);
    }

    #[test]
    fn test_message_serialization_is_flat() {
        let msg = ChangeMessage {
            notification: ChangeNotification::ReadModelDeleted {
                read_model_type: "CarView".to_string(),
                id: "c-1".to_string(),
            },
            sequence_id: 7,
            timestamp: 0,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "read_model_deleted");
        assert_eq!(json["id"], "c-1");
        assert_eq!(json["sequence_id"], 7);
    }
}
