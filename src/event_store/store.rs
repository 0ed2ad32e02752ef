//! Event log contract and partition bookkeeping shared by the backends
//!
//! A partition holds every record of one `(entityType, entityID)`: events
//! and snapshots, ordered by `created_at`. Backends differ only in where the
//! records live; stamping, ordering and version checks happen here.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::types::{EntityKey, Event, NewEvent, Snapshot, StoredRecord};
use crate::utils::next_timestamp;

/// Append-only, partitioned event log
///
/// Implementations must never modify or delete a record once written.
pub trait EventLog: Send + Sync {
    /// Append events to one partition and return them as stored
    ///
    /// With `expected_version`, the append fails with
    /// [`Error::Concurrency`] unless the partition's stream version (the
    /// sequence of its last event) equals it. Without it the append is
    /// last-writer-wins.
    fn append(
        &self,
        key: &EntityKey,
        events: Vec<NewEvent>,
        expected_version: Option<u64>,
    ) -> Result<Vec<Event>>;

    /// Events with `created_at` strictly after `after` (all if `None`), ascending
    fn events_after(&self, key: &EntityKey, after: Option<DateTime<Utc>>) -> Result<Vec<Event>>;

    /// The snapshot incorporating the most events, if any
    fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<Snapshot>>;

    /// Persist a snapshot; it supersedes older ones without editing them
    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Sequence of the last event in the partition, `0` if empty
    fn stream_version(&self, key: &EntityKey) -> Result<u64>;

    /// Ids of one entity type in ascending order, strictly after `after`
    fn entity_ids(&self, entity_type: &str, after: Option<&str>, limit: usize)
        -> Result<Vec<String>>;
}

/// Position of the last event in a partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionTail {
    pub sequence: u64,
    pub created_at: Option<DateTime<Utc>>,
}

impl PartitionTail {
    /// Check the expected version and stamp `events` after this tail
    ///
    /// Returns the stamped events and the tail that results once they are
    /// written; `self` is left untouched so a failed write changes nothing.
    pub fn stamp(
        &self,
        key: &EntityKey,
        events: Vec<NewEvent>,
        expected_version: Option<u64>,
    ) -> Result<(Vec<Event>, PartitionTail)> {
        if let Some(expected) = expected_version {
            if expected != self.sequence {
                return Err(Error::Concurrency {
                    key: key.to_string(),
                    expected,
                    actual: self.sequence,
                });
            }
        }

        let mut next = *self;
        let stamped = events
            .into_iter()
            .map(|event| {
                next.sequence += 1;
                let created_at = next_timestamp(next.created_at);
                next.created_at = Some(created_at);
                Event::from_new(key, event, next.sequence, created_at)
            })
            .collect();

        Ok((stamped, next))
    }
}

/// All records of one partition, in write order
#[derive(Debug, Clone, Default)]
pub struct Partition {
    records: Vec<StoredRecord>,
}

impl Partition {
    pub fn new(records: Vec<StoredRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: StoredRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of the last event
    pub fn tail(&self) -> PartitionTail {
        self.events()
            .max_by_key(|e| e.sequence)
            .map(|e| PartitionTail {
                sequence: e.sequence,
                created_at: Some(e.created_at),
            })
            .unwrap_or_default()
    }

    fn events(&self) -> impl Iterator<Item = &Event> {
        self.records.iter().filter_map(|record| match record {
            StoredRecord::Event(event) => Some(event),
            StoredRecord::Snapshot(_) => None,
        })
    }

    /// Events after a cutoff, sorted by `created_at`
    pub fn events_after(&self, after: Option<DateTime<Utc>>) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events()
            .filter(|e| after.map_or(true, |cutoff| e.created_at > cutoff))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.sequence));
        events
    }

    /// Snapshot with the highest sequence; later writes win ties
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.records
            .iter()
            .filter_map(|record| match record {
                StoredRecord::Snapshot(snapshot) => Some(snapshot),
                StoredRecord::Event(_) => None,
            })
            .fold(None, |best: Option<&Snapshot>, candidate| match best {
                Some(current) if current.sequence > candidate.sequence => Some(current),
                _ => Some(candidate),
            })
            .cloned()
    }
}

/// Reject snapshots that claim events the partition does not have
pub fn check_snapshot(snapshot: &Snapshot, tail: &PartitionTail) -> Result<()> {
    if snapshot.sequence > tail.sequence {
        return Err(Error::Concurrency {
            key: snapshot.key().to_string(),
            expected: snapshot.sequence,
            actual: tail.sequence,
        });
    }
    Ok(())
}
