//! In-memory event log
//!
//! Keeps every partition in a `BTreeMap` behind a `parking_lot::RwLock`.
//! Used by tests and by embedders that persist elsewhere.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::types::{EntityKey, Event, NewEvent, Snapshot, StoredRecord};

use super::store::{check_snapshot, EventLog, Partition};

/// Event log held entirely in memory
#[derive(Default)]
pub struct InMemoryEventLog {
    partitions: RwLock<BTreeMap<EntityKey, Partition>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every snapshot, keeping all events
    ///
    /// Replays after this must produce the same states, only slower.
    pub fn clear_snapshots(&self) {
        let mut partitions = self.partitions.write();
        for partition in partitions.values_mut() {
            let events = partition
                .events_after(None)
                .into_iter()
                .map(StoredRecord::Event)
                .collect();
            *partition = Partition::new(events);
        }
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        key: &EntityKey,
        events: Vec<NewEvent>,
        expected_version: Option<u64>,
    ) -> Result<Vec<Event>> {
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(key.clone()).or_default();

        let (stamped, _) = partition.tail().stamp(key, events, expected_version)?;
        for event in &stamped {
            partition.push(StoredRecord::Event(event.clone()));
        }

        debug!(%key, count = stamped.len(), "Appended events");
        Ok(stamped)
    }

    fn events_after(&self, key: &EntityKey, after: Option<DateTime<Utc>>) -> Result<Vec<Event>> {
        Ok(self
            .partitions
            .read()
            .get(key)
            .map(|p| p.events_after(after))
            .unwrap_or_default())
    }

    fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<Snapshot>> {
        Ok(self
            .partitions
            .read()
            .get(key)
            .and_then(Partition::latest_snapshot))
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let key = snapshot.key();
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(key).or_default();
        check_snapshot(snapshot, &partition.tail())?;
        partition.push(StoredRecord::Snapshot(snapshot.clone()));
        Ok(())
    }

    fn stream_version(&self, key: &EntityKey) -> Result<u64> {
        Ok(self
            .partitions
            .read()
            .get(key)
            .map(|p| p.tail().sequence)
            .unwrap_or(0))
    }

    fn entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .partitions
            .read()
            .iter()
            .filter(|(key, partition)| key.entity_type == entity_type && !partition.is_empty())
            .map(|(key, _)| &key.entity_id)
            .filter(|id| after.map_or(true, |cursor| id.as_str() > cursor))
            .take(limit)
            .cloned()
            .collect())
    }
}
