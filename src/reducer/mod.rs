//! Entity Reducer
//!
//! Materializes the current state of one entity:
//!
//! 1. Load the latest snapshot, if any, and migrate it unless it is a
//!    tombstone
//! 2. Load the events written after the snapshot's cutoff
//! 3. Migrate each event to the latest version of its type
//! 4. Fold them with the reducer registered for `(entityType, eventType)`
//! 5. Store a new snapshot once enough events were folded
//!
//! Snapshot writes are best effort; a failed write is logged and the
//! reduced state is still returned.

mod registry;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::MaterializerConfig;
use crate::error::{Error, Result};
use crate::event_store::EventLog;
use crate::migration::MigrationRegistry;
use crate::types::{EntityKey, EntityState, Event, Snapshot};
use crate::utils::now;

pub use registry::{ReducerFn, ReducerRegistry};

/// Folds events and snapshots into [`EntityState`]
pub struct EntityReducer {
    log: Arc<dyn EventLog>,
    reducers: Arc<ReducerRegistry>,
    migrations: Arc<MigrationRegistry>,
    snapshot_threshold: usize,
}

/// Running result of a fold
struct Fold {
    /// `None` until the first reducer ran or a snapshot was loaded
    state: Option<Value>,
    sequence: u64,
    last_event_at: Option<DateTime<Utc>>,
    /// Events that went through a reducer
    applied: usize,
}

impl Fold {
    fn empty() -> Self {
        Self {
            state: None,
            sequence: 0,
            last_event_at: None,
            applied: 0,
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: Some(snapshot.state),
            sequence: snapshot.sequence,
            last_event_at: Some(snapshot.created_at),
            applied: 0,
        }
    }
}

impl EntityReducer {
    pub fn new(
        log: Arc<dyn EventLog>,
        reducers: Arc<ReducerRegistry>,
        migrations: Arc<MigrationRegistry>,
        config: &MaterializerConfig,
    ) -> Self {
        Self {
            log,
            reducers,
            migrations,
            snapshot_threshold: config.snapshot_threshold,
        }
    }

    /// Current state of an entity from its latest snapshot plus newer events
    pub fn reduce(&self, key: &EntityKey) -> Result<EntityState> {
        let start = match self.log.latest_snapshot(key)? {
            // A tombstone has no payload to upgrade
            Some(snapshot) if snapshot.state.is_null() => Fold::from_snapshot(snapshot),
            Some(snapshot) => Fold::from_snapshot(self.migrations.migrate(snapshot)?),
            None => Fold::empty(),
        };
        let events = self.log.events_after(key, start.last_event_at)?;

        let fold = self.fold(key, start, events)?;
        let applied = fold.applied;
        let state = self.finish(key, fold)?;

        if applied > 0 && applied >= self.snapshot_threshold {
            if let Err(e) = self.write_snapshot(&state) {
                warn!(%key, error = %e, "Failed to store snapshot");
            }
        }
        Ok(state)
    }

    /// State replayed from every event, ignoring snapshots; writes nothing
    pub fn reduce_from_events(&self, key: &EntityKey) -> Result<EntityState> {
        let events = self.log.events_after(key, None)?;
        let fold = self.fold(key, Fold::empty(), events)?;
        self.finish(key, fold)
    }

    /// Replay from every event and store the result as a fresh snapshot
    pub fn rebuild_snapshot(&self, key: &EntityKey) -> Result<EntityState> {
        let state = self.reduce_from_events(key)?;
        self.write_snapshot(&state)?;
        Ok(state)
    }

    fn fold(&self, key: &EntityKey, mut fold: Fold, events: Vec<Event>) -> Result<Fold> {
        for event in events {
            let event = self.migrations.migrate(event)?;
            fold.sequence = event.sequence;
            fold.last_event_at = Some(event.created_at);

            let Some(reducer) = self.reducers.get(&key.entity_type, &event.type_name) else {
                debug!(%key, event_type = %event.type_name, "No reducer registered, skipping event");
                continue;
            };

            // A tombstone restarts the entity from nothing
            let prior = fold.state.take().filter(|state| !state.is_null());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| reducer(&event, prior)));
            let next = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(e)) => return Err(reduction_error(key, &event, e.to_string())),
                Err(panic) => return Err(reduction_error(key, &event, panic_message(panic))),
            };

            fold.state = Some(next);
            fold.applied += 1;
        }
        Ok(fold)
    }

    fn finish(&self, key: &EntityKey, fold: Fold) -> Result<EntityState> {
        match (fold.state, fold.last_event_at) {
            (Some(state), Some(last_event_at)) => Ok(EntityState {
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                state,
                schema_version: self.migrations.latest_version(&key.entity_type),
                stream_version: fold.sequence,
                last_event_at,
            }),
            _ => Err(Error::entity_not_found(&key.entity_type, &key.entity_id)),
        }
    }

    fn write_snapshot(&self, state: &EntityState) -> Result<()> {
        let snapshot = Snapshot {
            entity_type_name: state.entity_type.clone(),
            entity_id: state.entity_id.clone(),
            version: state.schema_version,
            sequence: state.stream_version,
            created_at: state.last_event_at,
            snapshotted_at: now(),
            state: state.state.clone(),
        };
        self.log.store_snapshot(&snapshot)?;
        debug!(key = %state.key(), sequence = snapshot.sequence, "Stored snapshot");
        Ok(())
    }
}

fn reduction_error(key: &EntityKey, event: &Event, reason: String) -> Error {
    Error::Reduction {
        key: key.to_string(),
        event_type: event.type_name.clone(),
        sequence: event.sequence,
        reason,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("reducer panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("reducer panicked: {}", message)
    } else {
        "reducer panicked".to_string()
    }
}
