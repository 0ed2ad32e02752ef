//! Read Model Projector
//!
//! Keeps read models in step with entity state. For every projection bound
//! to the changed entity's type, in registration order:
//!
//! 1. Resolve the affected record ids from the projection's [`JoinKey`]
//! 2. Fetch each record and run the projection function on it
//! 3. Merge the returned fields onto the record and store it with
//!    compare-and-set, re-reading and re-running on conflict
//!
//! Projection functions only overwrite the fields they return, so several
//! functions can share one record without clobbering each other.

mod file;
mod memory;
mod registry;
mod store;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::MaterializerConfig;
use crate::error::{Error, HandlerError, Result};
use crate::migration::MigrationRegistry;
use crate::types::{EntityState, Event, ReadModelRecord};

pub use file::FileReadModelStore;
pub use memory::InMemoryReadModelStore;
pub use registry::{
    EventHandler, EventHandlerFn, EventHandlerRegistry, JoinKey, JoinKeyFn, Projection,
    ProjectionBinding, ProjectionFn, ProjectionRegistry,
};
pub use store::{filter_records, paginate, ReadModelStore, SearchRequest};

/// What happened to one read-model record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "change")]
pub enum ReadModelChange {
    Updated {
        read_model_type: String,
        id: String,
        version: u64,
    },
    Deleted {
        read_model_type: String,
        id: String,
    },
}

impl ReadModelChange {
    pub fn read_model_type(&self) -> &str {
        match self {
            ReadModelChange::Updated { read_model_type, .. }
            | ReadModelChange::Deleted { read_model_type, .. } => read_model_type,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ReadModelChange::Updated { id, .. } | ReadModelChange::Deleted { id, .. } => id,
        }
    }
}

/// Applies registered projections and raw-event handlers to a read-model store
pub struct ReadModelProjector {
    store: Arc<dyn ReadModelStore>,
    projections: Arc<ProjectionRegistry>,
    handlers: Arc<EventHandlerRegistry>,
    migrations: Arc<MigrationRegistry>,
    max_retries: usize,
}

impl ReadModelProjector {
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        projections: Arc<ProjectionRegistry>,
        handlers: Arc<EventHandlerRegistry>,
        migrations: Arc<MigrationRegistry>,
        config: &MaterializerConfig,
    ) -> Self {
        Self {
            store,
            projections,
            handlers,
            migrations,
            max_retries: config.projection_max_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReadModelStore> {
        &self.store
    }

    /// Run every projection bound to the entity's type
    ///
    /// Tombstoned entities (`state == null`) are projected too, so deletion
    /// projections can react. Returns the records that changed.
    pub fn on_entity_changed(&self, entity: &EntityState) -> Result<Vec<ReadModelChange>> {
        let mut changes = Vec::new();

        for binding in self.projections.for_entity_type(&entity.entity_type) {
            for id in self.affected_ids(binding, entity)? {
                if let Some(change) = self.apply(binding, entity, &id)? {
                    changes.push(change);
                }
            }
        }

        Ok(changes)
    }

    /// Run raw-event handlers for newly appended events
    pub fn on_events(&self, events: &[Event]) -> Result<()> {
        if self.handlers.is_empty() {
            return Ok(());
        }

        for event in events {
            let handlers = self
                .handlers
                .handlers_for(&event.entity_type_name, &event.type_name);
            if handlers.is_empty() {
                continue;
            }

            let event = self.migrations.migrate(event.clone())?;
            for handler in handlers {
                (handler.handle)(&event, self.store.as_ref()).map_err(|e| Error::Projection {
                    projection: handler.name.clone(),
                    read_model_type: event.entity_type_name.clone(),
                    read_model_id: event.entity_id.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    fn affected_ids(&self, binding: &ProjectionBinding, entity: &EntityState) -> Result<Vec<String>> {
        let join_key = (binding.join_key)(entity)
            .map_err(|e| projection_error(binding, &entity.entity_id, e))?;

        let ids = match join_key {
            JoinKey::Skip => Vec::new(),
            JoinKey::Single(id) => vec![id],
            JoinKey::Many(ids) => {
                let mut seen = HashSet::new();
                ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
            }
            JoinKey::Filter(filter) => self
                .store
                .search(
                    &binding.read_model_type,
                    &SearchRequest::new().filter(filter),
                    &self.migrations,
                )?
                .items
                .into_iter()
                .map(|record| record.id)
                .collect(),
        };

        debug!(
            projection = %binding.name,
            entity = %entity.key(),
            affected = ids.len(),
            "Resolved join key"
        );
        Ok(ids)
    }

    /// Project onto one record, retrying on version conflicts
    fn apply(
        &self,
        binding: &ProjectionBinding,
        entity: &EntityState,
        id: &str,
    ) -> Result<Option<ReadModelChange>> {
        let read_model_type = binding.read_model_type.as_str();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let current = match self.store.fetch(read_model_type, id)? {
                Some(record) => Some(self.migrations.migrate(record)?),
                None => None,
            };
            let projection = (binding.project)(entity, id, current.as_ref())
                .map_err(|e| projection_error(binding, id, e))?;

            let outcome = match projection {
                Projection::NoOp => return Ok(None),
                Projection::Update(fields) => {
                    let mut record = current.unwrap_or_else(|| {
                        ReadModelRecord::new(
                            read_model_type,
                            id,
                            self.migrations.latest_version(read_model_type),
                        )
                    });
                    record.merge(fields);
                    self.store
                        .store(&record)
                        .map(|version| ReadModelChange::Updated {
                            read_model_type: read_model_type.to_string(),
                            id: id.to_string(),
                            version,
                        })
                }
                Projection::Delete => match current {
                    None => return Ok(None),
                    Some(record) => self
                        .store
                        .delete(read_model_type, id, record.version)
                        .map(|()| ReadModelChange::Deleted {
                            read_model_type: read_model_type.to_string(),
                            id: id.to_string(),
                        }),
                },
            };

            match outcome {
                Ok(change) => return Ok(Some(change)),
                Err(Error::Concurrency { .. }) if attempt < self.max_retries => {
                    debug!(
                        projection = %binding.name,
                        read_model_type,
                        id,
                        attempt,
                        "Version conflict, re-running projection"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn projection_error(binding: &ProjectionBinding, id: &str, e: HandlerError) -> Error {
    Error::Projection {
        projection: binding.name.clone(),
        read_model_type: binding.read_model_type.clone(),
        read_model_id: id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpression;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entity(entity_type: &str, id: &str, state: Value) -> EntityState {
        EntityState {
            entity_type: entity_type.to_string(),
            entity_id: id.to_string(),
            state,
            schema_version: 1,
            stream_version: 1,
            last_event_at: Utc::now(),
        }
    }

    fn projector(registry: ProjectionRegistry) -> (ReadModelProjector, Arc<InMemoryReadModelStore>) {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projector = ReadModelProjector::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(EventHandlerRegistry::new()),
            Arc::new(MigrationRegistry::default()),
            &MaterializerConfig::default(),
        );
        (projector, store)
    }

    fn car_registry() -> ProjectionRegistry {
        let mut registry = ProjectionRegistry::new();
        registry
            .register_by_id("car_model", "Car", "CarView", |car, _, _| {
                if car.is_tombstone() {
                    return Ok(Projection::Delete);
                }
                Projection::update(json!({
                    "model": car.state["model"],
                    "ownerId": car.state["ownerId"],
                }))
            })
            .unwrap();
        registry
            .register(
                "car_owner",
                "User",
                "CarView",
                |user| {
                    Ok(JoinKey::Filter(FilterExpression::parse(&json!({
                        "ownerId": {"eq": user.entity_id}
                    }))?))
                },
                |user, _, _| Projection::update(json!({"ownerName": user.state["name"]})),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_merge_in_either_order() {
        let (projector, store) = projector(car_registry());
        projector
            .on_entity_changed(&entity("Car", "c-1", json!({"model": "T", "ownerId": "u-1"})))
            .unwrap();
        projector
            .on_entity_changed(&entity("User", "u-1", json!({"name": "Ann"})))
            .unwrap();
        // Re-projecting the car keeps the owner's field.
        projector
            .on_entity_changed(&entity("Car", "c-1", json!({"model": "S", "ownerId": "u-1"})))
            .unwrap();

        let record = store.fetch("CarView", "c-1").unwrap().unwrap();
        assert_eq!(record.get("model"), Some(&json!("S")));
        assert_eq!(record.get("ownerName"), Some(&json!("Ann")));
        assert_eq!(record.version, 3);
    }

    #[test]
    fn test_filter_join_updates_only_matching_records() {
        let (projector, store) = projector(car_registry());
        for (id, owner) in [("c-1", "u-1"), ("c-2", "u-2"), ("c-3", "u-1")] {
            projector
                .on_entity_changed(&entity("Car", id, json!({"model": "T", "ownerId": owner})))
                .unwrap();
        }

        let changes = projector
            .on_entity_changed(&entity("User", "u-1", json!({"name": "Ann"})))
            .unwrap();
        let ids: Vec<_> = changes.iter().map(ReadModelChange::id).collect();
        assert_eq!(ids, vec!["c-1", "c-3"]);

        let untouched = store.fetch("CarView", "c-2").unwrap().unwrap();
        assert_eq!(untouched.get("ownerName"), None);
        assert_eq!(untouched.version, 1);
    }

    #[test]
    fn test_filter_join_reaches_records_at_older_schema() {
        let store = Arc::new(InMemoryReadModelStore::new());
        // Written before `owner` was renamed to `ownerId`
        let mut old = ReadModelRecord::new("CarView", "c-1", 1);
        old.fields.insert("owner".into(), json!("u-1"));
        store.store(&old).unwrap();

        let migrations = MigrationRegistry::builder()
            .rule("CarView", 1, 2, |mut p| {
                if let Some(owner) = p.as_object_mut().and_then(|fields| fields.remove("owner")) {
                    p["ownerId"] = owner;
                }
                p
            })
            .build()
            .unwrap();
        let projector = ReadModelProjector::new(
            store.clone(),
            Arc::new(car_registry()),
            Arc::new(EventHandlerRegistry::new()),
            Arc::new(migrations),
            &MaterializerConfig::default(),
        );

        let changes = projector
            .on_entity_changed(&entity("User", "u-1", json!({"name": "Ann"})))
            .unwrap();
        assert_eq!(changes.len(), 1);

        let record = store.fetch("CarView", "c-1").unwrap().unwrap();
        assert_eq!(record.schema_version, 2);
        assert_eq!(record.get("ownerId"), Some(&json!("u-1")));
        assert_eq!(record.get("ownerName"), Some(&json!("Ann")));
        assert_eq!(record.get("owner"), None);
    }

    #[test]
    fn test_tombstone_deletes_record() {
        let (projector, store) = projector(car_registry());
        projector
            .on_entity_changed(&entity("Car", "c-1", json!({"model": "T", "ownerId": "u-1"})))
            .unwrap();

        let changes = projector
            .on_entity_changed(&entity("Car", "c-1", Value::Null))
            .unwrap();
        assert!(matches!(changes[0], ReadModelChange::Deleted { .. }));
        assert!(store.fetch("CarView", "c-1").unwrap().is_none());
    }

    #[test]
    fn test_many_join_and_skip() {
        let mut registry = ProjectionRegistry::new();
        registry
            .register(
                "tags",
                "Post",
                "TagView",
                |post| match post.state["tags"].as_array() {
                    Some(tags) => Ok(JoinKey::Many(
                        tags.iter().filter_map(|t| t.as_str().map(String::from)).collect(),
                    )),
                    None => Ok(JoinKey::Skip),
                },
                |post, _, current| {
                    let count = current
                        .and_then(|r| r.get("posts"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    Projection::update(json!({"posts": count + 1, "last": post.entity_id}))
                },
            )
            .unwrap();
        let (projector, store) = projector(registry);

        let changes = projector
            .on_entity_changed(&entity("Post", "p-1", json!({"tags": ["a", "b", "a"]})))
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(projector
            .on_entity_changed(&entity("Post", "p-2", json!({})))
            .unwrap()
            .is_empty());
        assert_eq!(store.fetch("TagView", "a").unwrap().unwrap().get("posts"), Some(&json!(1)));
    }

    #[test]
    fn test_conflict_retries_then_surfaces() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = ProjectionRegistry::new();
        let interfering_store = store.clone();
        let counter = calls.clone();
        registry
            .register_by_id("racy", "Car", "CarView", move |_, id, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Another writer bumps the record between our read and write.
                let mut other = interfering_store
                    .fetch("CarView", id)
                    .map_err(|e| e.to_string())?
                    .unwrap_or_else(|| ReadModelRecord::new("CarView", id, 1));
                other.fields.insert("other".into(), json!(true));
                interfering_store.store(&other).map_err(|e| e.to_string())?;
                Projection::update(json!({"mine": true}))
            })
            .unwrap();

        let mut config = MaterializerConfig::default();
        config.projection_max_retries = 3;
        let projector = ReadModelProjector::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(EventHandlerRegistry::new()),
            Arc::new(MigrationRegistry::default()),
            &config,
        );

        let err = projector
            .on_entity_changed(&entity("Car", "c-1", json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.fetch("CarView", "c-1").unwrap().unwrap().get("mine"), None);
    }

    #[test]
    fn test_projection_error_is_surfaced() {
        let mut registry = ProjectionRegistry::new();
        registry
            .register_by_id("broken", "Car", "CarView", |_, _, _| Err("no model".into()))
            .unwrap();
        let (projector, store) = projector(registry);

        let err = projector
            .on_entity_changed(&entity("Car", "c-1", json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::Projection { ref projection, .. } if projection == "broken"));
        assert_eq!(store.count("CarView"), 0);
    }

    #[test]
    fn test_raw_event_handlers() {
        use crate::types::{EntityKey, NewEvent};

        let mut handlers = EventHandlerRegistry::new();
        handlers.register("sales", "Car", "CarSold", |event, store| {
            let mut record = store
                .fetch("SalesView", "total")?
                .unwrap_or_else(|| ReadModelRecord::new("SalesView", "total", 1));
            let sold = record.get("sold").and_then(Value::as_u64).unwrap_or(0);
            record.fields.insert("sold".into(), json!(sold + 1));
            record.fields.insert("last".into(), json!(event.entity_id));
            store.store(&record)?;
            Ok(())
        });

        let store = Arc::new(InMemoryReadModelStore::new());
        let projector = ReadModelProjector::new(
            store.clone(),
            Arc::new(ProjectionRegistry::new()),
            Arc::new(handlers),
            Arc::new(MigrationRegistry::default()),
            &MaterializerConfig::default(),
        );

        let key = EntityKey::new("Car", "c-9");
        let sold = Event::from_new(&key, NewEvent::new("CarSold", json!({})), 1, Utc::now());
        let other = Event::from_new(&key, NewEvent::new("CarWashed", json!({})), 2, Utc::now());
        projector.on_events(&[sold, other]).unwrap();

        let record = store.fetch("SalesView", "total").unwrap().unwrap();
        assert_eq!(record.get("sold"), Some(&json!(1)));
        assert_eq!(record.get("last"), Some(&json!("c-9")));
    }
}
