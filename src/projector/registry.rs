//! Projection and raw-event handler registries

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, HandlerError, Result};
use crate::filter::FilterExpression;
use crate::types::{EntityState, Event, ReadModelRecord};

use super::store::ReadModelStore;

/// Which read-model records a source change affects
#[derive(Debug, Clone, PartialEq)]
pub enum JoinKey {
    Single(String),
    Many(Vec<String>),
    /// Every stored record matching the filter
    Filter(FilterExpression),
    /// The change does not concern this projection
    Skip,
}

/// What a projection function wants done with one record
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Overwrite these top-level fields, keep every other field
    Update(Map<String, Value>),
    NoOp,
    Delete,
}

impl Projection {
    /// `Update` from a JSON object; anything else is an error
    pub fn update(fields: Value) -> std::result::Result<Self, HandlerError> {
        match fields {
            Value::Object(map) => Ok(Projection::Update(map)),
            other => Err(format!("projection fields must be an object, got {}", other).into()),
        }
    }
}

pub type JoinKeyFn =
    Arc<dyn Fn(&EntityState) -> std::result::Result<JoinKey, HandlerError> + Send + Sync>;

pub type ProjectionFn = Arc<
    dyn Fn(&EntityState, &str, Option<&ReadModelRecord>) -> std::result::Result<Projection, HandlerError>
        + Send
        + Sync,
>;

pub type EventHandlerFn = Arc<
    dyn Fn(&Event, &dyn ReadModelStore) -> std::result::Result<(), HandlerError> + Send + Sync,
>;

/// One projection function bound to a source entity type and a read model
#[derive(Clone)]
pub struct ProjectionBinding {
    pub name: String,
    pub source_entity_type: String,
    pub read_model_type: String,
    pub(crate) join_key: JoinKeyFn,
    pub(crate) project: ProjectionFn,
}

impl fmt::Debug for ProjectionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionBinding")
            .field("name", &self.name)
            .field("source_entity_type", &self.source_entity_type)
            .field("read_model_type", &self.read_model_type)
            .finish()
    }
}

/// Projections in registration order
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    bindings: Vec<ProjectionBinding>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a projection function to a source entity type
    ///
    /// Names must be unique; they identify the projection in errors and logs.
    pub fn register<J, P>(
        &mut self,
        name: impl Into<String>,
        source_entity_type: impl Into<String>,
        read_model_type: impl Into<String>,
        join_key: J,
        project: P,
    ) -> Result<()>
    where
        J: Fn(&EntityState) -> std::result::Result<JoinKey, HandlerError> + Send + Sync + 'static,
        P: Fn(&EntityState, &str, Option<&ReadModelRecord>) -> std::result::Result<Projection, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.bindings.iter().any(|b| b.name == name) {
            return Err(Error::InvalidRegistry(format!(
                "projection {} registered twice",
                name
            )));
        }

        self.bindings.push(ProjectionBinding {
            name,
            source_entity_type: source_entity_type.into(),
            read_model_type: read_model_type.into(),
            join_key: Arc::new(join_key),
            project: Arc::new(project),
        });
        Ok(())
    }

    /// Projection keyed by the source entity's own id
    pub fn register_by_id<P>(
        &mut self,
        name: impl Into<String>,
        source_entity_type: impl Into<String>,
        read_model_type: impl Into<String>,
        project: P,
    ) -> Result<()>
    where
        P: Fn(&EntityState, &str, Option<&ReadModelRecord>) -> std::result::Result<Projection, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(
            name,
            source_entity_type,
            read_model_type,
            |entity| Ok(JoinKey::Single(entity.entity_id.clone())),
            project,
        )
    }

    /// Bindings for one source entity type, in registration order
    pub fn for_entity_type<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = &'a ProjectionBinding> + 'a {
        self.bindings
            .iter()
            .filter(move |b| b.source_entity_type == entity_type)
    }

    /// Every read-model type some projection writes
    pub fn read_model_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .map(|b| b.read_model_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// A raw-event handler with its name
#[derive(Clone)]
pub struct EventHandler {
    pub name: String,
    pub(crate) handle: EventHandlerFn,
}

/// Handlers invoked with each newly appended event, keyed by `(entityType, eventType)`
#[derive(Clone, Default)]
pub struct EventHandlerRegistry {
    handlers: HashMap<(String, String), Vec<EventHandler>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) where
        F: Fn(&Event, &dyn ReadModelStore) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .entry((entity_type.into(), event_type.into()))
            .or_default()
            .push(EventHandler {
                name: name.into(),
                handle: Arc::new(handler),
            });
    }

    /// Handlers for one event, in registration order
    pub fn handlers_for(&self, entity_type: &str, event_type: &str) -> &[EventHandler] {
        self.handlers
            .get(&(entity_type.to_string(), event_type.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerRegistry")
            .field("keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
