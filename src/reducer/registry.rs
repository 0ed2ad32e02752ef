//! Reducer registry keyed by `(entityType, eventType)`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, HandlerError, Result};
use crate::types::Event;

/// Folds one event into the prior state
///
/// The prior state is `None` for the first applicable event and after a
/// tombstone. Returning `Value::Null` marks the entity as deleted.
pub type ReducerFn =
    Arc<dyn Fn(&Event, Option<Value>) -> std::result::Result<Value, HandlerError> + Send + Sync>;

/// Reducers for every `(entityType, eventType)` pair the system handles
#[derive(Clone, Default)]
pub struct ReducerRegistry {
    reducers: HashMap<(String, String), ReducerFn>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer over raw JSON state
    pub fn register<F>(
        &mut self,
        entity_type: impl Into<String>,
        event_type: impl Into<String>,
        reducer: F,
    ) -> Result<()>
    where
        F: Fn(&Event, Option<Value>) -> std::result::Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let key = (entity_type.into(), event_type.into());
        if self.reducers.contains_key(&key) {
            return Err(Error::InvalidRegistry(format!(
                "reducer for {} on {} registered twice",
                key.1, key.0
            )));
        }
        self.reducers.insert(key, Arc::new(reducer));
        Ok(())
    }

    /// Register a reducer over typed payload and state
    pub fn register_typed<P, S, F>(
        &mut self,
        entity_type: impl Into<String>,
        event_type: impl Into<String>,
        reducer: F,
    ) -> Result<()>
    where
        P: DeserializeOwned,
        S: Serialize + DeserializeOwned,
        F: Fn(P, Option<S>, &Event) -> std::result::Result<S, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(entity_type, event_type, move |event, prior| {
            let payload: P = event.parse_payload()?;
            let prior: Option<S> = prior.map(serde_json::from_value).transpose()?;
            let next = reducer(payload, prior, event)?;
            Ok(serde_json::to_value(next)?)
        })
    }

    pub fn get(&self, entity_type: &str, event_type: &str) -> Option<&ReducerFn> {
        self.reducers
            .get(&(entity_type.to_string(), event_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.reducers.keys().collect();
        keys.sort();
        f.debug_struct("ReducerRegistry").field("reducers", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKey, NewEvent};
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Counter {
        total: i64,
    }

    #[derive(Deserialize)]
    struct Added {
        amount: i64,
    }

    fn event(payload: Value) -> Event {
        Event::from_new(
            &EntityKey::new("Counter", "c-1"),
            NewEvent::new("Added", payload),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ReducerRegistry::new();
        registry
            .register("Counter", "Added", |_, _| Ok(json!({})))
            .unwrap();
        let err = registry
            .register("Counter", "Added", |_, _| Ok(json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRegistry(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_typed_reducer() {
        let mut registry = ReducerRegistry::new();
        registry
            .register_typed("Counter", "Added", |added: Added, prior: Option<Counter>, _| {
                Ok(Counter {
                    total: prior.map_or(0, |c| c.total) + added.amount,
                })
            })
            .unwrap();

        let reducer = registry.get("Counter", "Added").unwrap();
        let state = reducer(&event(json!({"amount": 2})), Some(json!({"total": 3}))).unwrap();
        assert_eq!(state, json!({"total": 5}));

        assert!(reducer(&event(json!({"amount": "x"})), None).is_err());
        assert!(registry.get("Counter", "Removed").is_none());
    }
}
