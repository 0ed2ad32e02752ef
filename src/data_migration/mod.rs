//! Data-Migration Runner
//!
//! On-demand jobs that rewrite materialized state directly, outside the
//! event-sourced path: backfilling a new read model, upgrading stored
//! read-model schemas, or re-snapshotting entities after a reducer change.
//!
//! Jobs run in ascending priority order. Each one is bracketed by a
//! *started* and a *finished* marker, stored as events of the
//! `DataMigration` entity type keyed by job name; a finished job is skipped
//! by later runs. Jobs must therefore be idempotent: one that failed or was
//! interrupted runs again from the start.

mod context;
mod runner;

use crate::error::Result;

pub use context::MigrationContext;
pub use runner::{
    DataMigrationRunner, MigrationReport, FINISHED_EVENT, MARKER_ENTITY_TYPE, STARTED_EVENT,
};

/// A resumable, idempotent data-migration job
pub trait DataMigration: Send + Sync {
    /// Unique name; also the marker key
    fn name(&self) -> &str;

    /// Lower values run first
    fn priority(&self) -> i32 {
        0
    }

    fn run(&self, context: &MigrationContext) -> Result<()>;
}

/// Job built from a closure
pub struct FnMigration<F> {
    name: String,
    priority: i32,
    run: F,
}

impl<F> FnMigration<F> {
    pub fn new(name: impl Into<String>, priority: i32, run: F) -> Self
    where
        F: Fn(&MigrationContext) -> Result<()> + Send + Sync,
    {
        Self {
            name: name.into(),
            priority,
            run,
        }
    }
}

impl<F> DataMigration for FnMigration<F>
where
    F: Fn(&MigrationContext) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn run(&self, context: &MigrationContext) -> Result<()> {
        (self.run)(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::config::MaterializerConfig;
    use crate::error::Error;
    use crate::event_store::{EventLog, InMemoryEventLog};
    use crate::migration::MigrationRegistry;
    use crate::projector::{InMemoryReadModelStore, ReadModelStore};
    use crate::reducer::{EntityReducer, ReducerRegistry};
    use crate::types::{EntityKey, NewEvent, ReadModelRecord};

    /// Lets another writer touch the record right before the first store
    struct ContendedStore {
        inner: InMemoryReadModelStore,
        contended: AtomicBool,
    }

    impl ReadModelStore for ContendedStore {
        fn fetch(&self, read_model_type: &str, id: &str) -> Result<Option<ReadModelRecord>> {
            self.inner.fetch(read_model_type, id)
        }

        fn store(&self, record: &ReadModelRecord) -> Result<u64> {
            if !self.contended.swap(true, Ordering::SeqCst) {
                if let Some(mut current) = self.inner.fetch(&record.type_name, &record.id)? {
                    current.fields.insert("touched".into(), json!(true));
                    self.inner.store(&current)?;
                }
            }
            self.inner.store(record)
        }

        fn delete(&self, read_model_type: &str, id: &str, expected_version: u64) -> Result<()> {
            self.inner.delete(read_model_type, id, expected_version)
        }

        fn scan(&self, read_model_type: &str) -> Result<Vec<ReadModelRecord>> {
            self.inner.scan(read_model_type)
        }

        fn list_ids(
            &self,
            read_model_type: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<String>> {
            self.inner.list_ids(read_model_type, after, limit)
        }
    }

    struct Fixture {
        log: Arc<InMemoryEventLog>,
        store: Arc<InMemoryReadModelStore>,
        context: MigrationContext,
    }

    fn fixture(migrations: MigrationRegistry) -> Fixture {
        let mut reducers = ReducerRegistry::new();
        reducers
            .register("Post", "PostCreated", |event, _| Ok(event.payload.clone()))
            .unwrap();

        let log = Arc::new(InMemoryEventLog::new());
        let store = Arc::new(InMemoryReadModelStore::new());
        let migrations = Arc::new(migrations);
        let mut config = MaterializerConfig::default();
        config.snapshot_threshold = usize::MAX;
        config.migration_page_size = 2;
        let reducer = Arc::new(EntityReducer::new(
            log.clone(),
            Arc::new(reducers),
            migrations.clone(),
            &config,
        ));
        let context = MigrationContext::new(log.clone(), store.clone(), reducer, migrations, &config);
        Fixture {
            log,
            store,
            context,
        }
    }

    #[test]
    fn test_priority_order_and_skip_finished() {
        let f = fixture(MigrationRegistry::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut runner = DataMigrationRunner::new(f.context.clone());
        for (name, priority) in [("late", 10), ("early", -1), ("middle", 0)] {
            let order = order.clone();
            runner
                .register(Arc::new(FnMigration::new(name, priority, move |_| {
                    order.lock().push(name);
                    Ok(())
                })))
                .unwrap();
        }

        let report = runner.run().unwrap();
        assert_eq!(report.completed, vec!["early", "middle", "late"]);
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);

        let again = runner.run().unwrap();
        assert!(again.completed.is_empty());
        assert_eq!(again.skipped.len(), 3);
        assert_eq!(order.lock().len(), 3);
        assert!(runner.is_finished("early").unwrap());
    }

    #[test]
    fn test_failed_job_is_rerun() {
        let f = fixture(MigrationRegistry::default());
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut runner = DataMigrationRunner::new(f.context.clone());
        let counter = attempts.clone();
        runner
            .register(Arc::new(FnMigration::new("flaky", 0, move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Config("first attempt fails".into()));
                }
                Ok(())
            })))
            .unwrap();

        assert!(runner.run().is_err());
        assert!(!runner.is_finished("flaky").unwrap());

        assert_eq!(runner.run().unwrap().completed, vec!["flaky"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let markers = f
            .log
            .events_after(&EntityKey::new(MARKER_ENTITY_TYPE, "flaky"), None)
            .unwrap();
        let types: Vec<_> = markers.iter().map(|e| e.type_name.as_str()).collect();
        assert_eq!(types, vec![STARTED_EVENT, STARTED_EVENT, FINISHED_EVENT]);
    }

    #[test]
    fn test_duplicate_job_names_are_rejected() {
        let f = fixture(MigrationRegistry::default());
        let mut runner = DataMigrationRunner::new(f.context);
        runner
            .register(Arc::new(FnMigration::new("a", 0, |_| Ok(()))))
            .unwrap();
        assert!(runner
            .register(Arc::new(FnMigration::new("a", 1, |_| Ok(()))))
            .is_err());
    }

    #[test]
    fn test_rewrite_read_models_pages_through_everything() {
        let migrations = MigrationRegistry::builder()
            .rule("PostView", 1, 2, |mut p| {
                p["slug"] = json!("untitled");
                p
            })
            .build()
            .unwrap();
        let f = fixture(migrations);

        for i in 0..5 {
            let record = ReadModelRecord::new("PostView", format!("p-{}", i), 1);
            f.store.store(&record).unwrap();
        }

        assert_eq!(f.context.rewrite_read_models("PostView").unwrap(), 5);
        let record = f.store.fetch("PostView", "p-4").unwrap().unwrap();
        assert_eq!(record.schema_version, 2);
        assert_eq!(record.version, 2);
        assert_eq!(record.get("slug"), Some(&json!("untitled")));

        // Second pass finds nothing to do.
        assert_eq!(f.context.rewrite_read_models("PostView").unwrap(), 0);
    }

    #[test]
    fn test_rewrite_read_models_rereads_after_conflict() {
        let migrations = Arc::new(
            MigrationRegistry::builder()
                .rule("PostView", 1, 2, |mut p| {
                    p["slug"] = json!("untitled");
                    p
                })
                .build()
                .unwrap(),
        );
        let store = Arc::new(ContendedStore {
            inner: InMemoryReadModelStore::new(),
            contended: AtomicBool::new(true),
        });
        store
            .inner
            .store(&ReadModelRecord::new("PostView", "p-1", 1))
            .unwrap();
        store.contended.store(false, Ordering::SeqCst);

        let log = Arc::new(InMemoryEventLog::new());
        let config = MaterializerConfig::default();
        let reducer = Arc::new(EntityReducer::new(
            log.clone(),
            Arc::new(ReducerRegistry::new()),
            migrations.clone(),
            &config,
        ));
        let context = MigrationContext::new(log, store.clone(), reducer, migrations, &config);

        assert_eq!(context.rewrite_read_models("PostView").unwrap(), 1);
        let record = store.fetch("PostView", "p-1").unwrap().unwrap();
        assert_eq!(record.schema_version, 2);
        assert_eq!(record.version, 3);
        assert_eq!(record.get("slug"), Some(&json!("untitled")));
        assert_eq!(record.get("touched"), Some(&json!(true)));
    }

    #[test]
    fn test_rewrite_entities_writes_snapshots() {
        let f = fixture(MigrationRegistry::default());
        for i in 0..3 {
            let key = EntityKey::new("Post", format!("p-{}", i));
            f.log
                .append(&key, vec![NewEvent::new("PostCreated", json!({"n": i}))], None)
                .unwrap();
        }
        let orphan = EntityKey::new("Post", "p-9");
        f.log
            .append(&orphan, vec![NewEvent::new("PostLiked", json!({}))], None)
            .unwrap();

        assert_eq!(f.context.rewrite_entities("Post").unwrap(), 3);
        let snapshot = f
            .log
            .latest_snapshot(&EntityKey::new("Post", "p-2"))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, json!({"n": 2}));
        assert!(f.log.latest_snapshot(&orphan).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawn_runs_on_blocking_pool() {
        let f = fixture(MigrationRegistry::default());
        let mut runner = DataMigrationRunner::new(f.context.clone());
        runner
            .register(Arc::new(FnMigration::new("noop", 0, |_| Ok(()))))
            .unwrap();

        let report = runner.spawn().await.unwrap().unwrap();
        assert_eq!(report.completed, vec!["noop"]);
    }
}
