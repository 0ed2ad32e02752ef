//! Materializer facade
//!
//! Wires the event log, reducer, projector and stores together and exposes
//! the operations collaborators call. Everything touching one
//! `(entityType, entityID)` runs under that key's lock: the append, the
//! reduction it triggers and the projections fed by the new state. Different
//! keys proceed in parallel.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MaterializerConfig;
use crate::data_migration::{DataMigration, DataMigrationRunner, MigrationContext, MigrationReport};
use crate::error::{Error, Result};
use crate::event_store::{EventLog, FileEventLog, InMemoryEventLog};
use crate::filter::FilterExpression;
use crate::migration::{Migratable, MigrationRegistry};
use crate::notify::{ChangeFeed, ChangeMessage, ChangeNotification};
use crate::projector::{
    EventHandlerRegistry, FileReadModelStore, InMemoryReadModelStore, ProjectionRegistry,
    ReadModelProjector, ReadModelStore, SearchRequest,
};
use crate::reducer::{EntityReducer, ReducerRegistry};
use crate::types::{EntityKey, EntityState, Event, NewEvent, Page, ReadModelRecord, SortBy};
use crate::utils::KeyedLocks;

/// Collects registries and stores before the materializer is assembled
pub struct MaterializerBuilder {
    config: MaterializerConfig,
    log: Option<Arc<dyn EventLog>>,
    store: Option<Arc<dyn ReadModelStore>>,
    reducers: ReducerRegistry,
    projections: ProjectionRegistry,
    handlers: EventHandlerRegistry,
    migrations: MigrationRegistry,
    jobs: Vec<Arc<dyn DataMigration>>,
}

impl MaterializerBuilder {
    pub fn new(config: MaterializerConfig) -> Self {
        Self {
            config,
            log: None,
            store: None,
            reducers: ReducerRegistry::new(),
            projections: ProjectionRegistry::new(),
            handlers: EventHandlerRegistry::new(),
            migrations: MigrationRegistry::default(),
            jobs: Vec::new(),
        }
    }

    /// Use the JSONL event log and JSON read-model store under `config.data_dir`
    pub fn with_file_stores(mut self) -> Result<Self> {
        self.log = Some(Arc::new(FileEventLog::open(&self.config)?));
        self.store = Some(Arc::new(FileReadModelStore::open(&self.config)?));
        Ok(self)
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn read_model_store(mut self, store: Arc<dyn ReadModelStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reducers(mut self, reducers: ReducerRegistry) -> Self {
        self.reducers = reducers;
        self
    }

    pub fn projections(mut self, projections: ProjectionRegistry) -> Self {
        self.projections = projections;
        self
    }

    pub fn event_handlers(mut self, handlers: EventHandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn data_migration(mut self, job: Arc<dyn DataMigration>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Validate the configuration and assemble the materializer
    ///
    /// Stores that were not set default to the in-memory backends.
    pub fn build(self) -> Result<Materializer> {
        self.config.validate()?;

        let log = self
            .log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryReadModelStore::new()));
        let migrations = Arc::new(self.migrations);

        let reducer = Arc::new(EntityReducer::new(
            Arc::clone(&log),
            Arc::new(self.reducers),
            Arc::clone(&migrations),
            &self.config,
        ));
        let projector = ReadModelProjector::new(
            Arc::clone(&store),
            Arc::new(self.projections),
            Arc::new(self.handlers),
            Arc::clone(&migrations),
            &self.config,
        );
        let context = MigrationContext::new(
            Arc::clone(&log),
            Arc::clone(&store),
            Arc::clone(&reducer),
            Arc::clone(&migrations),
            &self.config,
        );

        // Reject duplicate job names now rather than on the first run
        let mut runner = DataMigrationRunner::new(context.clone());
        for job in &self.jobs {
            runner.register(Arc::clone(job))?;
        }

        info!(
            data_dir = %self.config.data_dir.display(),
            snapshot_threshold = self.config.snapshot_threshold,
            jobs = self.jobs.len(),
            "Materializer ready"
        );

        Ok(Materializer {
            feed: Arc::new(ChangeFeed::new(self.config.change_feed_capacity)),
            config: self.config,
            log,
            store,
            reducer,
            projector,
            migrations,
            context,
            jobs: self.jobs,
            locks: KeyedLocks::new(),
        })
    }
}

/// The state-materialization core
pub struct Materializer {
    config: MaterializerConfig,
    log: Arc<dyn EventLog>,
    store: Arc<dyn ReadModelStore>,
    reducer: Arc<EntityReducer>,
    projector: ReadModelProjector,
    migrations: Arc<MigrationRegistry>,
    context: MigrationContext,
    jobs: Vec<Arc<dyn DataMigration>>,
    feed: Arc<ChangeFeed>,
    locks: KeyedLocks<EntityKey>,
}

impl Materializer {
    pub fn builder(config: MaterializerConfig) -> MaterializerBuilder {
        MaterializerBuilder::new(config)
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn read_model_store(&self) -> &Arc<dyn ReadModelStore> {
        &self.store
    }

    /// Append events to an entity, then reduce it and run its projections
    ///
    /// With `expected_version` the append fails with [`Error::Concurrency`]
    /// unless it equals the entity's stream version; without it the append
    /// is last-writer-wins. Events are stamped with the latest schema
    /// version of their type.
    ///
    /// The events are durable once the log accepts them. A reduction or
    /// projection failure after that is returned as the error, and the
    /// read models catch up on the next change of the entity.
    pub fn append_events(
        &self,
        entity_type: &str,
        entity_id: &str,
        events: Vec<NewEvent>,
        expected_version: Option<u64>,
    ) -> Result<Vec<Event>> {
        let key = EntityKey::new(entity_type, entity_id);

        self.locks.with_lock(&key, || {
            let events: Vec<NewEvent> = events
                .into_iter()
                .map(|mut event| {
                    event.version = self.migrations.latest_version(&event.type_name);
                    event
                })
                .collect();

            let stored = self.log.append(&key, events, expected_version)?;
            if stored.is_empty() {
                return Ok(stored);
            }

            match self.reducer.reduce(&key) {
                Ok(state) => {
                    self.feed.publish(ChangeNotification::entity_reduced(&state));
                    for change in self.projector.on_entity_changed(&state)? {
                        self.feed.publish(change.into());
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!(%key, "No state yet, skipping projections");
                }
                Err(e) => return Err(e),
            }

            self.projector.on_events(&stored)?;
            Ok(stored)
        })
    }

    /// Current state of an entity; deleted entities are not found
    pub fn get_entity(&self, entity_type: &str, entity_id: &str) -> Result<EntityState> {
        let key = EntityKey::new(entity_type, entity_id);
        let state = self.locks.with_lock(&key, || self.reducer.reduce(&key))?;
        if state.is_tombstone() {
            return Err(Error::entity_not_found(entity_type, entity_id));
        }
        Ok(state)
    }

    /// Stream version of an entity, `0` if it has no events
    pub fn stream_version(&self, entity_type: &str, entity_id: &str) -> Result<u64> {
        self.log
            .stream_version(&EntityKey::new(entity_type, entity_id))
    }

    /// Search a read model with a filter written as JSON
    ///
    /// `filter` of `None` (or `{}`) matches every record. Records are
    /// migrated to the latest schema of their type before matching.
    pub fn search_read_model(
        &self,
        read_model_type: &str,
        filter: Option<&Value>,
        sort: Option<SortBy>,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> Result<Page> {
        let filter = filter.map(FilterExpression::parse).transpose()?;
        self.search(
            read_model_type,
            &SearchRequest {
                filter,
                sort,
                limit,
                cursor,
            },
        )
    }

    /// Search a read model with a prepared request
    ///
    /// Filters and sorts see each record at the latest schema of its type.
    pub fn search(&self, read_model_type: &str, request: &SearchRequest) -> Result<Page> {
        self.store.search(read_model_type, request, &self.migrations)
    }

    /// One read-model record, migrated to its latest schema
    pub fn get_read_model(&self, read_model_type: &str, id: &str) -> Result<ReadModelRecord> {
        let record = self
            .store
            .fetch(read_model_type, id)?
            .ok_or_else(|| Error::read_model_not_found(read_model_type, id))?;
        self.migrations.migrate(record)
    }

    /// Upgrade any record to the latest version of its type
    pub fn migrate_record<R: Migratable>(&self, record: R) -> Result<R> {
        self.migrations.migrate(record)
    }

    /// Receive a notification for every reduction and read-model write
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeMessage> {
        self.feed.subscribe()
    }

    /// Run pending data-migration jobs on the calling thread
    pub fn run_data_migrations(&self) -> Result<MigrationReport> {
        self.runner()?.run()
    }

    /// Run pending data-migration jobs on the tokio blocking pool
    pub fn spawn_data_migrations(&self) -> Result<JoinHandle<Result<MigrationReport>>> {
        Ok(self.runner()?.spawn())
    }

    fn runner(&self) -> Result<DataMigrationRunner> {
        let mut runner =
            DataMigrationRunner::new(self.context.clone()).with_feed(Arc::clone(&self.feed));
        for job in &self.jobs {
            runner.register(Arc::clone(job))?;
        }
        Ok(runner)
    }
}
