//! Storage access handed to data-migration jobs

use std::sync::Arc;

use tracing::debug;

use crate::config::MaterializerConfig;
use crate::error::{Error, Result};
use crate::event_store::EventLog;
use crate::migration::MigrationRegistry;
use crate::projector::ReadModelStore;
use crate::reducer::EntityReducer;
use crate::types::{EntityKey, ReadModelRecord};

/// Everything a job may read or rewrite, with paging helpers
#[derive(Clone)]
pub struct MigrationContext {
    log: Arc<dyn EventLog>,
    store: Arc<dyn ReadModelStore>,
    reducer: Arc<EntityReducer>,
    migrations: Arc<MigrationRegistry>,
    page_size: usize,
    max_retries: usize,
}

impl MigrationContext {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn ReadModelStore>,
        reducer: Arc<EntityReducer>,
        migrations: Arc<MigrationRegistry>,
        config: &MaterializerConfig,
    ) -> Self {
        Self {
            log,
            store,
            reducer,
            migrations,
            page_size: config.migration_page_size.max(1),
            max_retries: config.projection_max_retries.max(1),
        }
    }

    pub fn log(&self) -> &dyn EventLog {
        self.log.as_ref()
    }

    pub fn store(&self) -> &dyn ReadModelStore {
        self.store.as_ref()
    }

    pub fn reducer(&self) -> &EntityReducer {
        &self.reducer
    }

    pub fn migrations(&self) -> &MigrationRegistry {
        &self.migrations
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Visit every entity id of a type, one page at a time
    pub fn for_each_entity_id(
        &self,
        entity_type: &str,
        mut f: impl FnMut(&str) -> Result<()>,
    ) -> Result<usize> {
        let mut visited = 0;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .log
                .entity_ids(entity_type, cursor.as_deref(), self.page_size)?;
            for id in &page {
                f(id)?;
            }
            visited += page.len();

            if page.len() < self.page_size {
                return Ok(visited);
            }
            cursor = page.last().cloned();
        }
    }

    /// Visit every stored record of a read-model type, one page at a time
    pub fn for_each_read_model(
        &self,
        read_model_type: &str,
        mut f: impl FnMut(ReadModelRecord) -> Result<()>,
    ) -> Result<usize> {
        let mut visited = 0;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .list_ids(read_model_type, cursor.as_deref(), self.page_size)?;
            for id in &page {
                // Deleted since the page was listed
                if let Some(record) = self.store.fetch(read_model_type, id)? {
                    f(record)?;
                    visited += 1;
                }
            }

            if page.len() < self.page_size {
                return Ok(visited);
            }
            cursor = page.last().cloned();
        }
    }

    /// Upgrade every stored record of a type to its latest schema and store it
    ///
    /// Records already at the latest version are left alone, so re-running is
    /// cheap. A record written concurrently is re-read and upgraded again.
    /// Returns the number of records rewritten.
    pub fn rewrite_read_models(&self, read_model_type: &str) -> Result<usize> {
        let latest = self.migrations.latest_version(read_model_type);
        let mut rewritten = 0;

        self.for_each_read_model(read_model_type, |record| {
            if self.rewrite_read_model(record, latest)? {
                rewritten += 1;
            }
            Ok(())
        })?;

        Ok(rewritten)
    }

    /// Store one record at `latest`; `false` if there was nothing to do
    fn rewrite_read_model(&self, mut record: ReadModelRecord, latest: u32) -> Result<bool> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            if record.schema_version == latest {
                return Ok(false);
            }

            let read_model_type = record.type_name.clone();
            let id = record.id.clone();
            match self.store.store(&self.migrations.migrate(record)?) {
                Ok(_) => {
                    debug!(%read_model_type, %id, "Rewrote read model");
                    return Ok(true);
                }
                Err(Error::Concurrency { .. }) if attempt < self.max_retries => {
                    debug!(%read_model_type, %id, attempt, "Version conflict, re-reading read model");
                    match self.store.fetch(&read_model_type, &id)? {
                        Some(current) => record = current,
                        None => return Ok(false),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-reduce every entity of a type from raw events and snapshot the result
    ///
    /// Entities with no applicable events are skipped. Returns the number of
    /// snapshots written.
    pub fn rewrite_entities(&self, entity_type: &str) -> Result<usize> {
        let mut rewritten = 0;

        self.for_each_entity_id(entity_type, |id| {
            let key = EntityKey::new(entity_type, id);
            match self.reducer.rebuild_snapshot(&key) {
                Ok(_) => {
                    rewritten += 1;
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        })?;

        Ok(rewritten)
    }
}
