//! In-memory read-model store

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::types::ReadModelRecord;

use super::store::{conflict, ReadModelStore};

/// Read models held in memory, one ordered map per type
#[derive(Default)]
pub struct InMemoryReadModelStore {
    tables: RwLock<HashMap<String, BTreeMap<String, ReadModelRecord>>>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of one type
    pub fn count(&self, read_model_type: &str) -> usize {
        self.tables
            .read()
            .get(read_model_type)
            .map_or(0, BTreeMap::len)
    }
}

impl ReadModelStore for InMemoryReadModelStore {
    fn fetch(&self, read_model_type: &str, id: &str) -> Result<Option<ReadModelRecord>> {
        Ok(self
            .tables
            .read()
            .get(read_model_type)
            .and_then(|table| table.get(id))
            .cloned())
    }

    fn store(&self, record: &ReadModelRecord) -> Result<u64> {
        let mut tables = self.tables.write();
        let table = tables.entry(record.type_name.clone()).or_default();

        let actual = table.get(&record.id).map_or(0, |r| r.version);
        if actual != record.version {
            return Err(conflict(&record.type_name, &record.id, record.version, actual));
        }

        let mut stored = record.clone();
        stored.version = actual + 1;
        table.insert(stored.id.clone(), stored);

        debug!(read_model_type = %record.type_name, id = %record.id, version = actual + 1, "Stored read model");
        Ok(actual + 1)
    }

    fn delete(&self, read_model_type: &str, id: &str, expected_version: u64) -> Result<()> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(read_model_type) else {
            return match expected_version {
                0 => Ok(()),
                expected => Err(conflict(read_model_type, id, expected, 0)),
            };
        };

        let actual = table.get(id).map_or(0, |r| r.version);
        if actual != expected_version {
            return Err(conflict(read_model_type, id, expected_version, actual));
        }
        table.remove(id);
        Ok(())
    }

    fn scan(&self, read_model_type: &str) -> Result<Vec<ReadModelRecord>> {
        Ok(self
            .tables
            .read()
            .get(read_model_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    fn list_ids(
        &self,
        read_model_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(read_model_type) else {
            return Ok(Vec::new());
        };

        Ok(table
            .keys()
            .filter(|id| after.map_or(true, |cursor| id.as_str() > cursor))
            .take(limit)
            .cloned()
            .collect())
    }
}
