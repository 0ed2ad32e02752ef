//! File-backed read-model store
//!
//! One JSON document per record at `read_models/<type>/<id>.json`, each
//! rewritten atomically. Compare-and-set is enforced under a per-record
//! lock, so concurrent writers in this process never lose an update.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::MaterializerConfig;
use crate::error::Result;
use crate::types::ReadModelRecord;
use crate::utils::{atomic_write, cleanup_temp_files, path_segment, KeyedLocks};

use super::store::{conflict, ReadModelStore};

/// Read models persisted as one JSON file per record
pub struct FileReadModelStore {
    root: PathBuf,
    locks: KeyedLocks<(String, String)>,
}

impl FileReadModelStore {
    /// Open (or create) the store under `config.read_models_dir()`
    pub fn open(config: &MaterializerConfig) -> Result<Self> {
        Self::with_dir(config.read_models_dir())
    }

    /// Open (or create) the store in an explicit directory
    pub fn with_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.is_dir() {
                let cleaned = cleanup_temp_files(&path)?;
                if cleaned > 0 {
                    warn!(dir = %path.display(), cleaned, "Removed interrupted read-model writes");
                }
            }
        }

        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    fn type_dir(&self, read_model_type: &str) -> PathBuf {
        self.root.join(path_segment::encode(read_model_type))
    }

    fn record_path(&self, read_model_type: &str, id: &str) -> PathBuf {
        self.type_dir(read_model_type)
            .join(format!("{}.json", path_segment::encode(id)))
    }

    fn read_record(path: &Path) -> Result<Option<ReadModelRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Decoded ids of one type, ascending
    fn ids(&self, read_model_type: &str) -> Result<Vec<String>> {
        let dir = self.type_dir(read_model_type);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(path_segment::decode)
            {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "Ignoring record with undecodable name"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl ReadModelStore for FileReadModelStore {
    fn fetch(&self, read_model_type: &str, id: &str) -> Result<Option<ReadModelRecord>> {
        Self::read_record(&self.record_path(read_model_type, id))
    }

    fn store(&self, record: &ReadModelRecord) -> Result<u64> {
        let lock_key = (record.type_name.clone(), record.id.clone());
        self.locks.with_lock(&lock_key, || {
            let path = self.record_path(&record.type_name, &record.id);
            let actual = Self::read_record(&path)?.map_or(0, |r| r.version);
            if actual != record.version {
                return Err(conflict(&record.type_name, &record.id, record.version, actual));
            }

            let mut stored = record.clone();
            stored.version = actual + 1;
            atomic_write(&path, &serde_json::to_string_pretty(&stored)?)?;

            debug!(read_model_type = %record.type_name, id = %record.id, version = stored.version, "Stored read model");
            Ok(stored.version)
        })
    }

    fn delete(&self, read_model_type: &str, id: &str, expected_version: u64) -> Result<()> {
        let lock_key = (read_model_type.to_string(), id.to_string());
        self.locks.with_lock(&lock_key, || {
            let path = self.record_path(read_model_type, id);
            let actual = Self::read_record(&path)?.map_or(0, |r| r.version);
            if actual != expected_version {
                return Err(conflict(read_model_type, id, expected_version, actual));
            }
            if actual > 0 {
                fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    fn scan(&self, read_model_type: &str) -> Result<Vec<ReadModelRecord>> {
        let mut records = Vec::new();
        for id in self.ids(read_model_type)? {
            // Deleted since the directory was listed
            if let Some(record) = self.fetch(read_model_type, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn list_ids(
        &self,
        read_model_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .ids(read_model_type)?
            .into_iter()
            .filter(|id| after.map_or(true, |cursor| id.as_str() > cursor))
            .take(limit)
            .collect())
    }
}
