//! Configuration for the materialization core
//!
//! Values come from [`Default`], a JSON file, or `MATERIALIZER_*`
//! environment variables layered over the defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_DATA_DIR: &str = "MATERIALIZER_DATA_DIR";
const ENV_SNAPSHOT_THRESHOLD: &str = "MATERIALIZER_SNAPSHOT_THRESHOLD";
const ENV_PROJECTION_RETRIES: &str = "MATERIALIZER_PROJECTION_RETRIES";
const ENV_MIGRATION_PAGE_SIZE: &str = "MATERIALIZER_MIGRATION_PAGE_SIZE";
const ENV_CHANGE_FEED_CAPACITY: &str = "MATERIALIZER_CHANGE_FEED_CAPACITY";

/// Runtime configuration shared by the stores, the reducer and the projector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializerConfig {
    /// Root directory of the file-backed stores
    pub data_dir: PathBuf,
    /// Minimum number of folded events before a new snapshot is written
    pub snapshot_threshold: usize,
    /// Compare-and-set attempts per projection before surfacing a conflict
    pub projection_max_retries: usize,
    /// Page size used by data-migration jobs when enumerating ids
    pub migration_page_size: usize,
    /// Buffered notifications per change-feed subscriber
    pub change_feed_capacity: usize,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            snapshot_threshold: 1,
            projection_max_retries: 8,
            migration_page_size: 100,
            change_feed_capacity: 1024,
        }
    }
}

impl MaterializerConfig {
    /// Create config with a custom data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load defaults overridden by `MATERIALIZER_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = env::var(ENV_DATA_DIR) {
            let path = PathBuf::from(dir);
            config.data_dir = if path.is_absolute() {
                path
            } else {
                env::current_dir()?.join(path)
            };
        }
        if let Some(v) = parse_env(ENV_SNAPSHOT_THRESHOLD)? {
            config.snapshot_threshold = v;
        }
        if let Some(v) = parse_env(ENV_PROJECTION_RETRIES)? {
            config.projection_max_retries = v;
        }
        if let Some(v) = parse_env(ENV_MIGRATION_PAGE_SIZE)? {
            config.migration_page_size = v;
        }
        if let Some(v) = parse_env(ENV_CHANGE_FEED_CAPACITY)? {
            config.change_feed_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from a JSON file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Err(Error::Config("snapshot_threshold must be at least 1".into()));
        }
        if self.projection_max_retries == 0 {
            return Err(Error::Config(
                "projection_max_retries must be at least 1".into(),
            ));
        }
        if self.migration_page_size == 0 {
            return Err(Error::Config("migration_page_size must be at least 1".into()));
        }
        if self.change_feed_capacity == 0 {
            return Err(Error::Config("change_feed_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding one JSONL file per event partition
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    /// Directory holding one sub-directory per read-model type
    pub fn read_models_dir(&self) -> PathBuf {
        self.data_dir.join("read_models")
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = MaterializerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.snapshot_threshold, 1);
        assert_eq!(config.events_dir(), PathBuf::from("data").join("events"));
    }

    #[test]
    fn test_from_file_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("materializer.json");
        fs::write(&path, r#"{"snapshot_threshold": 10, "data_dir": "/tmp/mat"}"#).unwrap();

        let config = MaterializerConfig::from_file(&path).unwrap();
        assert_eq!(config.snapshot_threshold, 10);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/mat"));
        assert_eq!(config.projection_max_retries, 8);
    }

    #[test]
    fn test_from_file_rejects_zero_page_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, r#"{"migration_page_size": 0}"#).unwrap();

        let err = MaterializerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
