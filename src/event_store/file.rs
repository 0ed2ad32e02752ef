//! File-backed event log
//!
//! Each partition is one JSONL file, `events/<entityType>/<entityID>.jsonl`,
//! where every line is a `kind`-tagged [`StoredRecord`]. Appends are written
//! in one call and fsynced before they are acknowledged.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::MaterializerConfig;
use crate::error::{Error, Result};
use crate::types::{EntityKey, Event, NewEvent, Snapshot, StoredRecord};
use crate::utils::{append_line, append_lines, path_segment};

use super::store::{check_snapshot, EventLog, Partition, PartitionTail};

/// Event log persisted as one JSONL file per partition
pub struct FileEventLog {
    events_dir: PathBuf,
    /// Cached tail per partition; the mutex also serializes writers of that file
    tails: RwLock<HashMap<EntityKey, Arc<Mutex<Option<PartitionTail>>>>>,
}

impl FileEventLog {
    /// Open (or create) the log under `config.events_dir()`
    pub fn open(config: &MaterializerConfig) -> Result<Self> {
        Self::with_dir(config.events_dir())
    }

    /// Open (or create) the log in an explicit directory
    pub fn with_dir<P: AsRef<Path>>(events_dir: P) -> Result<Self> {
        let events_dir = events_dir.as_ref().to_path_buf();
        fs::create_dir_all(&events_dir)?;
        Ok(Self {
            events_dir,
            tails: RwLock::new(HashMap::new()),
        })
    }

    fn type_dir(&self, entity_type: &str) -> PathBuf {
        self.events_dir.join(path_segment::encode(entity_type))
    }

    fn partition_path(&self, key: &EntityKey) -> PathBuf {
        self.type_dir(&key.entity_type)
            .join(format!("{}.jsonl", path_segment::encode(&key.entity_id)))
    }

    fn tail_slot(&self, key: &EntityKey) -> Arc<Mutex<Option<PartitionTail>>> {
        if let Some(slot) = self.tails.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.tails.write().entry(key.clone()).or_default())
    }

    /// Run `f` with the partition's current tail while holding its write lock
    fn with_tail<R>(
        &self,
        key: &EntityKey,
        f: impl FnOnce(&Path, PartitionTail) -> Result<(R, Option<PartitionTail>)>,
    ) -> Result<R> {
        let slot = self.tail_slot(key);
        let mut cached = slot.lock();
        let path = self.partition_path(key);

        let tail = match *cached {
            Some(tail) => tail,
            None => {
                repair_torn_tail(&path)?;
                let tail = self.load_partition(key)?.tail();
                *cached = Some(tail);
                tail
            }
        };

        let (result, new_tail) = f(&path, tail)?;
        if let Some(new_tail) = new_tail {
            *cached = Some(new_tail);
        }
        Ok(result)
    }

    /// Load every record of a partition
    ///
    /// An unparsable *final* line is an append that never completed and is
    /// skipped with a warning; any other bad line is corruption and fails.
    fn load_partition(&self, key: &EntityKey) -> Result<Partition> {
        let path = self.partition_path(key);
        if !path.exists() {
            return Ok(Partition::default());
        }

        let file = File::open(&path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;
        let last_index = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match StoredRecord::from_json_line(line) {
                Ok(record) => records.push(record),
                Err(e) if Some(index) == last_index => {
                    warn!(
                        partition = %key,
                        line = index + 1,
                        error = %e,
                        "Skipping incomplete trailing record"
                    );
                }
                Err(e) => return Err(Error::Serialization(e)),
            }
        }

        Ok(Partition::new(records))
    }
}

/// Truncate a partition file back to its last complete line
fn repair_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = fs::read(path)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "Truncating incomplete trailing record"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

impl EventLog for FileEventLog {
    fn append(
        &self,
        key: &EntityKey,
        events: Vec<NewEvent>,
        expected_version: Option<u64>,
    ) -> Result<Vec<Event>> {
        self.with_tail(key, |path, tail| {
            let (stamped, next) = tail.stamp(key, events, expected_version)?;
            if stamped.is_empty() {
                return Ok((stamped, None));
            }

            let lines = stamped
                .iter()
                .map(|e| StoredRecord::Event(e.clone()).to_json_line())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            append_lines(path, lines.iter().map(String::as_str))?;

            debug!(%key, count = stamped.len(), "Appended events");
            Ok((stamped, Some(next)))
        })
    }

    fn events_after(&self, key: &EntityKey, after: Option<DateTime<Utc>>) -> Result<Vec<Event>> {
        Ok(self.load_partition(key)?.events_after(after))
    }

    fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<Snapshot>> {
        Ok(self.load_partition(key)?.latest_snapshot())
    }

    fn store_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let key = snapshot.key();
        self.with_tail(&key, |path, tail| {
            check_snapshot(snapshot, &tail)?;
            let line = StoredRecord::Snapshot(snapshot.clone()).to_json_line()?;
            append_line(path, &line)?;
            Ok(((), None))
        })
    }

    fn stream_version(&self, key: &EntityKey) -> Result<u64> {
        self.with_tail(key, |_, tail| Ok((tail.sequence, None)))
    }

    fn entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let dir = self.type_dir(entity_type);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "jsonl") {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(path_segment::decode);
            match decoded {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "Ignoring partition with undecodable name"),
            }
        }

        ids.sort();
        Ok(ids
            .into_iter()
            .filter(|id| after.map_or(true, |cursor| id.as_str() > cursor))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_log() -> (FileEventLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = MaterializerConfig::new(temp_dir.path());
        let log = FileEventLog::open(&config).unwrap();
        (log, temp_dir)
    }

    #[test]
    fn test_append_and_reload() {
        let (log, temp_dir) = create_test_log();
        let key = EntityKey::new("Post", "p/1");

        log.append(&key, vec![NewEvent::new("PostCreated", json!({"title": "A"}))], None)
            .unwrap();
        log.append(&key, vec![NewEvent::new("PostRenamed", json!({"title": "B"}))], Some(1))
            .unwrap();

        // A fresh instance sees the same partition from disk.
        let reopened = FileEventLog::with_dir(temp_dir.path().join("events")).unwrap();
        let events = reopened.events_after(&key, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["title"], "A");
        assert_eq!(reopened.stream_version(&key).unwrap(), 2);
        assert_eq!(reopened.entity_ids("Post", None, 10).unwrap(), vec!["p/1"]);
    }

    #[test]
    fn test_snapshot_lines_share_the_partition() {
        let (log, _temp_dir) = create_test_log();
        let key = EntityKey::new("Post", "p-1");
        let events = log
            .append(&key, vec![NewEvent::new("PostCreated", json!({"title": "A"}))], None)
            .unwrap();

        let snapshot = Snapshot {
            entity_type_name: "Post".to_string(),
            entity_id: "p-1".to_string(),
            version: 1,
            sequence: 1,
            created_at: events[0].created_at,
            snapshotted_at: Utc::now(),
            state: json!({"title": "A"}),
        };
        log.store_snapshot(&snapshot).unwrap();

        let content = fs::read_to_string(log.partition_path(&key)).unwrap();
        assert!(content.contains("\"kind\":\"event\""));
        assert!(content.contains("\"kind\":\"snapshot\""));
        assert_eq!(log.latest_snapshot(&key).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_torn_trailing_line_is_repaired() {
        let (log, temp_dir) = create_test_log();
        let key = EntityKey::new("Post", "p-1");
        log.append(&key, vec![NewEvent::new("PostCreated", json!({}))], None)
            .unwrap();

        let path = log.partition_path(&key);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"kind\":\"event\",\"typeNa").unwrap();
        drop(file);

        let reopened = FileEventLog::with_dir(temp_dir.path().join("events")).unwrap();
        assert_eq!(reopened.events_after(&key, None).unwrap().len(), 1);

        reopened
            .append(&key, vec![NewEvent::new("PostRenamed", json!({}))], Some(1))
            .unwrap();
        assert_eq!(reopened.events_after(&key, None).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_fails() {
        let (log, _temp_dir) = create_test_log();
        let key = EntityKey::new("Post", "p-1");
        let path = log.partition_path(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json\n{}\n").unwrap();

        assert!(matches!(
            log.events_after(&key, None),
            Err(Error::Serialization(_))
        ));
    }
}
