//! Schema Migration Resolver
//!
//! Stored payloads keep the schema version they were written with. Before
//! a payload reaches the reducer or a consumer it is upgraded, lazily and
//! in memory, to the latest version of its type by applying each
//! registered rule in increasing version order. Results are never written
//! back to the event log.
//!
//! Anything carrying a type name, a version and a payload implements
//! [`Migratable`]: events (keyed by event type), snapshots (keyed by entity
//! type), read-model records, and raw [`VersionedPayload`]s from tooling.

mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{Event, ReadModelRecord, Snapshot};

pub use registry::{MigrationFn, MigrationRegistry, MigrationRegistryBuilder, MigrationRule};

/// A record whose payload can be upgraded by the resolver
pub trait Migratable {
    /// Name the migration rules are registered under
    fn type_name(&self) -> &str;
    /// Schema version of the payload
    fn schema_version(&self) -> u32;
    /// Replace payload and version after a successful upgrade
    fn replace_payload(&mut self, version: u32, payload: Value) -> Result<()>;
    /// Move the payload out for upgrading
    fn take_payload(&mut self) -> Value;
}

impl MigrationRegistry {
    /// Upgrade a record to the latest version of its type
    ///
    /// Records already at the latest version are returned unchanged, so
    /// `migrate(migrate(r)) == migrate(r)`.
    pub fn migrate<R: Migratable>(&self, mut record: R) -> Result<R> {
        let from = record.schema_version();
        if from == self.latest_version(record.type_name()) {
            return Ok(record);
        }

        let type_name = record.type_name().to_string();
        let payload = record.take_payload();
        let (version, payload) = self.upgrade(&type_name, from, payload)?;
        trace!(type_name = %type_name, from, to = version, "Migrated payload");
        record.replace_payload(version, payload)?;
        Ok(record)
    }
}

/// A bare payload with its type and version, as inspected by tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedPayload {
    pub type_name: String,
    pub version: u32,
    pub payload: Value,
}

impl VersionedPayload {
    pub fn new(type_name: impl Into<String>, version: u32, payload: Value) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            payload,
        }
    }
}

impl Migratable for VersionedPayload {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn schema_version(&self) -> u32 {
        self.version
    }

    fn replace_payload(&mut self, version: u32, payload: Value) -> Result<()> {
        self.version = version;
        self.payload = payload;
        Ok(())
    }

    fn take_payload(&mut self) -> Value {
        self.payload.take()
    }
}

impl Migratable for Event {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn schema_version(&self) -> u32 {
        self.version
    }

    fn replace_payload(&mut self, version: u32, payload: Value) -> Result<()> {
        self.version = version;
        self.payload = payload;
        Ok(())
    }

    fn take_payload(&mut self) -> Value {
        self.payload.take()
    }
}

impl Migratable for Snapshot {
    fn type_name(&self) -> &str {
        &self.entity_type_name
    }

    fn schema_version(&self) -> u32 {
        self.version
    }

    fn replace_payload(&mut self, version: u32, payload: Value) -> Result<()> {
        self.version = version;
        self.state = payload;
        Ok(())
    }

    fn take_payload(&mut self) -> Value {
        self.state.take()
    }
}

impl Migratable for ReadModelRecord {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn replace_payload(&mut self, version: u32, payload: Value) -> Result<()> {
        match payload {
            Value::Object(fields) => {
                self.schema_version = version;
                self.fields = fields;
                Ok(())
            }
            other => Err(Error::InvalidRegistry(format!(
                "migration of {} to version {} produced a non-object payload: {}",
                self.type_name, version, other
            ))),
        }
    }

    fn take_payload(&mut self) -> Value {
        Value::Object(std::mem::take(&mut self.fields))
    }
}
