//! Event Log for Event Sourcing
//!
//! The log owns durability. It is append-only and partitioned by
//! `(entityType, entityID)`; each partition holds the entity's events and
//! snapshots, ordered by `created_at`.
//!
//! - `EventLog`: the storage contract used by the reducer and the materializer
//! - `InMemoryEventLog`: partitions in a `BTreeMap`
//! - `FileEventLog`: one JSONL file per partition
//!
//! # Layout
//!
//! ```text
//! events/
//! ├── Post/
//! │   ├── p-1.jsonl   {"kind":"event",...}
//! │   │               {"kind":"event",...}
//! │   │               {"kind":"snapshot",...}
//! │   └── p-2.jsonl
//! └── User/
//!     └── u-1.jsonl
//! ```

mod file;
mod memory;
mod store;

pub use file::FileEventLog;
pub use memory::InMemoryEventLog;
pub use store::{EventLog, Partition, PartitionTail};
