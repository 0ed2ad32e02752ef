//! Data types for the materialization core
//!
//! This module contains the records that flow between the event log, the
//! reducer, the projector and the read-model stores.

mod entity;
mod event;
mod read_model;

pub use entity::{EntityKey, EntityState};
pub use event::{Event, NewEvent, Snapshot, StoredRecord};
pub use read_model::{lookup_path, Page, ReadModelRecord, SortBy, SortDirection};
