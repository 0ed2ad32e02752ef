//! Utility functions and helpers
//!
//! Atomic file writes, timestamps, per-key locks and path encoding shared
//! by the stores and the materializer.

pub mod atomic;
pub mod keyed_lock;
pub mod path_segment;
pub mod time;

pub use atomic::{append_line, append_lines, atomic_write, atomic_write_with, cleanup_temp_files};
pub use keyed_lock::KeyedLocks;
pub use time::{next_timestamp, now};
