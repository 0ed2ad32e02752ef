//! Error taxonomy for the materialization core
//!
//! Every fallible operation in the crate returns [`Result`]. Variants map
//! one-to-one onto the failure classes collaborators need to tell apart:
//! absent data, optimistic-write conflicts, broken reducers, missing
//! migration paths, caller bugs in filters, and transient storage failures.

use std::io;

/// Result type for materialization operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user-supplied reducer, projection and migration functions
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the materialization core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entity or read-model record is absent.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Optimistic write conflict; the caller should retry the whole command.
    #[error("concurrency conflict on {key}: expected version {expected}, found {actual}")]
    Concurrency {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// A reducer function failed; nothing was persisted for this reduction.
    #[error("reduction failed for {key} at event {event_type} (sequence {sequence}): {reason}")]
    Reduction {
        key: String,
        event_type: String,
        sequence: u64,
        reason: String,
    },

    /// No migration rule bridges the stored version to the latest one.
    #[error("no migration path for {type_name} from version {from} to {to}")]
    MigrationPath {
        type_name: String,
        from: u32,
        to: u32,
    },

    /// A filter expression used an operator the compiler does not know.
    #[error("unsupported filter operator '{operator}' on property '{property}'")]
    UnsupportedFilterOperator { operator: String, property: String },

    /// A filter expression is structurally malformed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A projection function failed; none of its fields were written.
    #[error("projection {projection} failed for {read_model_type}/{read_model_id}: {reason}")]
    Projection {
        projection: String,
        read_model_type: String,
        read_model_id: String,
        reason: String,
    },

    /// A registry was rejected while being built.
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),

    /// I/O failure in the event log or read-model store. Retryable.
    #[error("transient storage error: {0}")]
    StorageTransient(#[from] io::Error),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `NotFound` error for an entity key
    pub fn entity_not_found(entity_type: &str, entity_id: &str) -> Self {
        Error::NotFound {
            kind: "entity",
            key: format!("{}/{}", entity_type, entity_id),
        }
    }

    /// Build a `NotFound` error for a read-model record
    pub fn read_model_not_found(read_model_type: &str, id: &str) -> Self {
        Error::NotFound {
            kind: "read model",
            key: format!("{}/{}", read_model_type, id),
        }
    }

    /// Whether the collaborator boundary may retry the failed operation.
    ///
    /// Only optimistic-write conflicts and storage failures qualify; every
    /// other variant indicates a caller or deployment bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Concurrency { .. } | Error::StorageTransient(_))
    }

    /// Whether this error means the requested data does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conflict = Error::Concurrency {
            key: "Post/1".to_string(),
            expected: 1,
            actual: 2,
        };
        let io_err = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        let gap = Error::MigrationPath {
            type_name: "Post".to_string(),
            from: 1,
            to: 3,
        };

        assert!(conflict.is_retryable());
        assert!(io_err.is_retryable());
        assert!(!gap.is_retryable());
        assert!(!Error::entity_not_found("Post", "1").is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::UnsupportedFilterOperator {
            operator: "like".to_string(),
            property: "name".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported filter operator 'like' on property 'name'"
        );
        assert_eq!(
            Error::entity_not_found("Post", "42").to_string(),
            "entity not found: Post/42"
        );
    }
}
