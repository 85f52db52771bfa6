//! Error types for the counts store.

use crate::counts::{CounterKey, Generation};
use crate::types::{NodeId, RelationshipId, TransactionId};
use thiserror::Error;

/// Main error type for counts store and database operations.
#[derive(Debug, Error)]
pub enum CountsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Counts store generation {generation} is corrupt: {reason}")]
    CorruptGeneration {
        generation: Generation,
        reason: String,
    },

    #[error("Count for {key} would become negative ({current} {delta:+})")]
    NegativeCount {
        key: CounterKey,
        current: i64,
        delta: i64,
    },

    #[error("Count for {key} overflowed")]
    CountOverflow { key: CounterKey },

    #[error("Counts store rebuild failed: {source}")]
    RebuildFailure {
        #[source]
        source: Box<CountsError>,
    },

    #[error("Out of order commit: {got} applied after {last}")]
    OutOfOrderCommit {
        last: TransactionId,
        got: TransactionId,
    },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Database is locked by another process")]
    Locked,

    #[error("Database not initialized")]
    NotInitialized,

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Relationship not found: {0}")]
    RelationshipNotFound(RelationshipId),

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CountsError {
    /// Wrap a scan error as a rebuild failure.
    pub fn rebuild_failure(source: CountsError) -> Self {
        CountsError::RebuildFailure {
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for CountsError {
    fn from(e: serde_json::Error) -> Self {
        CountsError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CountsError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CountsError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CountsError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CountsError::Deserialization(e.to_string())
    }
}

/// Result type for counts store operations.
pub type Result<T> = std::result::Result<T, CountsError>;
