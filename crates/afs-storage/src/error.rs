//! Storage layer error types.

use afs_events::EventsError;
use afs_types::{AfsError, ChunkError};
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Node, series or edge endpoint does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name clash or overlapping time-series data
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request violates a structural rule
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Event bus or event log failure
    #[error("Events error: {0}")]
    Events(#[from] EventsError),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The storage instance was closed
    #[error("Storage is closed")]
    Closed,
}

/// Coarse classification of a `StorageError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidOperation,
    Io,
    Closed,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Conflict,
            StorageError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            StorageError::Closed => ErrorKind::Closed,
            StorageError::Io(_)
            | StorageError::RocksDb(_)
            | StorageError::Events(_)
            | StorageError::ColumnFamilyNotFound(_)
            | StorageError::Key(_)
            | StorageError::Serialization(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn node_not_found(node_id: &str) -> Self {
        StorageError::NotFound(format!("node {}", node_id))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<AfsError> for StorageError {
    fn from(err: AfsError) -> Self {
        match err {
            AfsError::Serialization(e) => StorageError::Serialization(e.to_string()),
            other => StorageError::InvalidOperation(other.to_string()),
        }
    }
}

impl From<ChunkError> for StorageError {
    fn from(err: ChunkError) -> Self {
        if err.is_overlap() {
            StorageError::Conflict(err.to_string())
        } else {
            StorageError::InvalidOperation(err.to_string())
        }
    }
}
