//! Event bus and event log error types.

use thiserror::Error;

/// Errors that can occur while recording or replaying events
#[derive(Error, Debug)]
pub enum EventsError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventsError {
    fn from(err: serde_json::Error) -> Self {
        EventsError::Serialization(err.to_string())
    }
}
