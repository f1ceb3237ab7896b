//! Archive error types.

use afs_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Reading from or writing to the storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The directory is not a node archive
    #[error("Invalid archive layout at {path}: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },
}

impl ArchiveError {
    pub(crate) fn layout(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ArchiveError::InvalidLayout {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
