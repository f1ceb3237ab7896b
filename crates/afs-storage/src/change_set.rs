//! Batched time-series mutations.
//!
//! A change set is applied change by change, then flushed once. A failing
//! change stops the batch: the changes before it stay applied.

use afs_types::{DoubleDataChunk, StringDataChunk, TimeSeriesMetadata};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::db::AppStorage;
use crate::error::StorageError;

/// One time-series mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageChange {
    TimeSeriesCreation {
        node_id: String,
        metadata: TimeSeriesMetadata,
    },
    DoubleChunksAddition {
        node_id: String,
        version: u32,
        name: String,
        chunks: Vec<DoubleDataChunk>,
    },
    StringChunksAddition {
        node_id: String,
        version: u32,
        name: String,
        chunks: Vec<StringDataChunk>,
    },
}

/// Ordered list of changes submitted together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageChangeSet {
    pub changes: Vec<StorageChange>,
}

impl StorageChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: StorageChange) -> &mut Self {
        self.changes.push(change);
        self
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl AppStorage {
    /// Apply every change in order, then flush.
    #[instrument(skip(self, change_set), fields(changes = change_set.len()))]
    pub fn apply_change_set(&self, change_set: StorageChangeSet) -> Result<(), StorageError> {
        for change in change_set.changes {
            match change {
                StorageChange::TimeSeriesCreation { node_id, metadata } => {
                    self.create_time_series(&node_id, metadata)?
                }
                StorageChange::DoubleChunksAddition {
                    node_id,
                    version,
                    name,
                    chunks,
                } => self.add_double_chunks(&node_id, version, &name, chunks)?,
                StorageChange::StringChunksAddition {
                    node_id,
                    version,
                    name,
                    chunks,
                } => self.add_string_chunks(&node_id, version, &name, chunks)?,
            }
        }
        self.flush()?;
        info!("Applied change set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::create_test_storage;
    use crate::error::ErrorKind;
    use afs_types::{NodeGenericMetadata, TimeSeriesDataType, TimeSeriesIndex};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn hourly_metadata(name: &str) -> TimeSeriesMetadata {
        let start = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let index =
            TimeSeriesIndex::regular(start, start + Duration::hours(3), Duration::hours(1)).unwrap();
        TimeSeriesMetadata::new(name, TimeSeriesDataType::Double, BTreeMap::new(), index)
    }

    #[test]
    fn test_apply_change_set() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let node = storage
            .create_node(&root.id, "n", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();

        let mut set = StorageChangeSet::new();
        set.push(StorageChange::TimeSeriesCreation {
            node_id: node.id.clone(),
            metadata: hourly_metadata("load"),
        })
        .push(StorageChange::DoubleChunksAddition {
            node_id: node.id.clone(),
            version: 0,
            name: "load".to_string(),
            chunks: vec![DoubleDataChunk::new(0, vec![1.0, 2.0, 3.0, 4.0])],
        });
        assert_eq!(set.len(), 2);
        storage.apply_change_set(set).unwrap();

        let values = storage.read_double(&node.id, &["load"], 0).unwrap();
        assert_eq!(values["load"], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_failing_change_stops_batch() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();

        let mut set = StorageChangeSet::new();
        set.push(StorageChange::TimeSeriesCreation {
            node_id: root.id.clone(),
            metadata: hourly_metadata("a"),
        })
        .push(StorageChange::DoubleChunksAddition {
            node_id: root.id.clone(),
            version: 0,
            name: "missing".to_string(),
            chunks: vec![DoubleDataChunk::new(0, vec![1.0])],
        })
        .push(StorageChange::TimeSeriesCreation {
            node_id: root.id.clone(),
            metadata: hourly_metadata("b"),
        });

        let err = storage.apply_change_set(set).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(storage.time_series_exists(&root.id, "a").unwrap());
        assert!(!storage.time_series_exists(&root.id, "b").unwrap());
    }

    #[test]
    fn test_change_set_json() {
        let mut set = StorageChangeSet::new();
        set.push(StorageChange::StringChunksAddition {
            node_id: "n".to_string(),
            version: 2,
            name: "s".to_string(),
            chunks: vec![StringDataChunk::new(1, vec!["x".to_string()])],
        });
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["changes"][0]["type"], "string_chunks_addition");
        let decoded: StorageChangeSet = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, set);
    }
}
