//! RocksDB wrapper for the application file system.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Node record access shared by the directory, graph and data modules
//! - Event emission after committed mutations
//! - Flush (the durability boundary) and statistics

use afs_events::{EventsBus, EventsStore, InMemoryEventsBus};
use afs_types::{NodeEvent, NodeInfo, Settings, StorageSettings};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::NodeCache;
use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_BLOBS, CF_DEPENDENCIES, CF_NODES, CF_TS_CHUNKS,
    CF_TS_METADATA,
};
use crate::error::StorageError;
use crate::locks::NodeLocks;

/// Stored form of a node: its info plus the state the storage owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeRecord {
    pub info: NodeInfo,
    pub parent_id: Option<String>,
    pub consistent: bool,
}

impl NodeRecord {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Main storage interface for the application file system
pub struct AppStorage {
    pub(crate) db: DB,
    pub(crate) file_system_name: String,
    pub(crate) bus: Arc<dyn EventsBus>,
    pub(crate) locks: NodeLocks,
    /// Held exclusively by moves and deletes, shared by everything else
    pub(crate) tree_lock: RwLock<()>,
    pub(crate) cache: NodeCache,
    closed: AtomicBool,
}

impl AppStorage {
    /// Open storage at the given path, creating it if necessary.
    pub fn open(
        path: &Path,
        file_system_name: &str,
        bus: Arc<dyn EventsBus>,
    ) -> Result<Self, StorageError> {
        Self::open_with(path, file_system_name, bus, &StorageSettings::default())
    }

    /// Open storage with explicit engine settings.
    pub fn open_with(
        path: &Path,
        file_system_name: &str,
        bus: Arc<dyn EventsBus>,
        settings: &StorageSettings,
    ) -> Result<Self, StorageError> {
        info!(file_system = %file_system_name, "Opening storage at {:?}", path);
        settings.validate().map_err(StorageError::InvalidOperation)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        Ok(Self {
            db,
            file_system_name: file_system_name.to_string(),
            bus,
            locks: NodeLocks::new(settings.lock_stripes),
            tree_lock: RwLock::new(()),
            cache: NodeCache::new(settings.cache_capacity),
            closed: AtomicBool::new(false),
        })
    }

    /// Open storage and the bus described by `settings`.
    ///
    /// With `events.log_enabled` every event is also recorded in a durable
    /// `EventsStore` at `events.log_path`.
    pub fn open_with_settings(settings: &Settings) -> Result<Self, StorageError> {
        settings.validate()?;
        let bus: Arc<dyn EventsBus> = if settings.events.log_enabled {
            Arc::new(EventsStore::open(
                Path::new(&settings.events.log_path),
                &settings.events,
            )?)
        } else {
            Arc::new(InMemoryEventsBus::from_settings(&settings.events))
        };
        Self::open_with(
            Path::new(&settings.db_path),
            &settings.file_system_name,
            bus,
            &settings.storage,
        )
    }

    pub fn file_system_name(&self) -> &str {
        &self.file_system_name
    }

    /// Bus the storage publishes on; subscribe here to observe mutations.
    pub fn events_bus(&self) -> &Arc<dyn EventsBus> {
        &self.bus
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    pub(crate) fn get_record(&self, node_id: &str) -> Result<Option<NodeRecord>, StorageError> {
        let cf = self.cf(CF_NODES)?;
        match self.db.get_cf(cf, node_id.as_bytes())? {
            Some(bytes) => Ok(Some(NodeRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn require_record(&self, node_id: &str) -> Result<NodeRecord, StorageError> {
        self.get_record(node_id)?
            .ok_or_else(|| StorageError::node_not_found(node_id))
    }

    pub(crate) fn require_node(&self, node_id: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_NODES)?;
        if self.db.get_pinned_cf(cf, node_id.as_bytes())?.is_none() {
            return Err(StorageError::node_not_found(node_id));
        }
        Ok(())
    }

    pub(crate) fn put_record(&self, record: &NodeRecord) -> Result<(), StorageError> {
        let cf = self.cf(CF_NODES)?;
        self.db
            .put_cf(cf, record.info.id.as_bytes(), record.to_bytes()?)?;
        Ok(())
    }

    /// All (key, value) pairs under `prefix`, in key order.
    pub(crate) fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    /// Publish an event for a committed mutation.
    ///
    /// The mutation already happened, so a failing bus is logged rather
    /// than reported to the caller.
    pub(crate) fn emit(&self, event: NodeEvent) {
        let topic = event.default_topic();
        if let Err(e) = self.bus.push_event(event, topic) {
            error!(error = %e, topic, "Failed to publish event");
        }
    }

    /// Make every completed mutation durable.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.flush_all()
    }

    fn flush_all(&self) -> Result<(), StorageError> {
        self.db.flush_wal(true)?;
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        self.bus.flush()?;
        debug!(file_system = %self.file_system_name, "Flushed storage");
        Ok(())
    }

    /// Flush, drop the cache and refuse further operations.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _tree = self.tree_lock.write();
        let result = self.flush_all();
        self.cache.clear();
        info!(file_system = %self.file_system_name, "Closed storage");
        result
    }

    /// Get database statistics.
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        self.check_open()?;
        Ok(StorageStats {
            node_count: self.count_cf_entries(CF_NODES)?,
            blob_count: self.count_cf_entries(CF_BLOBS)?,
            time_series_count: self.count_cf_entries(CF_TS_METADATA)?,
            chunk_count: self.count_cf_entries(CF_TS_CHUNKS)?,
            dependency_count: self.count_cf_entries(CF_DEPENDENCIES)?,
            cache_entry_count: self.cache.len() as u64,
        })
    }

    fn count_cf_entries(&self, cf_name: &str) -> Result<u64, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// Statistics about the storage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub node_count: u64,
    pub blob_count: u64,
    pub time_series_count: u64,
    pub chunk_count: u64,
    pub dependency_count: u64,
    pub cache_entry_count: u64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn create_test_storage() -> (AppStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let bus: Arc<dyn EventsBus> = Arc::new(InMemoryEventsBus::default());
        let storage = AppStorage::open(temp_dir.path(), "test-fs", bus).unwrap();
        (storage, temp_dir)
    }
}
