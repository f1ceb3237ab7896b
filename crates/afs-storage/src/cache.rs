//! Non-authoritative per-node cache.
//!
//! Entries live in memory for the lifetime of the storage instance and
//! are bounded by an LRU. Nothing here is flushed; losing an entry only
//! costs recomputation.

use lru::LruCache;
use parking_lot::Mutex;
use std::io::Cursor;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::blob::DataWriter;
use crate::db::AppStorage;
use crate::error::StorageError;

type CacheKey = (String, String);

pub(crate) struct NodeCache {
    entries: Mutex<LruCache<CacheKey, Vec<u8>>>,
}

impl NodeCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get(&self, node_id: &str, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .get(&(node_id.to_string(), key.to_string()))
            .cloned()
    }

    pub(crate) fn put(&self, node_id: &str, key: &str, bytes: Vec<u8>) {
        self.entries
            .lock()
            .put((node_id.to_string(), key.to_string()), bytes);
    }

    pub(crate) fn invalidate(&self, node_id: &str, key: &str) -> bool {
        self.entries
            .lock()
            .pop(&(node_id.to_string(), key.to_string()))
            .is_some()
    }

    pub(crate) fn invalidate_node(&self, node_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let keys: Vec<CacheKey> = entries
            .iter()
            .filter(|((node, _), _)| node == node_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        keys.len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl AppStorage {
    /// Cached bytes for `(node_id, key)`, if present.
    pub fn read_from_cache(&self, node_id: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        Ok(self.cache.get(node_id, key))
    }

    /// Reader over a cache entry, or `None` if absent.
    pub fn open_cache_read(&self, node_id: &str, key: &str) -> Result<Option<Cursor<Vec<u8>>>, StorageError> {
        Ok(self.read_from_cache(node_id, key)?.map(Cursor::new))
    }

    /// Stream bytes into the cache. The entry appears on `commit`.
    pub fn open_cache_write(&self, node_id: &str, key: &str) -> Result<DataWriter<'_>, StorageError> {
        self.check_open()?;
        afs_types::validate_name("cache key", key)?;
        self.require_node(node_id)?;
        Ok(DataWriter::cache(self, node_id, key))
    }

    pub fn write_to_cache(&self, node_id: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        afs_types::validate_name("cache key", key)?;
        self.commit_cache_entry(node_id, key, bytes.to_vec())
    }

    /// Insert under the shared tree lock so a concurrent `delete_node`
    /// either sees the entry and drops it or makes this call fail.
    pub(crate) fn commit_cache_entry(&self, node_id: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        self.require_node(node_id)?;
        self.cache.put(node_id, key, bytes);
        Ok(())
    }

    /// Drop one cache entry. Missing entries are ignored.
    pub fn invalidate_cache(&self, node_id: &str, key: &str) -> Result<(), StorageError> {
        self.check_open()?;
        self.cache.invalidate(node_id, key);
        Ok(())
    }

    /// Drop every cache entry of the instance.
    pub fn invalidate_all_cache(&self) -> Result<(), StorageError> {
        self.check_open()?;
        let count = self.cache.clear();
        debug!(count, "Invalidated cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::create_test_storage;
    use crate::error::ErrorKind;
    use afs_types::{
        DoubleDataChunk, NodeGenericMetadata, TimeSeriesDataType, TimeSeriesIndex,
        TimeSeriesMetadata,
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn test_node_cache_basic() {
        let cache = NodeCache::new(10);
        cache.put("n1", "k", b"v".to_vec());
        cache.put("n1", "k2", b"v2".to_vec());
        cache.put("n2", "k", b"w".to_vec());

        assert_eq!(cache.get("n1", "k"), Some(b"v".to_vec()));
        assert!(cache.invalidate("n1", "k"));
        assert!(!cache.invalidate("n1", "k"));
        assert_eq!(cache.invalidate_node("n1"), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.get("n2", "k"), None);
    }

    #[test]
    fn test_node_cache_evicts_least_recent() {
        let cache = NodeCache::new(2);
        cache.put("n", "a", vec![1]);
        cache.put("n", "b", vec![2]);
        cache.get("n", "a");
        cache.put("n", "c", vec![3]);
        assert!(cache.get("n", "b").is_none());
        assert!(cache.get("n", "a").is_some());
    }

    #[test]
    fn test_invalidate_all_leaves_durable_state() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let a = storage
            .create_node(&root.id, "a", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();
        let b = storage
            .create_node(&root.id, "b", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();

        storage.write_data(&a.id, "payload", b"bytes").unwrap();
        storage.set_int_attribute(&b.id, "i", Some(4)).unwrap();
        let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        let index = TimeSeriesIndex::regular(start, start + Duration::minutes(30), Duration::minutes(15)).unwrap();
        storage
            .create_time_series(
                &b.id,
                TimeSeriesMetadata::new("ts", TimeSeriesDataType::Double, BTreeMap::new(), index),
            )
            .unwrap();
        storage
            .add_double_chunks(&b.id, 0, "ts", vec![DoubleDataChunk::new(0, vec![1.0, 2.0, 3.0])])
            .unwrap();

        for node in [&root, &a, &b] {
            storage.write_to_cache(&node.id, "k1", b"x").unwrap();
            storage.write_to_cache(&node.id, "k2", b"y").unwrap();
        }
        assert_eq!(storage.stats().unwrap().cache_entry_count, 6);

        storage.invalidate_all_cache().unwrap();
        for node in [&root, &a, &b] {
            assert!(storage.read_from_cache(&node.id, "k1").unwrap().is_none());
            assert!(storage.read_from_cache(&node.id, "k2").unwrap().is_none());
        }
        assert_eq!(storage.stats().unwrap().cache_entry_count, 0);

        assert_eq!(storage.read_data(&a.id, "payload").unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(storage.get_int_attribute(&b.id, "i").unwrap(), Some(4));
        assert_eq!(
            storage.read_double(&b.id, &["ts"], 0).unwrap()["ts"],
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_cache_write_racing_delete_leaves_no_entry() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();

        for round in 0..20 {
            let node = storage
                .create_node(&root.id, &format!("n{}", round), "data", "", 0, NodeGenericMetadata::default())
                .unwrap();
            std::thread::scope(|scope| {
                let writer = scope.spawn(|| {
                    let mut outcomes = Vec::new();
                    for i in 0..50 {
                        outcomes.push(storage.write_to_cache(&node.id, &format!("k{}", i), b"v"));
                    }
                    outcomes
                });
                storage.delete_node(&node.id).unwrap();
                for outcome in writer.join().unwrap() {
                    if let Err(e) = outcome {
                        assert_eq!(e.kind(), ErrorKind::NotFound);
                    }
                }
            });
            for i in 0..50 {
                assert!(storage
                    .read_from_cache(&node.id, &format!("k{}", i))
                    .unwrap()
                    .is_none());
            }
        }
        assert_eq!(storage.stats().unwrap().cache_entry_count, 0);
    }
}
