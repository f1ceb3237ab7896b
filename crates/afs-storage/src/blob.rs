//! Named binary payloads attached to nodes.
//!
//! Writes are buffered by a `DataWriter` and become visible atomically
//! on `commit`; a writer dropped without committing leaves the previous
//! payload untouched. The same writer streams cache entries.

use afs_types::{validate_name, NodeEvent};
use std::collections::BTreeSet;
use std::io::{self, Cursor, Write};
use tracing::debug;

use crate::column_families::CF_BLOBS;
use crate::db::AppStorage;
use crate::error::StorageError;
use crate::keys::{entry_key, entry_name, entry_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTarget {
    Blob,
    Cache,
}

/// Buffered writer for a blob or a cache entry.
pub struct DataWriter<'a> {
    storage: &'a AppStorage,
    node_id: String,
    name: String,
    target: WriteTarget,
    buffer: Vec<u8>,
}

impl<'a> DataWriter<'a> {
    pub(crate) fn blob(storage: &'a AppStorage, node_id: &str, name: &str) -> Self {
        Self::new(storage, node_id, name, WriteTarget::Blob)
    }

    pub(crate) fn cache(storage: &'a AppStorage, node_id: &str, key: &str) -> Self {
        Self::new(storage, node_id, key, WriteTarget::Cache)
    }

    fn new(storage: &'a AppStorage, node_id: &str, name: &str, target: WriteTarget) -> Self {
        Self {
            storage,
            node_id: node_id.to_string(),
            name: name.to_string(),
            target,
            buffer: Vec::new(),
        }
    }

    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Publish the buffered bytes, replacing any previous content.
    pub fn commit(self) -> Result<(), StorageError> {
        match self.target {
            WriteTarget::Blob => self
                .storage
                .put_blob(&self.node_id, &self.name, &self.buffer),
            WriteTarget::Cache => {
                self.storage
                    .commit_cache_entry(&self.node_id, &self.name, self.buffer)
            }
        }
    }
}

impl Write for DataWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AppStorage {
    /// Open a writer for the payload `name` of a node.
    pub fn open_write(&self, node_id: &str, name: &str) -> Result<DataWriter<'_>, StorageError> {
        self.check_open()?;
        validate_name("data", name)?;
        self.require_node(node_id)?;
        Ok(DataWriter::blob(self, node_id, name))
    }

    /// Replace the payload `name` of a node with `bytes`.
    pub fn write_data(&self, node_id: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_open()?;
        validate_name("data", name)?;
        self.put_blob(node_id, name, bytes)
    }

    pub(crate) fn put_blob(&self, node_id: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);
        self.require_node(node_id)?;

        let cf = self.cf(CF_BLOBS)?;
        self.db.put_cf(cf, entry_key(node_id, name), bytes)?;
        debug!(node_id, name, size = bytes.len(), "Stored data");
        self.emit(NodeEvent::NodeDataUpdated {
            id: node_id.to_string(),
            data_name: name.to_string(),
        });
        Ok(())
    }

    /// Payload bytes, or `None` if the node has no payload of that name.
    pub fn read_data(&self, node_id: &str, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let cf = self.cf(CF_BLOBS)?;
        Ok(self.db.get_cf(cf, entry_key(node_id, name))?)
    }

    /// Reader over a payload, or `None` if absent.
    pub fn open_read(&self, node_id: &str, name: &str) -> Result<Option<Cursor<Vec<u8>>>, StorageError> {
        Ok(self.read_data(node_id, name)?.map(Cursor::new))
    }

    pub fn data_exists(&self, node_id: &str, name: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let cf = self.cf(CF_BLOBS)?;
        Ok(self.db.get_pinned_cf(cf, entry_key(node_id, name))?.is_some())
    }

    pub fn list_data_names(&self, node_id: &str) -> Result<BTreeSet<String>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        self.scan_prefix(CF_BLOBS, &entry_prefix(node_id))?
            .into_iter()
            .map(|(key, _)| entry_name(&key))
            .collect()
    }

    /// Remove a payload. Returns false if there was nothing to remove.
    pub fn remove_data(&self, node_id: &str, name: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);
        self.require_node(node_id)?;

        let cf = self.cf(CF_BLOBS)?;
        let key = entry_key(node_id, name);
        if self.db.get_pinned_cf(cf, &key)?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, &key)?;
        debug!(node_id, name, "Removed data");
        self.emit(NodeEvent::NodeDataRemoved {
            id: node_id.to_string(),
            data_name: name.to_string(),
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_support::create_test_storage;
    use crate::error::ErrorKind;
    use afs_types::NodeGenericMetadata;
    use rand::RngCore;
    use std::io::{Read, Write};

    #[test]
    fn test_write_and_read_back() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let node = storage
            .create_node(&root.id, "n", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();

        let mut writer = storage.open_write(&node.id, "data").unwrap();
        writer.write_all(b"word1").unwrap();
        writer.write_all(b" word2").unwrap();
        // nothing visible before commit
        assert!(storage.read_data(&node.id, "data").unwrap().is_none());
        writer.commit().unwrap();

        let mut content = String::new();
        storage
            .open_read(&node.id, "data")
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "word1 word2");
        assert!(storage.data_exists(&node.id, "data").unwrap());
        assert!(!storage.data_exists(&node.id, "data2").unwrap());
    }

    #[test]
    fn test_uncommitted_writer_keeps_previous_payload() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let node = storage
            .create_node(&root.id, "n", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();
        storage.write_data(&node.id, "data", b"old").unwrap();

        {
            let mut writer = storage.open_write(&node.id, "data").unwrap();
            writer.write_all(b"new").unwrap();
        }
        assert_eq!(storage.read_data(&node.id, "data").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_list_and_remove() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let node = storage
            .create_node(&root.id, "n", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();
        let other = storage
            .create_node(&root.id, "n2", "data", "", 0, NodeGenericMetadata::default())
            .unwrap();
        for name in ["data", "data2", "data3"] {
            storage.write_data(&node.id, name, name.as_bytes()).unwrap();
        }
        storage.write_data(&other.id, "data", b"x").unwrap();

        let names: Vec<String> = storage.list_data_names(&node.id).unwrap().into_iter().collect();
        assert_eq!(names, vec!["data", "data2", "data3"]);

        assert!(storage.remove_data(&node.id, "data2").unwrap());
        assert!(!storage.remove_data(&node.id, "data2").unwrap());
        assert_eq!(storage.list_data_names(&node.id).unwrap().len(), 2);
        assert_eq!(storage.list_data_names(&other.id).unwrap().len(), 1);
    }

    #[test]
    fn test_large_random_payload() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        let mut payload = vec![0u8; 256 * 1024];
        rand::rng().fill_bytes(&mut payload);

        let mut writer = storage.open_write(&root.id, "big").unwrap();
        for chunk in payload.chunks(4096) {
            writer.write_all(chunk).unwrap();
        }
        assert_eq!(writer.len(), payload.len());
        writer.commit().unwrap();
        assert_eq!(storage.read_data(&root.id, "big").unwrap(), Some(payload));
    }

    #[test]
    fn test_missing_node_is_not_found() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(
            storage.write_data("missing", "d", b"x").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            storage.read_data("missing", "d").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(storage.open_write("missing", "d").is_err());
    }

    #[test]
    fn test_cache_roundtrip() {
        let (storage, _temp) = create_test_storage();
        let root = storage.create_root_if_absent("root", "folder").unwrap();
        assert!(storage.read_from_cache(&root.id, "k").unwrap().is_none());

        let mut writer = storage.open_cache_write(&root.id, "k").unwrap();
        writer.write_all(b"cached").unwrap();
        writer.commit().unwrap();
        let mut cached = String::new();
        storage
            .open_cache_read(&root.id, "k")
            .unwrap()
            .unwrap()
            .read_to_string(&mut cached)
            .unwrap();
        assert_eq!(cached, "cached");

        storage.write_to_cache(&root.id, "k2", b"other").unwrap();
        storage.invalidate_cache(&root.id, "k").unwrap();
        assert!(storage.read_from_cache(&root.id, "k").unwrap().is_none());
        assert!(storage.read_from_cache(&root.id, "k2").unwrap().is_some());

        storage.invalidate_all_cache().unwrap();
        assert!(storage.read_from_cache(&root.id, "k2").unwrap().is_none());
        // the cache never reaches the blob store
        assert!(storage.list_data_names(&root.id).unwrap().is_empty());
    }
}
