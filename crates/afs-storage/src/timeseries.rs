//! Versioned, chunked time series attached to nodes.
//!
//! Metadata is keyed `{node}\0{name}`; chunks are keyed
//! `{node}\0{name}\0{version:010}\0{offset:010}` so one version of one
//! series is a single ordered prefix scan. Appends are validated against
//! the index and the chunks already stored, then written in one batch.

use afs_types::{
    check_chunks, materialize_doubles, materialize_strings, validate_name, DataChunk,
    DoubleDataChunk, NodeEvent, StringDataChunk, TimeSeriesMetadata,
};
use rocksdb::WriteBatch;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

use crate::column_families::{CF_TS_CHUNKS, CF_TS_METADATA};
use crate::db::AppStorage;
use crate::error::StorageError;
use crate::keys::{entry_key, entry_name, entry_prefix, ChunkKey};

impl AppStorage {
    /// Declare a series on a node.
    pub fn create_time_series(&self, node_id: &str, metadata: TimeSeriesMetadata) -> Result<(), StorageError> {
        self.check_open()?;
        validate_name("time series", &metadata.name)?;
        metadata.index.validate()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);
        self.require_node(node_id)?;

        let cf = self.cf(CF_TS_METADATA)?;
        let key = entry_key(node_id, &metadata.name);
        if self.db.get_pinned_cf(cf, &key)?.is_some() {
            return Err(StorageError::Conflict(format!(
                "time series '{}' already exists on node {}",
                metadata.name, node_id
            )));
        }
        self.db.put_cf(cf, &key, metadata.to_bytes()?)?;

        debug!(node_id, name = %metadata.name, data_type = %metadata.data_type, "Created time series");
        self.emit(NodeEvent::TimeSeriesCreated {
            id: node_id.to_string(),
            time_series_name: metadata.name,
        });
        Ok(())
    }

    fn series_metadata(&self, node_id: &str, name: &str) -> Result<Option<TimeSeriesMetadata>, StorageError> {
        let cf = self.cf(CF_TS_METADATA)?;
        match self.db.get_cf(cf, entry_key(node_id, name))? {
            Some(bytes) => Ok(Some(TimeSeriesMetadata::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn time_series_exists(&self, node_id: &str, name: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        Ok(self.series_metadata(node_id, name)?.is_some())
    }

    pub fn list_time_series_names(&self, node_id: &str) -> Result<BTreeSet<String>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        self.scan_prefix(CF_TS_METADATA, &entry_prefix(node_id))?
            .into_iter()
            .map(|(key, _)| entry_name(&key))
            .collect()
    }

    /// Metadata of the named series that exist, in the order asked.
    pub fn get_time_series_metadata(&self, node_id: &str, names: &[&str]) -> Result<Vec<TimeSeriesMetadata>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let mut found = Vec::new();
        for name in names {
            if let Some(metadata) = self.series_metadata(node_id, name)? {
                found.push(metadata);
            }
        }
        Ok(found)
    }

    /// Versions holding at least one chunk, for one series or all of them.
    pub fn list_time_series_versions(&self, node_id: &str, name: Option<&str>) -> Result<BTreeSet<u32>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let prefix = match name {
            Some(name) => ChunkKey::series_prefix(node_id, name),
            None => entry_prefix(node_id),
        };
        self.scan_prefix(CF_TS_CHUNKS, &prefix)?
            .into_iter()
            .map(|(key, _)| ChunkKey::from_bytes(&key).map(|k| k.version))
            .collect()
    }

    pub fn add_double_chunks(
        &self,
        node_id: &str,
        version: u32,
        name: &str,
        chunks: Vec<DoubleDataChunk>,
    ) -> Result<(), StorageError> {
        self.add_chunks(node_id, version, name, chunks)
    }

    pub fn add_string_chunks(
        &self,
        node_id: &str,
        version: u32,
        name: &str,
        chunks: Vec<StringDataChunk>,
    ) -> Result<(), StorageError> {
        self.add_chunks(node_id, version, name, chunks)
    }

    #[instrument(skip(self, chunks), fields(chunk_count = chunks.len()))]
    fn add_chunks<C: DataChunk>(
        &self,
        node_id: &str,
        version: u32,
        name: &str,
        chunks: Vec<C>,
    ) -> Result<(), StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);
        self.require_node(node_id)?;

        let metadata = self.series_metadata(node_id, name)?.ok_or_else(|| {
            StorageError::NotFound(format!("time series '{}' on node {}", name, node_id))
        })?;
        if metadata.data_type != C::DATA_TYPE {
            return Err(StorageError::InvalidOperation(format!(
                "time series '{}' holds {} values, not {}",
                name,
                metadata.data_type,
                C::DATA_TYPE
            )));
        }
        if chunks.is_empty() {
            return Ok(());
        }

        let existing: Vec<C> = self.load_chunks(node_id, name, version)?;
        check_chunks(&metadata.index, &existing, &chunks)?;

        let cf = self.cf(CF_TS_CHUNKS)?;
        let mut batch = WriteBatch::default();
        for chunk in &chunks {
            let key = ChunkKey::new(node_id, name, version, chunk.offset());
            batch.put_cf(cf, key.to_bytes(), serde_json::to_vec(chunk)?);
        }
        self.db.write(batch)?;

        debug!(node_id, name, version, "Appended time series chunks");
        self.emit(NodeEvent::TimeSeriesDataUpdated {
            id: node_id.to_string(),
            time_series_name: name.to_string(),
        });
        Ok(())
    }

    fn load_chunks<C: DataChunk>(&self, node_id: &str, name: &str, version: u32) -> Result<Vec<C>, StorageError> {
        self.scan_prefix(CF_TS_CHUNKS, &ChunkKey::version_prefix(node_id, name, version))?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StorageError::from))
            .collect()
    }

    /// Stored chunks of each named series of type `C`, in offset order.
    /// Unknown names and series of another type are left out.
    fn typed_chunks<C: DataChunk>(
        &self,
        node_id: &str,
        names: &[&str],
        version: u32,
    ) -> Result<BTreeMap<String, (TimeSeriesMetadata, Vec<C>)>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let mut result = BTreeMap::new();
        for name in names {
            let Some(metadata) = self.series_metadata(node_id, name)? else {
                continue;
            };
            if metadata.data_type != C::DATA_TYPE {
                continue;
            }
            let chunks = self.load_chunks(node_id, name, version)?;
            result.insert(name.to_string(), (metadata, chunks));
        }
        Ok(result)
    }

    pub fn get_double_chunks(
        &self,
        node_id: &str,
        names: &[&str],
        version: u32,
    ) -> Result<BTreeMap<String, Vec<DoubleDataChunk>>, StorageError> {
        Ok(self
            .typed_chunks::<DoubleDataChunk>(node_id, names, version)?
            .into_iter()
            .map(|(name, (_, chunks))| (name, chunks))
            .collect())
    }

    pub fn get_string_chunks(
        &self,
        node_id: &str,
        names: &[&str],
        version: u32,
    ) -> Result<BTreeMap<String, Vec<StringDataChunk>>, StorageError> {
        Ok(self
            .typed_chunks::<StringDataChunk>(node_id, names, version)?
            .into_iter()
            .map(|(name, (_, chunks))| (name, chunks))
            .collect())
    }

    /// One value per index point for each named double series; NaN where
    /// no chunk covers the point.
    pub fn read_double(
        &self,
        node_id: &str,
        names: &[&str],
        version: u32,
    ) -> Result<BTreeMap<String, Vec<f64>>, StorageError> {
        Ok(self
            .typed_chunks::<DoubleDataChunk>(node_id, names, version)?
            .into_iter()
            .map(|(name, (metadata, chunks))| {
                (name, materialize_doubles(metadata.index.point_count(), &chunks))
            })
            .collect())
    }

    /// One value per index point for each named string series; `None`
    /// where no chunk covers the point.
    pub fn read_string(
        &self,
        node_id: &str,
        names: &[&str],
        version: u32,
    ) -> Result<BTreeMap<String, Vec<Option<String>>>, StorageError> {
        Ok(self
            .typed_chunks::<StringDataChunk>(node_id, names, version)?
            .into_iter()
            .map(|(name, (metadata, chunks))| {
                (name, materialize_strings(metadata.index.point_count(), &chunks))
            })
            .collect())
    }

    /// Drop every series of a node with all versions of its data.
    pub fn remove_all_time_series(&self, node_id: &str) -> Result<(), StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);
        self.require_node(node_id)?;

        let prefix = entry_prefix(node_id);
        let mut batch = WriteBatch::default();
        for cf_name in [CF_TS_METADATA, CF_TS_CHUNKS] {
            let cf = self.cf(cf_name)?;
            for (key, _) in self.scan_prefix(cf_name, &prefix)? {
                batch.delete_cf(cf, key);
            }
        }
        self.db.write(batch)?;

        debug!(node_id, "Removed all time series");
        self.emit(NodeEvent::TimeSeriesRemoved {
            id: node_id.to_string(),
        });
        Ok(())
    }
}
