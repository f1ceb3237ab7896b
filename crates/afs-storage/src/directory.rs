//! Node directory: tree structure, naming, attributes and consistency.
//!
//! Parent linkage lives in the node record; the `children` column family
//! indexes `{parent}\0{name}` so sibling-name uniqueness and child lookup
//! are single key reads. Both are written in one batch.

use afs_types::{validate_name, NodeEvent, NodeGenericMetadata, NodeInfo};
use chrono::{SubsecRound, Utc};
use rocksdb::{IteratorMode, WriteBatch};
use std::collections::BTreeMap;
use tracing::{debug, info};
use ulid::Ulid;

use crate::column_families::{
    CF_BACKWARD_DEPENDENCIES, CF_BLOBS, CF_CHILDREN, CF_DEPENDENCIES, CF_META, CF_NODES,
    CF_TS_CHUNKS, CF_TS_METADATA,
};
use crate::db::{AppStorage, NodeRecord};
use crate::error::StorageError;
use crate::keys::{entry_key, entry_prefix, DependencyKey};

const ROOT_KEY: &[u8] = b"root";

impl AppStorage {
    /// Return the root node, creating it on first call.
    ///
    /// The root is born consistent and has no parent.
    pub fn create_root_if_absent(&self, name: &str, pseudo_class: &str) -> Result<NodeInfo, StorageError> {
        self.check_open()?;
        validate_name("node", name)?;
        let _tree = self.tree_lock.write();

        if let Some(root_id) = self.root_id()? {
            return Ok(self.require_record(&root_id)?.info);
        }

        let id = Ulid::new().to_string();
        let info = NodeInfo::new(
            id.clone(),
            name,
            pseudo_class,
            "",
            0,
            NodeGenericMetadata::default(),
        );
        let record = NodeRecord {
            info: info.clone(),
            parent_id: None,
            consistent: true,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_NODES)?, id.as_bytes(), record.to_bytes()?);
        batch.put_cf(self.cf(CF_META)?, ROOT_KEY, id.as_bytes());
        self.db.write(batch)?;

        info!(node_id = %id, name, "Created root node");
        self.emit(NodeEvent::NodeCreated {
            id,
            parent_id: None,
        });
        Ok(info)
    }

    /// The root node, if it was created.
    pub fn root_node(&self) -> Result<Option<NodeInfo>, StorageError> {
        self.check_open()?;
        match self.root_id()? {
            Some(id) => Ok(self.get_record(&id)?.map(|r| r.info)),
            None => Ok(None),
        }
    }

    fn root_id(&self) -> Result<Option<String>, StorageError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, ROOT_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StorageError::Key(format!("Invalid root id: {}", e))),
            None => Ok(None),
        }
    }

    /// Create an inconsistent node under `parent_id`.
    pub fn create_node(
        &self,
        parent_id: &str,
        name: &str,
        pseudo_class: &str,
        description: &str,
        version: i32,
        generic_metadata: NodeGenericMetadata,
    ) -> Result<NodeInfo, StorageError> {
        self.check_open()?;
        validate_name("node", name)?;
        let _tree = self.tree_lock.read();
        let _parent = self.locks.lock(parent_id);

        self.require_node(parent_id)?;
        let children_cf = self.cf(CF_CHILDREN)?;
        let child_key = entry_key(parent_id, name);
        if self.db.get_pinned_cf(children_cf, &child_key)?.is_some() {
            return Err(StorageError::Conflict(format!(
                "node {} already has a child named '{}'",
                parent_id, name
            )));
        }

        let id = Ulid::new().to_string();
        let info = NodeInfo::new(
            id.clone(),
            name,
            pseudo_class,
            description,
            version,
            generic_metadata,
        );
        let record = NodeRecord {
            info: info.clone(),
            parent_id: Some(parent_id.to_string()),
            consistent: false,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_NODES)?, id.as_bytes(), record.to_bytes()?);
        batch.put_cf(children_cf, &child_key, id.as_bytes());
        self.db.write(batch)?;

        debug!(node_id = %id, parent_id, name, "Created node");
        self.emit(NodeEvent::NodeCreated {
            id,
            parent_id: Some(parent_id.to_string()),
        });
        Ok(info)
    }

    pub fn node_exists(&self, node_id: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        Ok(self.get_record(node_id)?.is_some())
    }

    pub fn get_node_info(&self, node_id: &str) -> Result<NodeInfo, StorageError> {
        self.check_open()?;
        Ok(self.require_record(node_id)?.info)
    }

    /// Children of a node, ordered by name.
    pub fn get_children(&self, node_id: &str) -> Result<Vec<NodeInfo>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        Ok(self
            .child_records(node_id)?
            .into_iter()
            .map(|r| r.info)
            .collect())
    }

    pub(crate) fn child_records(&self, node_id: &str) -> Result<Vec<NodeRecord>, StorageError> {
        let mut children = Vec::new();
        for (_, child_id) in self.scan_prefix(CF_CHILDREN, &entry_prefix(node_id))? {
            let child_id = String::from_utf8(child_id)
                .map_err(|e| StorageError::Key(format!("Invalid child id: {}", e)))?;
            if let Some(record) = self.get_record(&child_id)? {
                children.push(record);
            }
        }
        Ok(children)
    }

    pub fn get_child(&self, node_id: &str, name: &str) -> Result<Option<NodeInfo>, StorageError> {
        self.check_open()?;
        self.require_node(node_id)?;
        let cf = self.cf(CF_CHILDREN)?;
        match self.db.get_cf(cf, entry_key(node_id, name))? {
            Some(child_id) => {
                let child_id = String::from_utf8(child_id)
                    .map_err(|e| StorageError::Key(format!("Invalid child id: {}", e)))?;
                Ok(self.get_record(&child_id)?.map(|r| r.info))
            }
            None => Ok(None),
        }
    }

    /// Parent of a node; `None` for the root.
    pub fn get_parent(&self, node_id: &str) -> Result<Option<NodeInfo>, StorageError> {
        self.check_open()?;
        match self.require_record(node_id)?.parent_id {
            Some(parent_id) => Ok(Some(self.require_record(&parent_id)?.info)),
            None => Ok(None),
        }
    }

    /// Move a node under a new parent.
    pub fn set_parent(&self, node_id: &str, new_parent_id: &str) -> Result<(), StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.write();

        let mut record = self.require_record(node_id)?;
        let old_parent_id = record.parent_id.clone().ok_or_else(|| {
            StorageError::InvalidOperation("cannot change the parent of the root node".to_string())
        })?;
        self.require_node(new_parent_id)?;
        if old_parent_id == new_parent_id {
            return Ok(());
        }
        if self.is_ancestor_or_self(node_id, new_parent_id)? {
            return Err(StorageError::InvalidOperation(format!(
                "node {} cannot be moved under its own descendant {}",
                node_id, new_parent_id
            )));
        }

        let children_cf = self.cf(CF_CHILDREN)?;
        let new_key = entry_key(new_parent_id, &record.info.name);
        if self.db.get_pinned_cf(children_cf, &new_key)?.is_some() {
            return Err(StorageError::Conflict(format!(
                "node {} already has a child named '{}'",
                new_parent_id, record.info.name
            )));
        }

        record.parent_id = Some(new_parent_id.to_string());
        let mut batch = WriteBatch::default();
        batch.delete_cf(children_cf, entry_key(&old_parent_id, &record.info.name));
        batch.put_cf(children_cf, &new_key, node_id.as_bytes());
        batch.put_cf(self.cf(CF_NODES)?, node_id.as_bytes(), record.to_bytes()?);
        self.db.write(batch)?;

        debug!(node_id, old_parent_id = %old_parent_id, new_parent_id, "Moved node");
        self.emit(NodeEvent::ParentChanged {
            id: node_id.to_string(),
            old_parent_id: Some(old_parent_id),
            new_parent_id: new_parent_id.to_string(),
        });
        Ok(())
    }

    /// True if `ancestor_id` is `node_id` or one of its ancestors.
    fn is_ancestor_or_self(&self, ancestor_id: &str, node_id: &str) -> Result<bool, StorageError> {
        let mut current = Some(node_id.to_string());
        while let Some(id) = current {
            if id == ancestor_id {
                return Ok(true);
            }
            current = self.require_record(&id)?.parent_id;
        }
        Ok(false)
    }

    pub fn rename(&self, node_id: &str, name: &str) -> Result<(), StorageError> {
        self.check_open()?;
        validate_name("node", name)?;
        let _tree = self.tree_lock.read();

        let parent_id = self.require_record(node_id)?.parent_id;
        let _guards = self
            .locks
            .lock_pair(parent_id.as_deref().unwrap_or(node_id), node_id);

        let mut record = self.require_record(node_id)?;
        let old_name = record.info.name.clone();
        if old_name == name {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        if let Some(parent_id) = &record.parent_id {
            let children_cf = self.cf(CF_CHILDREN)?;
            let new_key = entry_key(parent_id, name);
            if self.db.get_pinned_cf(children_cf, &new_key)?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "node {} already has a child named '{}'",
                    parent_id, name
                )));
            }
            batch.delete_cf(children_cf, entry_key(parent_id, &old_name));
            batch.put_cf(children_cf, &new_key, node_id.as_bytes());
        }
        record.info.name = name.to_string();
        batch.put_cf(self.cf(CF_NODES)?, node_id.as_bytes(), record.to_bytes()?);
        self.db.write(batch)?;

        debug!(node_id, old_name = %old_name, name, "Renamed node");
        self.emit(NodeEvent::AttributeUpdated {
            id: node_id.to_string(),
            attribute: "name".to_string(),
        });
        Ok(())
    }

    /// Read-modify-write of one node record under its stripe; `event` is
    /// published before the stripe is released.
    fn update_record<F>(&self, node_id: &str, event: NodeEvent, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut NodeRecord),
    {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _node = self.locks.lock(node_id);

        let mut record = self.require_record(node_id)?;
        update(&mut record);
        self.put_record(&record)?;
        self.emit(event);
        Ok(())
    }

    fn attribute_event(node_id: &str, attribute: &str) -> NodeEvent {
        NodeEvent::AttributeUpdated {
            id: node_id.to_string(),
            attribute: attribute.to_string(),
        }
    }

    pub fn set_description(&self, node_id: &str, description: &str) -> Result<(), StorageError> {
        self.update_record(
            node_id,
            Self::attribute_event(node_id, "description"),
            |record| record.info.description = description.to_string(),
        )
    }

    pub fn touch_modification_time(&self, node_id: &str) -> Result<(), StorageError> {
        let now = Utc::now().trunc_subsecs(3);
        self.update_record(
            node_id,
            Self::attribute_event(node_id, "modificationTime"),
            |record| record.info.modification_time = now,
        )
    }

    /// Replace all four generic metadata maps at once.
    pub fn set_metadata(&self, node_id: &str, metadata: NodeGenericMetadata) -> Result<(), StorageError> {
        self.update_record(
            node_id,
            NodeEvent::NodeMetadataUpdated {
                id: node_id.to_string(),
            },
            |record| record.info.generic_metadata = metadata,
        )
    }

    /// Mark a node's data as complete.
    pub fn mark_consistent(&self, node_id: &str) -> Result<(), StorageError> {
        self.update_record(
            node_id,
            NodeEvent::NodeConsistent {
                id: node_id.to_string(),
            },
            |record| record.consistent = true,
        )
    }

    pub fn is_consistent(&self, node_id: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        Ok(self.require_record(node_id)?.consistent)
    }

    /// Every node created but never marked consistent.
    pub fn list_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, StorageError> {
        self.check_open()?;
        let cf = self.cf(CF_NODES)?;
        let mut nodes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record = NodeRecord::from_bytes(&value)?;
            if !record.consistent {
                nodes.push(record.info);
            }
        }
        Ok(nodes)
    }

    fn set_attribute<T>(
        &self,
        node_id: &str,
        key: &str,
        value: Option<T>,
        select: fn(&mut NodeGenericMetadata) -> &mut BTreeMap<String, T>,
    ) -> Result<(), StorageError> {
        validate_name("attribute", key)?;
        self.update_record(node_id, Self::attribute_event(node_id, key), |record| {
            let map = select(&mut record.info.generic_metadata);
            match value {
                Some(value) => {
                    map.insert(key.to_string(), value);
                }
                None => {
                    map.remove(key);
                }
            }
        })
    }

    fn get_attribute<T: Clone>(
        &self,
        node_id: &str,
        key: &str,
        select: fn(&NodeGenericMetadata) -> &BTreeMap<String, T>,
    ) -> Result<Option<T>, StorageError> {
        self.check_open()?;
        let record = self.require_record(node_id)?;
        Ok(select(&record.info.generic_metadata).get(key).cloned())
    }

    /// Set (`Some`) or unset (`None`) a string attribute.
    pub fn set_string_attribute(&self, node_id: &str, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        self.set_attribute(node_id, key, value.map(str::to_string), |m| &mut m.strings)
    }

    pub fn get_string_attribute(&self, node_id: &str, key: &str) -> Result<Option<String>, StorageError> {
        self.get_attribute(node_id, key, |m| &m.strings)
    }

    pub fn set_double_attribute(&self, node_id: &str, key: &str, value: Option<f64>) -> Result<(), StorageError> {
        self.set_attribute(node_id, key, value, |m| &mut m.doubles)
    }

    pub fn get_double_attribute(&self, node_id: &str, key: &str) -> Result<Option<f64>, StorageError> {
        self.get_attribute(node_id, key, |m| &m.doubles)
    }

    pub fn set_int_attribute(&self, node_id: &str, key: &str, value: Option<i32>) -> Result<(), StorageError> {
        self.set_attribute(node_id, key, value, |m| &mut m.ints)
    }

    pub fn get_int_attribute(&self, node_id: &str, key: &str) -> Result<Option<i32>, StorageError> {
        self.get_attribute(node_id, key, |m| &m.ints)
    }

    pub fn set_boolean_attribute(&self, node_id: &str, key: &str, value: Option<bool>) -> Result<(), StorageError> {
        self.set_attribute(node_id, key, value, |m| &mut m.booleans)
    }

    pub fn get_boolean_attribute(&self, node_id: &str, key: &str) -> Result<Option<bool>, StorageError> {
        self.get_attribute(node_id, key, |m| &m.booleans)
    }

    /// Delete a node and its whole subtree. Returns the parent id.
    ///
    /// Payloads, time series, cache entries and every dependency edge
    /// touching a removed node go with it, in one batch.
    pub fn delete_node(&self, node_id: &str) -> Result<String, StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.write();

        let record = self.require_record(node_id)?;
        let parent_id = record.parent_id.clone().ok_or_else(|| {
            StorageError::InvalidOperation("cannot delete the root node".to_string())
        })?;

        let subtree = self.collect_subtree(record)?;
        let mut batch = WriteBatch::default();
        for removed in &subtree {
            self.stage_removal(&mut batch, removed)?;
        }
        self.db.write(batch)?;

        for removed in subtree {
            self.cache.invalidate_node(&removed.info.id);
            self.emit(NodeEvent::NodeRemoved {
                id: removed.info.id,
                parent_id: removed.parent_id,
            });
        }
        debug!(node_id, parent_id = %parent_id, "Deleted node");
        Ok(parent_id)
    }

    /// Records of `top` and all its descendants, children before parents.
    fn collect_subtree(&self, top: NodeRecord) -> Result<Vec<NodeRecord>, StorageError> {
        let mut pre_order = Vec::new();
        let mut stack = vec![top];
        while let Some(record) = stack.pop() {
            stack.extend(self.child_records(&record.info.id)?);
            pre_order.push(record);
        }
        pre_order.reverse();
        Ok(pre_order)
    }

    fn stage_removal(&self, batch: &mut WriteBatch, record: &NodeRecord) -> Result<(), StorageError> {
        let id = &record.info.id;
        let prefix = entry_prefix(id);

        batch.delete_cf(self.cf(CF_NODES)?, id.as_bytes());
        if let Some(parent_id) = &record.parent_id {
            batch.delete_cf(self.cf(CF_CHILDREN)?, entry_key(parent_id, &record.info.name));
        }
        for cf_name in [CF_BLOBS, CF_TS_METADATA, CF_TS_CHUNKS] {
            let cf = self.cf(cf_name)?;
            for (key, _) in self.scan_prefix(cf_name, &prefix)? {
                batch.delete_cf(cf, key);
            }
        }

        let forward_cf = self.cf(CF_DEPENDENCIES)?;
        let backward_cf = self.cf(CF_BACKWARD_DEPENDENCIES)?;
        for (key, _) in self.scan_prefix(CF_DEPENDENCIES, &prefix)? {
            let edge = DependencyKey::from_bytes(&key)?;
            batch.delete_cf(forward_cf, edge.to_bytes());
            batch.delete_cf(backward_cf, edge.to_backward_bytes());
        }
        for (key, _) in self.scan_prefix(CF_BACKWARD_DEPENDENCIES, &prefix)? {
            let edge = DependencyKey::from_backward_bytes(&key)?;
            batch.delete_cf(forward_cf, edge.to_bytes());
            batch.delete_cf(backward_cf, edge.to_backward_bytes());
        }
        Ok(())
    }
}
