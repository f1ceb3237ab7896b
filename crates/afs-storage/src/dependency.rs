//! Named, directed dependency edges between nodes.
//!
//! Every edge is stored twice, forward (`{from}\0{name}\0{to}`) and
//! backward (`{to}\0{from}\0{name}`), in one batch, so both directions
//! are prefix scans and always agree.

use afs_types::{validate_name, NodeDependency, NodeEvent, NodeInfo};
use rocksdb::WriteBatch;
use std::collections::BTreeSet;
use tracing::debug;

use crate::column_families::{CF_BACKWARD_DEPENDENCIES, CF_DEPENDENCIES};
use crate::db::AppStorage;
use crate::error::StorageError;
use crate::keys::{entry_prefix, DependencyKey};

impl AppStorage {
    /// Add the edge `(from, name, to)`. Adding an existing edge again
    /// changes nothing but is still reported.
    pub fn add_dependency(&self, from_id: &str, name: &str, to_id: &str) -> Result<(), StorageError> {
        self.check_open()?;
        validate_name("dependency", name)?;
        let _tree = self.tree_lock.read();
        let _from = self.locks.lock(from_id);
        self.require_node(from_id)?;
        self.require_node(to_id)?;

        let edge = DependencyKey::new(from_id, name, to_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DEPENDENCIES)?, edge.to_bytes(), b"");
        batch.put_cf(self.cf(CF_BACKWARD_DEPENDENCIES)?, edge.to_backward_bytes(), b"");
        self.db.write(batch)?;

        debug!(from_id, name, to_id, "Added dependency");
        self.emit(NodeEvent::DependencyAdded {
            id: from_id.to_string(),
            dependency_name: name.to_string(),
        });
        Ok(())
    }

    /// Remove the edge `(from, name, to)`. Returns false if it did not exist.
    pub fn remove_dependency(&self, from_id: &str, name: &str, to_id: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        let _tree = self.tree_lock.read();
        let _from = self.locks.lock(from_id);
        self.require_node(from_id)?;
        self.require_node(to_id)?;

        let edge = DependencyKey::new(from_id, name, to_id);
        let forward_cf = self.cf(CF_DEPENDENCIES)?;
        if self.db.get_pinned_cf(forward_cf, edge.to_bytes())?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(forward_cf, edge.to_bytes());
        batch.delete_cf(self.cf(CF_BACKWARD_DEPENDENCIES)?, edge.to_backward_bytes());
        self.db.write(batch)?;

        debug!(from_id, name, to_id, "Removed dependency");
        self.emit(NodeEvent::DependencyRemoved {
            id: from_id.to_string(),
            dependency_name: name.to_string(),
        });
        Ok(true)
    }

    /// Targets of every edge named `name` leaving `from`, ordered by target id.
    pub fn get_dependencies(&self, from_id: &str, name: &str) -> Result<Vec<NodeInfo>, StorageError> {
        self.check_open()?;
        self.require_node(from_id)?;
        let mut targets = Vec::new();
        for (key, _) in self.scan_prefix(CF_DEPENDENCIES, &DependencyKey::name_prefix(from_id, name))? {
            let edge = DependencyKey::from_bytes(&key)?;
            if let Some(record) = self.get_record(&edge.to)? {
                targets.push(record.info);
            }
        }
        Ok(targets)
    }

    /// The target with the smallest id among edges named `name`, if any.
    pub fn get_dependency(&self, from_id: &str, name: &str) -> Result<Option<NodeInfo>, StorageError> {
        Ok(self.get_dependencies(from_id, name)?.into_iter().next())
    }

    /// Every edge leaving `from`, ordered by name then target id.
    pub fn get_all_dependencies(&self, from_id: &str) -> Result<Vec<NodeDependency>, StorageError> {
        self.check_open()?;
        self.require_node(from_id)?;
        let mut dependencies = Vec::new();
        for (key, _) in self.scan_prefix(CF_DEPENDENCIES, &entry_prefix(from_id))? {
            let edge = DependencyKey::from_bytes(&key)?;
            if let Some(record) = self.get_record(&edge.to)? {
                dependencies.push(NodeDependency::new(edge.name, record.info));
            }
        }
        Ok(dependencies)
    }

    /// Distinct nodes with at least one edge pointing at `to`.
    pub fn get_backward_dependencies(&self, to_id: &str) -> Result<Vec<NodeInfo>, StorageError> {
        self.check_open()?;
        self.require_node(to_id)?;
        let mut sources = BTreeSet::new();
        for (key, _) in self.scan_prefix(CF_BACKWARD_DEPENDENCIES, &entry_prefix(to_id))? {
            sources.insert(DependencyKey::from_backward_bytes(&key)?.from);
        }
        let mut nodes = Vec::new();
        for source in sources {
            if let Some(record) = self.get_record(&source)? {
                nodes.push(record.info);
            }
        }
        Ok(nodes)
    }
}
