//! Node types for the application file system directory.
//!
//! A node is a named entry in the tree. Its identity is an opaque id
//! assigned by the storage; everything else in `NodeInfo` is mutable
//! through the storage API.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::AfsError;

/// Typed key/value maps attached to a node.
///
/// The four maps are independent: the same key may appear in several of
/// them with unrelated values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGenericMetadata {
    #[serde(default)]
    pub strings: BTreeMap<String, String>,

    #[serde(default, with = "crate::float::map")]
    pub doubles: BTreeMap<String, f64>,

    #[serde(default)]
    pub ints: BTreeMap<String, i32>,

    #[serde(default)]
    pub booleans: BTreeMap<String, bool>,
}

impl NodeGenericMetadata {
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn with_double(mut self, key: impl Into<String>, value: f64) -> Self {
        self.doubles.insert(key.into(), value);
        self
    }

    pub fn with_int(mut self, key: impl Into<String>, value: i32) -> Self {
        self.ints.insert(key.into(), value);
        self
    }

    pub fn with_boolean(mut self, key: impl Into<String>, value: bool) -> Self {
        self.booleans.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
            && self.doubles.is_empty()
            && self.ints.is_empty()
            && self.booleans.is_empty()
    }
}

/// Descriptive record of a node.
///
/// Parent linkage and the consistency flag are owned by the storage and
/// are queried separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Opaque unique id, assigned at creation
    pub id: String,

    /// Name, unique among siblings
    pub name: String,

    /// Application-defined type tag
    pub pseudo_class: String,

    #[serde(default)]
    pub description: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub modification_time: DateTime<Utc>,

    /// Application-defined format version
    pub version: i32,

    #[serde(default)]
    pub generic_metadata: NodeGenericMetadata,
}

impl NodeInfo {
    /// Create a node record stamped with the current time, at the
    /// millisecond precision the record is stored with.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        pseudo_class: impl Into<String>,
        description: impl Into<String>,
        version: i32,
        generic_metadata: NodeGenericMetadata,
    ) -> Self {
        let now = Utc::now().trunc_subsecs(3);
        Self {
            id: id.into(),
            name: name.into(),
            pseudo_class: pseudo_class.into(),
            description: description.into(),
            creation_time: now,
            modification_time: now,
            version,
            generic_metadata,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A named outgoing edge resolved to the target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDependency {
    pub name: String,
    pub node_info: NodeInfo,
}

impl NodeDependency {
    pub fn new(name: impl Into<String>, node_info: NodeInfo) -> Self {
        Self {
            name: name.into(),
            node_info,
        }
    }
}

/// Check a node, blob, dependency, time-series or cache name.
///
/// Names are non-empty and never contain NUL, which storage keys use as
/// a separator.
pub fn validate_name(kind: &str, name: &str) -> Result<(), AfsError> {
    if name.is_empty() {
        return Err(AfsError::InvalidInput(format!("{} name is empty", kind)));
    }
    if name.contains('\0') {
        return Err(AfsError::InvalidInput(format!(
            "{} name contains a NUL character",
            kind
        )));
    }
    Ok(())
}
