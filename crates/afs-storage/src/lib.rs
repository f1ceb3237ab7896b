//! Storage engine for the application file system.
//!
//! Provides a RocksDB-backed `AppStorage` with:
//! - A node directory (tree, sibling-unique names, consistency tracking)
//! - Typed attributes and named binary payloads per node
//! - A named, directed dependency graph with backward lookups
//! - Versioned, chunked time series over regular or irregular indexes
//! - A non-authoritative per-node cache
//! - One event per mutation, published on the configured `EventsBus`
//!
//! `flush()` is the durability boundary; `close()` ends the instance.

mod blob;
mod cache;
pub mod change_set;
pub mod column_families;
mod db;
mod dependency;
mod directory;
pub mod error;
pub mod keys;
mod locks;
mod timeseries;

pub use blob::DataWriter;
pub use change_set::{StorageChange, StorageChangeSet};
pub use db::{AppStorage, StorageStats};
pub use error::{ErrorKind, StorageError};
