//! # afs-types
//!
//! Shared domain types for the application file system.
//!
//! This crate defines the data structures every other crate agrees on:
//! - Nodes: `NodeInfo`, typed generic metadata and dependency views
//! - Time series: metadata, regular/irregular indexes and data chunks
//! - Events: lifecycle notifications routed by topic
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use afs_types::{NodeInfo, NodeGenericMetadata};
//!
//! let info = NodeInfo::new("01J0000000000000000000000", "folder", "folder", "", 0, NodeGenericMetadata::default());
//! assert_eq!(info.name, "folder");
//! ```

pub mod config;
pub mod error;
pub mod event;
mod float;
pub mod node;
pub mod timeseries;

pub use config::{EventsSettings, Settings, StorageSettings};
pub use error::AfsError;
pub use event::{NodeEvent, TopicEvent, DEPENDENCY_TOPIC, NODE_TOPIC, TIME_SERIES_TOPIC};
pub use node::{validate_name, NodeDependency, NodeGenericMetadata, NodeInfo};
pub use timeseries::{
    check_chunks, materialize_doubles, materialize_strings, ChunkError, DataChunk, DoubleDataChunk, StringDataChunk, TimeSeriesDataType,
    TimeSeriesIndex, TimeSeriesMetadata,
};
