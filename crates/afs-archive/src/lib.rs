//! # afs-archive
//!
//! Moves a subtree between storage instances through a plain directory
//! tree: one directory per node, named by node id, holding its info,
//! outgoing dependencies, payloads, time series and children.
//!
//! ```text
//! <node id>/
//!   info.json
//!   dependencies.json
//!   data/<url-encoded name>.gz
//!   time-series/<url-encoded name>/metadata.json
//!   time-series/<url-encoded name>/chunks-<version>.json.gz
//!   children/<child id>/...
//! ```

mod archive;
pub mod error;

pub use archive::{AppStorageArchive, UnarchiveReport};
pub use error::ArchiveError;
