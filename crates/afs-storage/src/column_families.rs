//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - nodes: node records (info, parent, consistency) keyed by node id
//! - children: `{parent}\0{name}` -> child id, the sibling-name index
//! - meta: store-level pointers (root id)
//! - blobs: `{node}\0{name}` -> payload bytes
//! - dependencies: `{from}\0{name}\0{to}`, forward edges
//! - backward_dependencies: `{to}\0{from}\0{name}`, reverse edges
//! - ts_metadata: `{node}\0{name}` -> series declaration
//! - ts_chunks: `{node}\0{name}\0{version}\0{offset}` -> chunk (Zstd)

use rocksdb::{ColumnFamilyDescriptor, Options};

pub const CF_NODES: &str = "nodes";

pub const CF_CHILDREN: &str = "children";

pub const CF_META: &str = "meta";

pub const CF_BLOBS: &str = "blobs";

pub const CF_DEPENDENCIES: &str = "dependencies";

pub const CF_BACKWARD_DEPENDENCIES: &str = "backward_dependencies";

pub const CF_TS_METADATA: &str = "ts_metadata";

pub const CF_TS_CHUNKS: &str = "ts_chunks";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_NODES,
    CF_CHILDREN,
    CF_META,
    CF_BLOBS,
    CF_DEPENDENCIES,
    CF_BACKWARD_DEPENDENCIES,
    CF_TS_METADATA,
    CF_TS_CHUNKS,
];

/// Payload-heavy column families are compressed
fn compressed_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_NODES, Options::default()),
        ColumnFamilyDescriptor::new(CF_CHILDREN, Options::default()),
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ColumnFamilyDescriptor::new(CF_BLOBS, compressed_options()),
        ColumnFamilyDescriptor::new(CF_DEPENDENCIES, Options::default()),
        ColumnFamilyDescriptor::new(CF_BACKWARD_DEPENDENCIES, Options::default()),
        ColumnFamilyDescriptor::new(CF_TS_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_TS_CHUNKS, compressed_options()),
    ]
}
