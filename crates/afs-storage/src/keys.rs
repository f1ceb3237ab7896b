//! Key encoding and decoding for storage layer.
//!
//! Composite keys join their parts with NUL, which names may not contain.
//! Numeric parts are zero-padded so lexicographic order matches numeric
//! order:
//! - child entries: `{parent}\0{name}`
//! - per-node entries (blobs, series metadata): `{node}\0{name}`
//! - dependencies: `{from}\0{name}\0{to}` and backward `{to}\0{from}\0{name}`
//! - chunks: `{node}\0{name}\0{version:010}\0{offset:010}`

use crate::error::StorageError;

const SEP: char = '\0';

fn split_parts(bytes: &[u8], expected: usize, what: &str) -> Result<Vec<String>, StorageError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
    let parts: Vec<String> = s.split(SEP).map(str::to_string).collect();
    if parts.len() != expected {
        return Err(StorageError::Key(format!(
            "Invalid {} key: expected {} parts, got {}",
            what,
            expected,
            parts.len()
        )));
    }
    Ok(parts)
}

/// Key of an entry owned by a node: `{node}\0{name}`
pub fn entry_key(node_id: &str, name: &str) -> Vec<u8> {
    format!("{}{}{}", node_id, SEP, name).into_bytes()
}

/// Prefix of every entry owned by a node
pub fn entry_prefix(node_id: &str) -> Vec<u8> {
    format!("{}{}", node_id, SEP).into_bytes()
}

/// Name part of an `entry_key`
pub fn entry_name(bytes: &[u8]) -> Result<String, StorageError> {
    let mut parts = split_parts(bytes, 2, "entry")?;
    Ok(parts.remove(1))
}

/// Forward dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyKey {
    pub from: String,
    pub name: String,
    pub to: String,
}

impl DependencyKey {
    pub fn new(from: &str, name: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            name: name.to_string(),
            to: to.to_string(),
        }
    }

    /// Encode as a forward key: `{from}\0{name}\0{to}`
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}{}{}{}", self.from, SEP, self.name, SEP, self.to).into_bytes()
    }

    /// Encode as a backward key: `{to}\0{from}\0{name}`
    pub fn to_backward_bytes(&self) -> Vec<u8> {
        format!("{}{}{}{}{}", self.to, SEP, self.from, SEP, self.name).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let parts = split_parts(bytes, 3, "dependency")?;
        Ok(Self::new(&parts[0], &parts[1], &parts[2]))
    }

    pub fn from_backward_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let parts = split_parts(bytes, 3, "backward dependency")?;
        Ok(Self::new(&parts[1], &parts[2], &parts[0]))
    }

    /// Prefix of every forward edge `(from, name, *)`
    pub fn name_prefix(from: &str, name: &str) -> Vec<u8> {
        format!("{}{}{}{}", from, SEP, name, SEP).into_bytes()
    }
}

/// Time-series chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    pub node_id: String,
    pub name: String,
    pub version: u32,
    pub offset: usize,
}

impl ChunkKey {
    pub fn new(node_id: &str, name: &str, version: u32, offset: usize) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: name.to_string(),
            version,
            offset,
        }
    }

    /// Encode key to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{:010}{}{:010}",
            self.node_id, SEP, self.name, SEP, self.version, SEP, self.offset
        )
        .into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let parts = split_parts(bytes, 4, "chunk")?;
        let version = parts[2]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid version: {}", e)))?;
        let offset = parts[3]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid offset: {}", e)))?;
        Ok(Self::new(&parts[0], &parts[1], version, offset))
    }

    /// Prefix of every chunk of one series, all versions
    pub fn series_prefix(node_id: &str, name: &str) -> Vec<u8> {
        format!("{}{}{}{}", node_id, SEP, name, SEP).into_bytes()
    }

    /// Prefix of every chunk of one series version
    pub fn version_prefix(node_id: &str, name: &str, version: u32) -> Vec<u8> {
        format!("{}{}{}{}{:010}{}", node_id, SEP, name, SEP, version, SEP).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_key() {
        let key = entry_key("n1", "data:x");
        assert!(key.starts_with(&entry_prefix("n1")));
        assert_eq!(entry_name(&key).unwrap(), "data:x");
    }

    #[test]
    fn test_dependency_key_roundtrip() {
        let key = DependencyKey::new("a", "dep", "b");
        assert_eq!(DependencyKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert_eq!(
            DependencyKey::from_backward_bytes(&key.to_backward_bytes()).unwrap(),
            key
        );
        assert!(key.to_bytes().starts_with(&DependencyKey::name_prefix("a", "dep")));
        assert!(!key.to_bytes().starts_with(&DependencyKey::name_prefix("a", "de")));
    }

    #[test]
    fn test_chunk_key_ordering() {
        let early = ChunkKey::new("n", "ts", 1, 9).to_bytes();
        let late = ChunkKey::new("n", "ts", 1, 10).to_bytes();
        let next_version = ChunkKey::new("n", "ts", 2, 0).to_bytes();
        assert!(early < late);
        assert!(late < next_version);

        let decoded = ChunkKey::from_bytes(&late).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.offset, 10);
        assert!(late.starts_with(&ChunkKey::version_prefix("n", "ts", 1)));
        assert!(!late.starts_with(&ChunkKey::series_prefix("n", "t")));
    }

    #[test]
    fn test_invalid_key() {
        assert!(ChunkKey::from_bytes(b"only\0three\0parts").is_err());
        assert!(DependencyKey::from_bytes(&[0xff, 0xfe]).is_err());
    }
}
