//! Subtree export and import.
//!
//! Archiving writes the subtree into a hidden staging directory next to
//! the destination and renames it into place once every node is written,
//! so a failed run never leaves a directory that looks like an archive.
//!
//! Unarchiving creates fresh nodes in the destination. Dependencies are
//! applied in a second pass, once every archived id has a new id.

use afs_storage::{AppStorage, StorageError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use afs_types::{
    DoubleDataChunk, NodeInfo, StringDataChunk, TimeSeriesDataType, TimeSeriesMetadata,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::error::ArchiveError;

const INFO_FILE: &str = "info.json";
const DEPENDENCIES_FILE: &str = "dependencies.json";
const DATA_DIR: &str = "data";
const TIME_SERIES_DIR: &str = "time-series";
const METADATA_FILE: &str = "metadata.json";
const CHILDREN_DIR: &str = "children";
const CHUNKS_PREFIX: &str = "chunks-";
const CHUNKS_SUFFIX: &str = ".json.gz";
const GZIP_SUFFIX: &str = ".gz";

/// Outgoing edge as recorded in `dependencies.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArchivedDependency {
    name: String,
    node_id: String,
}

/// Outcome of an unarchive run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnarchiveReport {
    /// New ids of the top-level nodes created
    pub root_ids: Vec<String>,
    /// Archived node id -> id in the destination
    pub id_mapping: BTreeMap<String, String>,
    pub data_count: usize,
    pub time_series_count: usize,
    pub chunk_count: usize,
    pub dependency_count: usize,
    /// Edges whose target is neither in the archive nor in the destination
    pub skipped_dependencies: usize,
}

impl UnarchiveReport {
    pub fn node_count(&self) -> usize {
        self.id_mapping.len()
    }

    /// Destination id of an archived node.
    pub fn new_id(&self, archived_id: &str) -> Option<&str> {
        self.id_mapping.get(archived_id).map(String::as_str)
    }
}

#[derive(Default)]
struct UnarchiveContext {
    report: UnarchiveReport,
    /// New node id -> edges read from its archive, in creation order
    dependencies: Vec<(String, Vec<ArchivedDependency>)>,
}

/// Archive/unarchive driver bound to one storage instance.
pub struct AppStorageArchive<'a> {
    storage: &'a AppStorage,
}

impl<'a> AppStorageArchive<'a> {
    pub fn new(storage: &'a AppStorage) -> Self {
        Self { storage }
    }

    /// Archive the subtree rooted at `node_id` into `parent_dir/<node_id>`.
    ///
    /// Returns the archive directory.
    #[instrument(skip(self, parent_dir))]
    pub fn archive(&self, node_id: &str, parent_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let info = self.storage.get_node_info(node_id)?;
        let target = parent_dir.join(&info.id);
        if target.exists() {
            return Err(ArchiveError::layout(&target, "archive directory already exists"));
        }

        let staging = parent_dir.join(format!(".{}.tmp", info.id));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        match self.write_node(&info, &staging) {
            Ok(node_count) => {
                fs::rename(&staging, &target)?;
                info!(node_id, node_count, "Archived subtree to {:?}", target);
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(error = %cleanup, "Failed to remove staging directory {:?}", staging);
                }
                Err(e)
            }
        }
    }

    fn write_node(&self, info: &NodeInfo, node_dir: &Path) -> Result<usize, ArchiveError> {
        debug!(node_id = %info.id, name = %info.name, "Archiving node");
        write_json(&node_dir.join(INFO_FILE), info)?;
        self.write_dependencies(info, node_dir)?;
        self.write_data(info, node_dir)?;
        self.write_time_series(info, node_dir)?;

        let mut node_count = 1;
        let children = self.storage.get_children(&info.id)?;
        if !children.is_empty() {
            let children_dir = node_dir.join(CHILDREN_DIR);
            fs::create_dir(&children_dir)?;
            for child in &children {
                let child_dir = children_dir.join(&child.id);
                fs::create_dir(&child_dir)?;
                node_count += self.write_node(child, &child_dir)?;
            }
        }
        Ok(node_count)
    }

    fn write_dependencies(&self, info: &NodeInfo, node_dir: &Path) -> Result<(), ArchiveError> {
        let dependencies: Vec<ArchivedDependency> = self
            .storage
            .get_all_dependencies(&info.id)?
            .into_iter()
            .map(|d| ArchivedDependency {
                name: d.name,
                node_id: d.node_info.id,
            })
            .collect();
        if dependencies.is_empty() {
            return Ok(());
        }
        write_json(&node_dir.join(DEPENDENCIES_FILE), &dependencies)
    }

    fn write_data(&self, info: &NodeInfo, node_dir: &Path) -> Result<(), ArchiveError> {
        let names = self.storage.list_data_names(&info.id)?;
        if names.is_empty() {
            return Ok(());
        }
        let data_dir = node_dir.join(DATA_DIR);
        fs::create_dir(&data_dir)?;
        for name in &names {
            let bytes = self.storage.read_data(&info.id, name)?.ok_or_else(|| {
                StorageError::NotFound(format!("data '{}' on node {}", name, info.id))
            })?;
            write_gzip(&data_dir.join(data_file_name(name)), &bytes)?;
        }
        debug!(node_id = %info.id, count = names.len(), "Wrote data");
        Ok(())
    }

    fn write_time_series(&self, info: &NodeInfo, node_dir: &Path) -> Result<(), ArchiveError> {
        let names = self.storage.list_time_series_names(&info.id)?;
        if names.is_empty() {
            return Ok(());
        }
        let series_root = node_dir.join(TIME_SERIES_DIR);
        fs::create_dir(&series_root)?;

        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        for metadata in self.storage.get_time_series_metadata(&info.id, &name_refs)? {
            let series_dir = series_root.join(encode_name(&metadata.name));
            fs::create_dir(&series_dir)?;
            write_json(&series_dir.join(METADATA_FILE), &metadata)?;

            let name = metadata.name.as_str();
            for version in self.storage.list_time_series_versions(&info.id, Some(name))? {
                let chunks_file = series_dir.join(chunks_file_name(version));
                match metadata.data_type {
                    TimeSeriesDataType::Double => {
                        let chunks = self
                            .storage
                            .get_double_chunks(&info.id, &[name], version)?
                            .remove(name)
                            .unwrap_or_default();
                        write_gzip(&chunks_file, &serde_json::to_vec(&chunks)?)?;
                    }
                    TimeSeriesDataType::String => {
                        let chunks = self
                            .storage
                            .get_string_chunks(&info.id, &[name], version)?
                            .remove(name)
                            .unwrap_or_default();
                        write_gzip(&chunks_file, &serde_json::to_vec(&chunks)?)?;
                    }
                }
            }
        }
        debug!(node_id = %info.id, count = names.len(), "Wrote time series");
        Ok(())
    }

    /// Recreate the archived subtree in `node_dir` under `parent_id`.
    #[instrument(skip(self, node_dir))]
    pub fn unarchive(&self, parent_id: &str, node_dir: &Path) -> Result<UnarchiveReport, ArchiveError> {
        self.storage.get_node_info(parent_id)?;
        let mut context = UnarchiveContext::default();
        let root_id = self.read_node(parent_id, node_dir, &mut context)?;
        context.report.root_ids.push(root_id);
        self.finish(context)
    }

    /// Recreate every archived child of `node_dir` under `parent_id`,
    /// leaving the archived node itself out.
    #[instrument(skip(self, node_dir))]
    pub fn unarchive_children(
        &self,
        parent_id: &str,
        node_dir: &Path,
    ) -> Result<UnarchiveReport, ArchiveError> {
        self.storage.get_node_info(parent_id)?;
        let mut context = UnarchiveContext::default();
        for child_dir in list_node_dirs(&node_dir.join(CHILDREN_DIR))? {
            let child_id = self.read_node(parent_id, &child_dir, &mut context)?;
            context.report.root_ids.push(child_id);
        }
        self.finish(context)
    }

    fn finish(&self, mut context: UnarchiveContext) -> Result<UnarchiveReport, ArchiveError> {
        self.resolve_dependencies(&mut context)?;
        self.storage.flush()?;
        let report = context.report;
        info!(
            nodes = report.node_count(),
            data = report.data_count,
            time_series = report.time_series_count,
            chunks = report.chunk_count,
            dependencies = report.dependency_count,
            "Unarchived subtree"
        );
        Ok(report)
    }

    fn read_node(
        &self,
        parent_id: &str,
        node_dir: &Path,
        context: &mut UnarchiveContext,
    ) -> Result<String, ArchiveError> {
        let info_path = node_dir.join(INFO_FILE);
        if !info_path.is_file() {
            return Err(ArchiveError::layout(node_dir, "missing info.json"));
        }
        let archived: NodeInfo = read_json(&info_path)?;
        let created = self.storage.create_node(
            parent_id,
            &archived.name,
            &archived.pseudo_class,
            &archived.description,
            archived.version,
            archived.generic_metadata.clone(),
        )?;
        debug!(archived_id = %archived.id, node_id = %created.id, name = %archived.name, "Unarchiving node");
        context
            .report
            .id_mapping
            .insert(archived.id.clone(), created.id.clone());

        let dependencies = read_dependencies(node_dir)?;
        if !dependencies.is_empty() {
            context.dependencies.push((created.id.clone(), dependencies));
        }
        self.read_data(&created.id, node_dir, context)?;
        self.read_time_series(&created.id, node_dir, context)?;
        self.storage.mark_consistent(&created.id)?;
        self.storage.flush()?;

        for child_dir in list_node_dirs(&node_dir.join(CHILDREN_DIR))? {
            self.read_node(&created.id, &child_dir, context)?;
        }
        Ok(created.id)
    }

    fn read_data(
        &self,
        node_id: &str,
        node_dir: &Path,
        context: &mut UnarchiveContext,
    ) -> Result<(), ArchiveError> {
        for path in list_entries(&node_dir.join(DATA_DIR), false)? {
            let name = data_name(&path)?;
            let bytes = read_gzip(&path)?;
            self.storage.write_data(node_id, &name, &bytes)?;
            context.report.data_count += 1;
        }
        Ok(())
    }

    fn read_time_series(
        &self,
        node_id: &str,
        node_dir: &Path,
        context: &mut UnarchiveContext,
    ) -> Result<(), ArchiveError> {
        for series_dir in list_entries(&node_dir.join(TIME_SERIES_DIR), true)? {
            let metadata_path = series_dir.join(METADATA_FILE);
            if !metadata_path.is_file() {
                return Err(ArchiveError::layout(&series_dir, "missing metadata.json"));
            }
            let metadata: TimeSeriesMetadata = read_json(&metadata_path)?;
            let name = metadata.name.clone();
            let data_type = metadata.data_type;
            self.storage.create_time_series(node_id, metadata)?;
            context.report.time_series_count += 1;

            let mut versions: Vec<(u32, PathBuf)> = list_entries(&series_dir, false)?
                .into_iter()
                .filter_map(|path| {
                    let version = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(chunks_version)?;
                    Some((version, path))
                })
                .collect();
            versions.sort();

            for (version, path) in versions {
                match data_type {
                    TimeSeriesDataType::Double => {
                        let chunks: Vec<DoubleDataChunk> = serde_json::from_slice(&read_gzip(&path)?)?;
                        context.report.chunk_count += chunks.len();
                        self.storage.add_double_chunks(node_id, version, &name, chunks)?;
                    }
                    TimeSeriesDataType::String => {
                        let chunks: Vec<StringDataChunk> = serde_json::from_slice(&read_gzip(&path)?)?;
                        context.report.chunk_count += chunks.len();
                        self.storage.add_string_chunks(node_id, version, &name, chunks)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Second pass: edges to archived nodes follow the id mapping, edges
    /// to other nodes keep their id when that node exists here.
    fn resolve_dependencies(&self, context: &mut UnarchiveContext) -> Result<(), ArchiveError> {
        for (from_id, dependencies) in std::mem::take(&mut context.dependencies) {
            for dependency in dependencies {
                let target = match context.report.id_mapping.get(&dependency.node_id) {
                    Some(new_id) => Some(new_id.clone()),
                    None if self.storage.node_exists(&dependency.node_id)? => {
                        Some(dependency.node_id.clone())
                    }
                    None => None,
                };
                match target {
                    Some(to_id) => {
                        self.storage.add_dependency(&from_id, &dependency.name, &to_id)?;
                        context.report.dependency_count += 1;
                    }
                    None => {
                        warn!(
                            from_id = %from_id,
                            name = %dependency.name,
                            target = %dependency.node_id,
                            "Skipping dependency to unknown node"
                        );
                        context.report.skipped_dependencies += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_dependencies(node_dir: &Path) -> Result<Vec<ArchivedDependency>, ArchiveError> {
    let path = node_dir.join(DEPENDENCIES_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    read_json(&path)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ArchiveError> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArchiveError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// File name for a payload or series name. `.` and `..` are escaped so
/// every name maps to a plain entry.
fn encode_name(name: &str) -> String {
    let encoded = urlencoding::encode(name).into_owned();
    if encoded == "." || encoded == ".." {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

fn write_gzip(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn read_gzip(path: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut bytes = Vec::new();
    GzDecoder::new(BufReader::new(File::open(path)?)).read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn data_file_name(name: &str) -> String {
    format!("{}{}", encode_name(name), GZIP_SUFFIX)
}

/// Payload name of a `data/` entry.
fn data_name(path: &Path) -> Result<String, ArchiveError> {
    let name = decode_name(path)?;
    name.strip_suffix(GZIP_SUFFIX)
        .map(str::to_string)
        .ok_or_else(|| ArchiveError::layout(path, "data file is not gzipped"))
}

fn decode_name(path: &Path) -> Result<String, ArchiveError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::layout(path, "file name is not valid UTF-8"))?;
    urlencoding::decode(file_name)
        .map(|n| n.into_owned())
        .map_err(|e| ArchiveError::layout(path, e.to_string()))
}

fn chunks_file_name(version: u32) -> String {
    format!("{}{}{}", CHUNKS_PREFIX, version, CHUNKS_SUFFIX)
}

fn chunks_version(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(CHUNKS_PREFIX)?
        .strip_suffix(CHUNKS_SUFFIX)?
        .parse()
        .ok()
}

/// Files (or directories) directly under `dir`, sorted; empty if `dir`
/// does not exist.
fn list_entries(dir: &Path, directories: bool) -> Result<Vec<PathBuf>, ArchiveError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() == directories {
            entries.push(entry.path());
        }
    }
    entries.sort();
    Ok(entries)
}

/// Child node directories, skipping hidden staging directories.
fn list_node_dirs(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    Ok(list_entries(dir, true)?
        .into_iter()
        .filter(|path| {
            !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .collect())
}
