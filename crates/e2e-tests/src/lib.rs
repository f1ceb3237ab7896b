//! End-to-end test infrastructure for the application file system.
//!
//! Provides a shared TestHarness and helpers for scenarios that span the
//! storage engine, the event bus or log, and the archive tool.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rand::RngCore;
use tempfile::TempDir;

use afs_events::{EventsBus, EventsStore, InMemoryEventsBus};
use afs_storage::AppStorage;
use afs_types::{
    DoubleDataChunk, NodeGenericMetadata, NodeInfo, Settings, StringDataChunk,
    TimeSeriesDataType, TimeSeriesIndex, TimeSeriesMetadata,
};

/// Install a test-friendly tracing subscriber once per process.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_test_writer()
        .try_init();
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: TempDir,
    /// Shared storage instance
    pub storage: Arc<AppStorage>,
    /// Durable event log, when the harness was built with one
    pub events_store: Option<Arc<EventsStore>>,
    pub settings: Settings,
}

impl TestHarness {
    /// Storage over an in-memory bus.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Storage whose events are also recorded in an `EventsStore`.
    pub fn with_event_log() -> Self {
        Self::build(true)
    }

    fn build(log_enabled: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut settings = Settings::for_directory(temp_dir.path(), "e2e");
        settings.events.log_enabled = log_enabled;
        init_tracing(&settings.log_level);

        let (bus, events_store): (Arc<dyn EventsBus>, Option<Arc<EventsStore>>) = if log_enabled {
            let store = Arc::new(
                EventsStore::open(Path::new(&settings.events.log_path), &settings.events)
                    .expect("Failed to open event log"),
            );
            let bus: Arc<dyn EventsBus> = store.clone();
            (bus, Some(store))
        } else {
            let bus: Arc<dyn EventsBus> =
                Arc::new(InMemoryEventsBus::from_settings(&settings.events));
            (bus, None)
        };

        let storage = Arc::new(
            AppStorage::open_with(
                Path::new(&settings.db_path),
                &settings.file_system_name,
                bus,
                &settings.storage,
            )
            .expect("Failed to open test storage"),
        );

        Self {
            _temp_dir: temp_dir,
            storage,
            events_store,
            settings,
        }
    }

    /// Directory for files the test writes next to the store.
    pub fn scratch_dir(&self, name: &str) -> std::path::PathBuf {
        let dir = self._temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create scratch dir");
        dir
    }

    pub fn root(&self) -> NodeInfo {
        self.storage
            .create_root_if_absent("root", "folder")
            .expect("Failed to create root")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Nodes of the tree built by `build_sample_tree`.
pub struct SampleTree {
    pub root: NodeInfo,
    pub dir1: NodeInfo,
    pub dir2: NodeInfo,
    pub file: NodeInfo,
}

/// 2015-01-01T00:00Z to 01:15Z every 15 minutes (6 points).
pub fn quarter_hour_index() -> TimeSeriesIndex {
    let start = Utc
        .with_ymd_and_hms(2015, 1, 1, 0, 0, 0)
        .single()
        .expect("valid start instant");
    TimeSeriesIndex::regular(start, start + Duration::minutes(75), Duration::minutes(15))
        .expect("valid index")
}

/// Build `root/dir1/dir2/file` where `file` carries a payload, one double
/// and one string series, and a dependency on `dir1`. Every node is
/// marked consistent and the store flushed.
pub fn build_sample_tree(storage: &AppStorage, payload: &[u8]) -> SampleTree {
    let root = storage
        .create_root_if_absent("root", "folder")
        .expect("Failed to create root");
    let dir1 = storage
        .create_node(&root.id, "dir1", "folder", "", 0, NodeGenericMetadata::default())
        .expect("Failed to create dir1");
    let dir2 = storage
        .create_node(&dir1.id, "dir2", "folder", "", 0, NodeGenericMetadata::default())
        .expect("Failed to create dir2");
    let file = storage
        .create_node(
            &dir2.id,
            "file",
            "file",
            "sample",
            1,
            NodeGenericMetadata::default().with_string("unit", "MW"),
        )
        .expect("Failed to create file");

    storage
        .write_data(&file.id, "payload", payload)
        .expect("Failed to write payload");
    storage
        .create_time_series(
            &file.id,
            TimeSeriesMetadata::new(
                "ts1",
                TimeSeriesDataType::Double,
                BTreeMap::new(),
                quarter_hour_index(),
            ),
        )
        .expect("Failed to create ts1");
    storage
        .add_double_chunks(
            &file.id,
            0,
            "ts1",
            vec![
                DoubleDataChunk::new(2, vec![1.0, 2.0]),
                DoubleDataChunk::new(5, vec![3.0]),
            ],
        )
        .expect("Failed to add double chunks");
    storage
        .create_time_series(
            &file.id,
            TimeSeriesMetadata::new(
                "ts2",
                TimeSeriesDataType::String,
                BTreeMap::new(),
                quarter_hour_index(),
            ),
        )
        .expect("Failed to create ts2");
    storage
        .add_string_chunks(
            &file.id,
            0,
            "ts2",
            vec![
                StringDataChunk::new(2, vec!["a".to_string(), "b".to_string()]),
                StringDataChunk::new(5, vec!["c".to_string()]),
            ],
        )
        .expect("Failed to add string chunks");
    storage
        .add_dependency(&file.id, "input", &dir1.id)
        .expect("Failed to add dependency");

    for node in [&dir1, &dir2, &file] {
        storage
            .mark_consistent(&node.id)
            .expect("Failed to mark node consistent");
    }
    storage.flush().expect("Failed to flush");

    SampleTree {
        root,
        dir1,
        dir2,
        file,
    }
}

/// Random bytes for payload tests.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}
