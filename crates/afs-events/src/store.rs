//! Durable per-topic event log.
//!
//! Each published event gets a global sequence number and is written to
//! the `event_log` column family under `{sequence:020}`. Secondary index
//! column families map `{topic}\0{sequence:020}` and
//! `{group}\0{sequence:020}` back to the sequence, so a topic or a group
//! replays in publish order with a prefix scan. After the write commits
//! the event is fanned out to live listeners through an inner
//! `InMemoryEventsBus`.

use afs_types::{EventsSettings, NodeEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

use crate::bus::{EventsBus, InMemoryEventsBus, ListenerId, Subscription, TopicFilter};
use crate::error::EventsError;

/// Column family holding the events, keyed by sequence
pub const CF_EVENT_LOG: &str = "event_log";

/// Column family indexing events by topic
pub const CF_EVENT_TOPICS: &str = "event_topics";

/// Column family indexing events by grouping key
pub const CF_EVENT_GROUPS: &str = "event_groups";

const ALL_CF_NAMES: &[&str] = &[CF_EVENT_LOG, CF_EVENT_TOPICS, CF_EVENT_GROUPS];

const SEQUENCE_WIDTH: usize = 20;

/// An event as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub sequence: u64,
    pub topic: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub recorded_at: DateTime<Utc>,
    pub event: NodeEvent,
}

fn sequence_key(sequence: u64) -> Vec<u8> {
    format!("{:020}", sequence).into_bytes()
}

fn index_key(prefix: &str, sequence: u64) -> Vec<u8> {
    format!("{}\0{:020}", prefix, sequence).into_bytes()
}

fn index_prefix(prefix: &str) -> Vec<u8> {
    format!("{}\0", prefix).into_bytes()
}

fn parse_sequence(key: &[u8]) -> Result<u64, EventsError> {
    if key.len() < SEQUENCE_WIDTH {
        return Err(EventsError::Key(format!(
            "Key too short for a sequence: {} bytes",
            key.len()
        )));
    }
    let tail = &key[key.len() - SEQUENCE_WIDTH..];
    std::str::from_utf8(tail)
        .map_err(|e| EventsError::Key(format!("Invalid UTF-8: {}", e)))?
        .parse()
        .map_err(|e| EventsError::Key(format!("Invalid sequence: {}", e)))
}

/// Event bus that records every event before delivering it.
pub struct EventsStore {
    db: DB,
    next_sequence: AtomicU64,
    // Serializes sequence assignment, the log write and the fan-out.
    write_lock: Mutex<()>,
    bus: InMemoryEventsBus,
}

impl EventsStore {
    /// Open the event log at the given path, creating it if necessary.
    pub fn open(path: &Path, settings: &EventsSettings) -> Result<Self, EventsError> {
        info!("Opening event log at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut log_opts = Options::default();
        log_opts.set_compression_type(rocksdb::DBCompressionType::Zstd);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENT_LOG, log_opts),
            ColumnFamilyDescriptor::new(CF_EVENT_TOPICS, Options::default()),
            ColumnFamilyDescriptor::new(CF_EVENT_GROUPS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let next_sequence = Self::load_next_sequence(&db)?;

        Ok(Self {
            db,
            next_sequence: AtomicU64::new(next_sequence),
            write_lock: Mutex::new(()),
            bus: InMemoryEventsBus::from_settings(settings),
        })
    }

    fn load_next_sequence(db: &DB) -> Result<u64, EventsError> {
        let cf = db
            .cf_handle(CF_EVENT_LOG)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(CF_EVENT_LOG.to_string()))?;

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            return Ok(parse_sequence(&key)? + 1);
        }
        Ok(0)
    }

    /// Record an event under its topic and optional grouping key, then
    /// deliver it to live listeners. Returns the assigned sequence.
    #[instrument(skip(self, event), fields(node_id = %event.node_id()))]
    pub fn push_grouped_event(
        &self,
        event: NodeEvent,
        topic: &str,
        group: Option<&str>,
    ) -> Result<u64, EventsError> {
        let log_cf = self
            .db
            .cf_handle(CF_EVENT_LOG)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(CF_EVENT_LOG.to_string()))?;
        let topics_cf = self
            .db
            .cf_handle(CF_EVENT_TOPICS)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(CF_EVENT_TOPICS.to_string()))?;
        let groups_cf = self
            .db
            .cf_handle(CF_EVENT_GROUPS)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(CF_EVENT_GROUPS.to_string()))?;

        let _guard = self.write_lock.lock();
        let sequence = self.next_sequence.load(Ordering::SeqCst);

        let stored = StoredEvent {
            sequence,
            topic: topic.to_string(),
            group: group.map(str::to_string),
            recorded_at: Utc::now(),
            event,
        };
        let bytes = serde_json::to_vec(&stored)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&log_cf, sequence_key(sequence), &bytes);
        batch.put_cf(&topics_cf, index_key(topic, sequence), b"");
        if let Some(group) = group {
            batch.put_cf(&groups_cf, index_key(group, sequence), b"");
        }
        self.db.write(batch)?;
        self.next_sequence.store(sequence + 1, Ordering::SeqCst);
        debug!(sequence, topic, "Recorded event");

        self.bus.push_event(stored.event, topic)?;
        Ok(sequence)
    }

    /// Events of `topic` with sequence >= `from_sequence`, in order.
    pub fn read_topic(
        &self,
        topic: &str,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventsError> {
        let prefix = index_prefix(topic);
        let start = index_key(topic, from_sequence);
        self.read_index(CF_EVENT_TOPICS, &prefix, &start, limit)
    }

    /// All events recorded with the grouping key `group`, in order.
    pub fn read_group(&self, group: &str) -> Result<Vec<StoredEvent>, EventsError> {
        let prefix = index_prefix(group);
        self.read_index(CF_EVENT_GROUPS, &prefix, &prefix, usize::MAX)
    }

    fn read_index(
        &self,
        index_cf: &str,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventsError> {
        let cf = self
            .db
            .cf_handle(index_cf)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(index_cf.to_string()))?;
        let log_cf = self
            .db
            .cf_handle(CF_EVENT_LOG)
            .ok_or_else(|| EventsError::ColumnFamilyNotFound(CF_EVENT_LOG.to_string()))?;

        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            if results.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let sequence = parse_sequence(&key)?;
            if let Some(bytes) = self.db.get_cf(&log_cf, sequence_key(sequence))? {
                results.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(results)
    }

    /// Sequence of the most recent event, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.next_sequence.load(Ordering::SeqCst).checked_sub(1)
    }
}

impl EventsBus for EventsStore {
    fn push_event(&self, event: NodeEvent, topic: &str) -> Result<(), EventsError> {
        self.push_grouped_event(event, topic, None).map(|_| ())
    }

    fn add_listener(&self, filter: TopicFilter) -> Subscription {
        self.bus.add_listener(filter)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.bus.remove_listener(id)
    }

    fn listener_count(&self) -> usize {
        self.bus.listener_count()
    }

    fn flush(&self) -> Result<(), EventsError> {
        self.db.flush_wal(true)?;
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }
}
