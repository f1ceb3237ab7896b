//! Time-series metadata, indexes and data chunks.
//!
//! A series is declared once with its index (the ordered list of time
//! points). Values arrive later as chunks: dense runs of values starting
//! at an offset into the index. Points no chunk covers read back as
//! missing (NaN for doubles, `None` for strings).

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::AfsError;

/// Value type carried by a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeSeriesDataType {
    Double,
    String,
}

impl std::fmt::Display for TimeSeriesDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeSeriesDataType::Double => write!(f, "DOUBLE"),
            TimeSeriesDataType::String => write!(f, "STRING"),
        }
    }
}

/// Time points of a series, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeSeriesIndex {
    /// `point_count` instants starting at `start_ms`, `spacing_ms` apart
    Regular {
        start_ms: i64,
        spacing_ms: i64,
        point_count: usize,
    },
    /// Explicit strictly increasing instants
    Irregular { instants_ms: Vec<i64> },
}

impl TimeSeriesIndex {
    /// Regular index covering the inclusive interval `[start, end]`.
    pub fn regular(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        spacing: Duration,
    ) -> Result<Self, AfsError> {
        let spacing_ms = spacing.num_milliseconds();
        if spacing_ms <= 0 {
            return Err(AfsError::InvalidInput(format!(
                "index spacing must be positive, got {} ms",
                spacing_ms
            )));
        }
        let span_ms = end.timestamp_millis() - start.timestamp_millis();
        if span_ms < 0 {
            return Err(AfsError::InvalidInput(format!(
                "index end {} is before start {}",
                end, start
            )));
        }
        Ok(TimeSeriesIndex::Regular {
            start_ms: start.timestamp_millis(),
            spacing_ms,
            point_count: (span_ms / spacing_ms) as usize + 1,
        })
    }

    /// Irregular index from explicit instants.
    pub fn irregular(instants: &[DateTime<Utc>]) -> Result<Self, AfsError> {
        let index = TimeSeriesIndex::Irregular {
            instants_ms: instants.iter().map(|t| t.timestamp_millis()).collect(),
        };
        index.validate()?;
        Ok(index)
    }

    /// Check an index that may have come from outside (deserialized, hand-built).
    pub fn validate(&self) -> Result<(), AfsError> {
        match self {
            TimeSeriesIndex::Regular {
                spacing_ms,
                point_count,
                ..
            } => {
                if *spacing_ms <= 0 {
                    return Err(AfsError::InvalidInput(format!(
                        "index spacing must be positive, got {} ms",
                        spacing_ms
                    )));
                }
                if *point_count == 0 {
                    return Err(AfsError::InvalidInput("index has no points".to_string()));
                }
            }
            TimeSeriesIndex::Irregular { instants_ms } => {
                if instants_ms.is_empty() {
                    return Err(AfsError::InvalidInput("index has no points".to_string()));
                }
                if instants_ms.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(AfsError::InvalidInput(
                        "irregular index instants must be strictly increasing".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        match self {
            TimeSeriesIndex::Regular { point_count, .. } => *point_count,
            TimeSeriesIndex::Irregular { instants_ms } => instants_ms.len(),
        }
    }

    /// Instant of the point at `point`, if inside the index.
    pub fn instant_at(&self, point: usize) -> Option<DateTime<Utc>> {
        let ms = match self {
            TimeSeriesIndex::Regular {
                start_ms,
                spacing_ms,
                point_count,
            } => {
                if point >= *point_count {
                    return None;
                }
                start_ms + spacing_ms * point as i64
            }
            TimeSeriesIndex::Irregular { instants_ms } => *instants_ms.get(point)?,
        };
        Utc.timestamp_millis_opt(ms).single()
    }
}

/// Declaration of a series on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesMetadata {
    pub name: String,
    pub data_type: TimeSeriesDataType,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub index: TimeSeriesIndex,
}

impl TimeSeriesMetadata {
    pub fn new(
        name: impl Into<String>,
        data_type: TimeSeriesDataType,
        tags: BTreeMap<String, String>,
        index: TimeSeriesIndex,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            tags,
            index,
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

/// A dense run of values starting at an offset into a series index.
pub trait DataChunk: Clone + Serialize + DeserializeOwned {
    type Value: Clone;

    /// Data type of the series this chunk can be appended to.
    const DATA_TYPE: TimeSeriesDataType;

    fn offset(&self) -> usize;

    fn values(&self) -> &[Self::Value];

    fn len(&self) -> usize {
        self.values().len()
    }

    fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// First point after the chunk.
    fn end(&self) -> usize {
        self.offset() + self.len()
    }
}

/// Chunk of double values. Non-finite values are stored as tagged strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleDataChunk {
    pub offset: usize,
    #[serde(with = "crate::float::seq")]
    pub values: Vec<f64>,
}

impl DoubleDataChunk {
    pub fn new(offset: usize, values: Vec<f64>) -> Self {
        Self { offset, values }
    }
}

impl DataChunk for DoubleDataChunk {
    type Value = f64;
    const DATA_TYPE: TimeSeriesDataType = TimeSeriesDataType::Double;

    fn offset(&self) -> usize {
        self.offset
    }

    fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Chunk of string values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringDataChunk {
    pub offset: usize,
    pub values: Vec<String>,
}

impl StringDataChunk {
    pub fn new(offset: usize, values: Vec<String>) -> Self {
        Self { offset, values }
    }
}

impl DataChunk for StringDataChunk {
    type Value = String;
    const DATA_TYPE: TimeSeriesDataType = TimeSeriesDataType::String;

    fn offset(&self) -> usize {
        self.offset
    }

    fn values(&self) -> &[String] {
        &self.values
    }
}

/// Reasons a chunk cannot be appended to a series.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Empty chunk at offset {offset}")]
    Empty { offset: usize },

    #[error("Chunk offset {offset} is beyond the last index point {last}")]
    OffsetOutOfRange { offset: usize, last: usize },

    #[error("Chunk [{offset}, {end}) runs past an index of {point_count} points")]
    PastIndexEnd {
        offset: usize,
        end: usize,
        point_count: usize,
    },

    #[error("Chunk at offset {offset} overlaps chunk at offset {other}")]
    Overlap { offset: usize, other: usize },
}

impl ChunkError {
    pub fn is_overlap(&self) -> bool {
        matches!(self, ChunkError::Overlap { .. })
    }
}

/// Validate chunks to be appended against the index and the chunks
/// already stored for the same series and version.
pub fn check_chunks<C: DataChunk>(
    index: &TimeSeriesIndex,
    existing: &[C],
    added: &[C],
) -> Result<(), ChunkError> {
    let point_count = index.point_count();
    for chunk in added {
        if chunk.is_empty() {
            return Err(ChunkError::Empty {
                offset: chunk.offset(),
            });
        }
        if chunk.offset() >= point_count {
            return Err(ChunkError::OffsetOutOfRange {
                offset: chunk.offset(),
                last: point_count.saturating_sub(1),
            });
        }
        if chunk.end() > point_count {
            return Err(ChunkError::PastIndexEnd {
                offset: chunk.offset(),
                end: chunk.end(),
                point_count,
            });
        }
    }

    let mut ranges: Vec<(usize, usize)> = existing
        .iter()
        .chain(added.iter())
        .map(|c| (c.offset(), c.end()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.0 < prev.1 {
            return Err(ChunkError::Overlap {
                offset: next.0,
                other: prev.0,
            });
        }
    }
    Ok(())
}

/// Expand double chunks into one value per index point, NaN where absent.
pub fn materialize_doubles(point_count: usize, chunks: &[DoubleDataChunk]) -> Vec<f64> {
    fill_points(point_count, chunks, f64::NAN, |v| *v)
}

/// Expand string chunks into one value per index point, `None` where absent.
pub fn materialize_strings(point_count: usize, chunks: &[StringDataChunk]) -> Vec<Option<String>> {
    fill_points(point_count, chunks, None, |v| Some(v.clone()))
}

fn fill_points<C, P, F>(point_count: usize, chunks: &[C], fill: P, map: F) -> Vec<P>
where
    C: DataChunk,
    P: Clone,
    F: Fn(&C::Value) -> P,
{
    let mut points = vec![fill; point_count];
    for chunk in chunks {
        for (i, value) in chunk.values().iter().enumerate() {
            if let Some(slot) = points.get_mut(chunk.offset() + i) {
                *slot = map(value);
            }
        }
    }
    points
}
