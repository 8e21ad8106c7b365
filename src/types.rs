//! Core types and user-supplied contracts for SeriesDB

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Smallest representable timestamp
pub const MIN_TIME: Timestamp = i64::MIN;

/// Largest representable timestamp
pub const MAX_TIME: Timestamp = i64::MAX;

/// An inclusive time range identifying one segment of a series
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end)
    }
}

/// Initialization status of a segment, persisted in the status table.
///
/// A missing row means the segment was never attempted. `Initializing`
/// observed by a later reader means a crash left partial data behind that
/// must be purged before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Initializing,
    Complete,
}

/// User key of a series. The hash key is the stable string identity under
/// which all persistent state of the series is filed.
pub trait StreamKey: Clone + Send + Sync + 'static {
    fn hash_key(&self) -> String;
}

impl StreamKey for String {
    fn hash_key(&self) -> String {
        self.clone()
    }
}

/// Identifies one segment of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentedKey<K: StreamKey> {
    /// User key
    pub key: K,
    /// Segment time range
    pub segment: TimeRange,
}

impl<K: StreamKey> SegmentedKey<K> {
    /// Create a new segmented key
    pub fn new(key: K, segment: TimeRange) -> Self {
        Self { key, segment }
    }

    /// Stable string identity of this segment
    pub fn hash_key(&self) -> String {
        format!(
            "{}/{}_{}",
            self.key.hash_key(),
            self.segment.start,
            self.segment.end
        )
    }
}

impl<K: StreamKey> fmt::Display for SegmentedKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash_key())
    }
}

/// Metadata for one flushed chunk file. The range key of the file lookup
/// table is `first_time`; chunks of a segment are ordered by it and do not
/// overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Chunk file path
    pub path: std::path::PathBuf,
    /// Time of the first record
    pub first_time: Timestamp,
    /// End time of the last record
    pub last_time: Timestamp,
    /// Encoded first record
    pub first_value: Vec<u8>,
    /// Encoded last record
    pub last_value: Vec<u8>,
}

/// Range key of the previous/next lookup tables: (date, shift units)
/// ordered lexicographically
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShiftKey {
    pub time: Timestamp,
    pub units: u32,
}

impl ShiftKey {
    pub fn new(time: Timestamp, units: u32) -> Self {
        Self { time, units }
    }
}

/// Value codec plus time extraction, supplied by the user
pub trait ValueAdapter<V>: Send + Sync {
    /// Time point of a value
    fn extract_time(&self, value: &V) -> Timestamp;

    /// End time point of a value; defaults to the time point
    fn extract_end_time(&self, value: &V) -> Timestamp {
        self.extract_time(value)
    }

    /// Serialize a value
    fn encode(&self, value: &V) -> Result<Vec<u8>>;

    /// Deserialize a value. Codec version faults should surface as
    /// [`crate::SeriesError::Corruption`] so the consistency inspector can
    /// schedule a rebuild.
    fn decode(&self, bytes: &[u8]) -> Result<V>;

    /// Fixed record length in bytes, or None for length-prefixed records
    fn fixed_length(&self) -> Option<usize> {
        None
    }
}

/// Source of truth for segment contents and availability bounds, supplied
/// by the user
pub trait SegmentSource<K: StreamKey, V>: Send + Sync {
    /// Lazy iterator over the elements of `[from, to]` for the key
    fn download_segment_elements(
        &self,
        key: &K,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = V> + Send>>;

    /// Start of the availability window for the key
    fn first_available_segment_from(&self, key: &K) -> Timestamp;

    /// End of the availability window for the key
    fn last_available_segment_to(&self, key: &K) -> Timestamp;
}

/// Deterministic segment tiling. For any timestamp the finder returns the
/// segment containing it; segments of one series either coincide or are
/// disjoint and tile time monotonically.
pub trait SegmentFinder: Send + Sync {
    fn segment_for(&self, t: Timestamp) -> TimeRange;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(150));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
    }

    #[test]
    fn test_segmented_key_hash() {
        let key = SegmentedKey::new("series-a".to_string(), TimeRange::new(0, 99));
        assert_eq!(key.hash_key(), "series-a/0_99");
    }

    #[test]
    fn test_shift_key_ordering() {
        let a = ShiftKey::new(100, 1);
        let b = ShiftKey::new(100, 2);
        let c = ShiftKey::new(200, 1);

        assert!(a < b);
        assert!(b < c);
    }
}
