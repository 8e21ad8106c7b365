//! Persistent storage: range tables, the storage facade, and the per-key
//! segment table

mod range_table;
mod segment_table;

pub use range_table::RangeTable;
pub use segment_table::{ChunkValuesIter, SegmentLock, SegmentTable};

use crate::{ChunkMeta, Result, SegmentStatus, ShiftKey, TimeRange, Timestamp};
use std::path::{Path, PathBuf};

/// Owns the data directory and the persistent tables of the engine:
///
/// - segment status: `(hash_key, segment) -> status`
/// - file lookup: `(segmented_hash_key, first_time) -> chunk metadata`
/// - latest lookup: `(hash_key, date) -> encoded value or memoized null`
/// - previous/next lookup: `(hash_key, (date, shift units)) -> encoded
///   value or memoized null`
pub struct SeriesStorage {
    dir: PathBuf,
    segment_status: RangeTable<String, TimeRange, SegmentStatus>,
    file_lookup: RangeTable<String, Timestamp, ChunkMeta>,
    latest_lookup: RangeTable<String, Timestamp, Option<Vec<u8>>>,
    previous_lookup: RangeTable<String, ShiftKey, Option<Vec<u8>>>,
    next_lookup: RangeTable<String, ShiftKey, Option<Vec<u8>>>,
}

impl SeriesStorage {
    /// Open or create the storage under a data directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("segments"))?;
        let tables = dir.join("tables");

        Ok(Self {
            segment_status: RangeTable::open(&tables, "segment_status")?,
            file_lookup: RangeTable::open(&tables, "file_lookup")?,
            latest_lookup: RangeTable::open(&tables, "latest_lookup")?,
            previous_lookup: RangeTable::open(&tables, "previous_lookup")?,
            next_lookup: RangeTable::open(&tables, "next_lookup")?,
            dir,
        })
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the chunk files, one subdirectory per segment
    pub fn segments_dir(&self) -> PathBuf {
        self.dir.join("segments")
    }

    pub fn segment_status(&self) -> &RangeTable<String, TimeRange, SegmentStatus> {
        &self.segment_status
    }

    pub fn file_lookup(&self) -> &RangeTable<String, Timestamp, ChunkMeta> {
        &self.file_lookup
    }

    pub fn latest_lookup(&self) -> &RangeTable<String, Timestamp, Option<Vec<u8>>> {
        &self.latest_lookup
    }

    pub fn previous_lookup(&self) -> &RangeTable<String, ShiftKey, Option<Vec<u8>>> {
        &self.previous_lookup
    }

    pub fn next_lookup(&self) -> &RangeTable<String, ShiftKey, Option<Vec<u8>>> {
        &self.next_lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let storage = SeriesStorage::open(dir.path()).unwrap();

        assert!(storage.segments_dir().is_dir());
        assert!(dir.path().join("tables").is_dir());
    }

    #[test]
    fn test_status_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = SeriesStorage::open(dir.path()).unwrap();

        let segment = TimeRange::new(0, 99);
        storage
            .segment_status()
            .put("k".into(), segment, SegmentStatus::Initializing)
            .unwrap();
        assert_eq!(
            storage.segment_status().get(&"k".into(), &segment),
            Some(SegmentStatus::Initializing)
        );

        storage
            .segment_status()
            .put("k".into(), segment, SegmentStatus::Complete)
            .unwrap();
        assert_eq!(
            storage.segment_status().get(&"k".into(), &segment),
            Some(SegmentStatus::Complete)
        );
    }
}
