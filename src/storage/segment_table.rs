//! Per-key segment table
//!
//! For each segmented key this table maintains the range-indexed chunk
//! metadata (via the file lookup table) and the chunk files on disk, and
//! exposes ordered value iteration across chunks, the latest-value scan,
//! segment deletion, consistency inspection, and the per-segment locks
//! shared with the lifecycle manager.

use crate::chunk::{read_records, ChunkReader};
use crate::storage::SeriesStorage;
use crate::{
    ChunkMeta, Result, SegmentedKey, SeriesError, StreamKey, Timestamp, ValueAdapter,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// One lock pair per segment: an identity mutex serializing lock
/// candidates, and the read/write lock guarding segment state.
///
/// The monitor must be taken (blocking) before attempting the timed write
/// acquisition, so the bounded `try_write_for` never competes with another
/// initialization candidate of the same segment.
pub struct SegmentLock {
    monitor: Mutex<()>,
    rw: RwLock<()>,
}

impl SegmentLock {
    fn new() -> Self {
        Self {
            monitor: Mutex::new(()),
            rw: RwLock::new(()),
        }
    }

    pub fn monitor(&self) -> &Mutex<()> {
        &self.monitor
    }

    pub fn rw(&self) -> &RwLock<()> {
        &self.rw
    }
}

/// Per-key segment table over the shared storage
pub struct SegmentTable<K: StreamKey, V> {
    storage: Arc<SeriesStorage>,
    adapter: Arc<dyn ValueAdapter<V>>,
    locks: Mutex<HashMap<String, Arc<SegmentLock>>>,
    _key: PhantomData<fn(K)>,
}

impl<K: StreamKey, V> SegmentTable<K, V> {
    pub fn new(storage: Arc<SeriesStorage>, adapter: Arc<dyn ValueAdapter<V>>) -> Self {
        Self {
            storage,
            adapter,
            locks: Mutex::new(HashMap::new()),
            _key: PhantomData,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn ValueAdapter<V>> {
        &self.adapter
    }

    /// The lock pair for a segment, created on first use
    pub fn lock_for(&self, seg: &SegmentedKey<K>) -> Arc<SegmentLock> {
        let mut locks = self.locks.lock();
        locks
            .entry(seg.hash_key())
            .or_insert_with(|| Arc::new(SegmentLock::new()))
            .clone()
    }

    /// Directory holding the chunk files of a segment
    pub fn segment_dir(&self, seg: &SegmentedKey<K>) -> PathBuf {
        self.storage.segments_dir().join(seg.hash_key())
    }

    /// Crash marker path of a segment; present while an update runs
    pub fn update_lock_path(&self, seg: &SegmentedKey<K>) -> PathBuf {
        self.segment_dir(seg).join("update.lock")
    }

    /// Allocate the path for a new chunk file keyed by its first time
    pub fn new_chunk_path(&self, seg: &SegmentedKey<K>, first_time: Timestamp) -> Result<PathBuf> {
        let dir = self.segment_dir(seg);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("chunk_{}.dat", first_time)))
    }

    /// Register a finished chunk file in the file lookup table
    pub fn finish_chunk(&self, seg: &SegmentedKey<K>, meta: ChunkMeta) -> Result<()> {
        self.storage
            .file_lookup()
            .put(seg.hash_key(), meta.first_time, meta)
    }

    /// Chunk metadata rows of a segment, ascending by first time
    pub fn chunk_rows(&self, seg: &SegmentedKey<K>) -> Vec<(Timestamp, ChunkMeta)> {
        self.storage.file_lookup().range(&seg.hash_key())
    }

    /// Ordered forward iterator over the values of `[from, to]`
    pub fn range_values(
        &self,
        seg: &SegmentedKey<K>,
        from: Timestamp,
        to: Timestamp,
    ) -> ChunkValuesIter<V> {
        ChunkValuesIter::new(
            self.select_chunks(seg, from, to),
            self.adapter.clone(),
            from,
            to,
            false,
        )
    }

    /// Ordered reverse iterator over the values of `[from, to]`
    pub fn range_values_reverse(
        &self,
        seg: &SegmentedKey<K>,
        from: Timestamp,
        to: Timestamp,
    ) -> ChunkValuesIter<V> {
        let mut chunks = self.select_chunks(seg, from, to);
        chunks.reverse();
        ChunkValuesIter::new(chunks, self.adapter.clone(), from, to, true)
    }

    fn select_chunks(
        &self,
        seg: &SegmentedKey<K>,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<ChunkMeta> {
        self.chunk_rows(seg)
            .into_iter()
            .filter(|(_, meta)| meta.first_time <= to && meta.last_time >= from)
            .map(|(_, meta)| meta)
            .collect()
    }

    /// The value with the greatest time <= t, or None if the segment holds
    /// no value at or before t
    pub fn latest_value(&self, seg: &SegmentedKey<K>, t: Timestamp) -> Result<Option<V>> {
        let row = self.storage.file_lookup().latest(&seg.hash_key(), &t);
        let meta = match row {
            Some((_, meta)) => meta,
            None => return Ok(None),
        };
        let mut latest = None;
        for record in ChunkReader::open(&meta.path, self.adapter.fixed_length(), None)? {
            let value = self.adapter.decode(&record?)?;
            if self.adapter.extract_time(&value) > t {
                break;
            }
            latest = Some(value);
        }
        Ok(latest)
    }

    /// Remove all chunks and metadata of a segment, including a leftover
    /// crash marker
    pub fn delete_segment(&self, seg: &SegmentedKey<K>) -> Result<()> {
        let dir = self.segment_dir(seg);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SeriesError::Io(e)),
        }
        self.storage.file_lookup().delete_range(&seg.hash_key())?;
        Ok(())
    }

    /// True if the segment has no chunks, or any declared chunk file is
    /// missing, unreadable or empty
    pub fn is_empty_or_inconsistent(&self, seg: &SegmentedKey<K>) -> bool {
        let rows = self.chunk_rows(seg);
        if rows.is_empty() {
            return true;
        }
        for (_, meta) in rows {
            match std::fs::metadata(&meta.path) {
                Ok(m) if m.len() > 0 => {}
                _ => return true,
            }
        }
        false
    }

    /// Determine where an update resumes and which values of the last
    /// chunk must be rewritten.
    ///
    /// With `redo_last_file` the last chunk is removed and its values are
    /// handed back for rewriting; the resume point is the end time of the
    /// last stored value either way.
    pub fn prepare_for_update(
        &self,
        seg: &SegmentedKey<K>,
        redo_last_file: bool,
    ) -> Result<(Option<Timestamp>, Vec<V>)> {
        let hash = seg.hash_key();
        let last = match self.storage.file_lookup().last_row(&hash) {
            Some(row) => row,
            None => return Ok((None, Vec::new())),
        };
        let (first_time, meta) = last;
        if !redo_last_file {
            return Ok((Some(meta.last_time), Vec::new()));
        }
        let mut values = Vec::new();
        for record in read_records(&meta.path, self.adapter.fixed_length(), None)? {
            values.push(self.adapter.decode(&record)?);
        }
        self.storage.file_lookup().delete(&hash, &first_time)?;
        match std::fs::remove_file(&meta.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SeriesError::Io(e)),
        }
        let update_from = values.last().map(|v| self.adapter.extract_end_time(v));
        Ok((update_from, values))
    }
}

enum RecordStream {
    Forward(ChunkReader),
    Reverse(std::iter::Rev<std::vec::IntoIter<Vec<u8>>>),
}

impl Iterator for RecordStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RecordStream::Forward(reader) => reader.next(),
            RecordStream::Reverse(records) => records.next().map(Ok),
        }
    }
}

/// Ordered value iterator across the chunks of one segment, clipped per
/// record by the extracted time
pub struct ChunkValuesIter<V> {
    adapter: Arc<dyn ValueAdapter<V>>,
    chunks: std::vec::IntoIter<ChunkMeta>,
    current: Option<RecordStream>,
    from: Timestamp,
    to: Timestamp,
    reverse: bool,
    done: bool,
}

impl<V> ChunkValuesIter<V> {
    fn new(
        chunks: Vec<ChunkMeta>,
        adapter: Arc<dyn ValueAdapter<V>>,
        from: Timestamp,
        to: Timestamp,
        reverse: bool,
    ) -> Self {
        Self {
            adapter,
            chunks: chunks.into_iter(),
            current: None,
            from,
            to,
            reverse,
            done: from > to,
        }
    }

    fn open_next_chunk(&mut self) -> Result<bool> {
        let meta = match self.chunks.next() {
            Some(meta) => meta,
            None => return Ok(false),
        };
        let fixed = self.adapter.fixed_length();
        let stream = if self.reverse {
            let records = read_records(&meta.path, fixed, None)?;
            RecordStream::Reverse(records.into_iter().rev())
        } else {
            RecordStream::Forward(ChunkReader::open(&meta.path, fixed, None)?)
        };
        self.current = Some(stream);
        Ok(true)
    }
}

impl<V> Iterator for ChunkValuesIter<V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let record = match self.current.as_mut().and_then(|s| s.next()) {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    match self.open_next_chunk() {
                        Ok(true) => continue,
                        Ok(false) => {
                            self.done = true;
                            return None;
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
            };
            let value = match self.adapter.decode(&record) {
                Ok(value) => value,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let time = self.adapter.extract_time(&value);
            if self.reverse {
                if time > self.to {
                    continue;
                }
                if time < self.from {
                    self.done = true;
                    return None;
                }
            } else {
                if time < self.from {
                    continue;
                }
                if time > self.to {
                    self.done = true;
                    return None;
                }
            }
            return Some(Ok(value));
        }
    }
}
