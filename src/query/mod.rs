//! Historical query layer
//!
//! Per-key cache over the segmented storage: range scans that enumerate,
//! initialize and flatten the covered segments lazily, plus memoized
//! latest/previous/next lookups layered over bounded in-memory caches and
//! the persistent lookup tables.

mod lookup_cache;

pub use lookup_cache::{EvictionMode, LookupCache};

use crate::segment::{ForwardSegments, ReverseSegments, SegmentLifecycle};
use crate::storage::{ChunkValuesIter, SegmentTable, SeriesStorage};
use crate::{
    config, Result, SegmentFinder, SegmentSource, SegmentStatus, SegmentedKey, SeriesError,
    ShiftKey, StreamKey, TimeRange, Timestamp, ValueAdapter, MAX_TIME, MIN_TIME,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Per-key historical query cache
pub struct SegmentCache<K: StreamKey, V: Clone + Send + 'static> {
    key: K,
    hash_key: String,
    storage: Arc<SeriesStorage>,
    table: Arc<SegmentTable<K, V>>,
    adapter: Arc<dyn ValueAdapter<V>>,
    source: Arc<dyn SegmentSource<K, V>>,
    finder: Arc<dyn SegmentFinder>,
    lifecycle: SegmentLifecycle<K, V>,
    latest_cache: LookupCache<Timestamp, Option<Vec<u8>>>,
    previous_cache: LookupCache<(Timestamp, u32), Option<Vec<u8>>>,
    next_cache: LookupCache<(Timestamp, u32), Option<Vec<u8>>>,
    cached_first_value: Mutex<Option<Option<V>>>,
    cached_last_value: Mutex<Option<Option<V>>>,
    // serializes delete_all/prepare_for_update against themselves
    mutate_lock: Mutex<()>,
}

impl<K: StreamKey, V: Clone + Send + 'static> SegmentCache<K, V> {
    pub fn open(
        storage: Arc<SeriesStorage>,
        key: K,
        source: Arc<dyn SegmentSource<K, V>>,
        adapter: Arc<dyn ValueAdapter<V>>,
        finder: Arc<dyn SegmentFinder>,
    ) -> Self {
        Self::open_with_eviction(storage, key, source, adapter, finder, EvictionMode::Lru)
    }

    pub fn open_with_eviction(
        storage: Arc<SeriesStorage>,
        key: K,
        source: Arc<dyn SegmentSource<K, V>>,
        adapter: Arc<dyn ValueAdapter<V>>,
        finder: Arc<dyn SegmentFinder>,
        eviction: EvictionMode,
    ) -> Self {
        let table = Arc::new(SegmentTable::new(storage.clone(), adapter.clone()));
        let lifecycle = SegmentLifecycle::new(storage.clone(), table.clone(), source.clone());
        let hash_key = key.hash_key();
        Self {
            key,
            hash_key,
            storage,
            table,
            adapter,
            source,
            finder,
            lifecycle,
            latest_cache: LookupCache::new(config::LOOKUP_CACHE_SIZE, eviction),
            previous_cache: LookupCache::new(config::LOOKUP_CACHE_SIZE, eviction),
            next_cache: LookupCache::new(config::LOOKUP_CACHE_SIZE, eviction),
            cached_first_value: Mutex::new(None),
            cached_last_value: Mutex::new(None),
            mutate_lock: Mutex::new(()),
        }
    }

    /// Replace the lifecycle configuration (retry policy, parallel writes)
    pub fn with_lifecycle(mut self, lifecycle: SegmentLifecycle<K, V>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    pub fn storage(&self) -> &Arc<SeriesStorage> {
        &self.storage
    }

    pub fn table(&self) -> &Arc<SegmentTable<K, V>> {
        &self.table
    }

    pub fn adapter(&self) -> &Arc<dyn ValueAdapter<V>> {
        &self.adapter
    }

    pub fn source(&self) -> &Arc<dyn SegmentSource<K, V>> {
        &self.source
    }

    pub fn finder(&self) -> &Arc<dyn SegmentFinder> {
        &self.finder
    }

    pub fn lifecycle(&self) -> &SegmentLifecycle<K, V> {
        &self.lifecycle
    }

    /// Ordered forward iteration over `[from, to]`, spanning segments
    pub fn read_range_values(&self, from: Timestamp, to: Timestamp) -> RangeValuesIter<K, V> {
        let lower = from.max(self.source.first_available_segment_from(&self.key));
        let upper = to.min(self.source.last_available_segment_to(&self.key));
        RangeValuesIter {
            key: self.key.clone(),
            lifecycle: self.lifecycle.clone(),
            table: self.table.clone(),
            segments: SegmentStream::Forward(ForwardSegments::new(
                self.finder.clone(),
                lower,
                upper,
            )),
            lower,
            upper,
            current: None,
            done: lower > upper,
        }
    }

    /// Ordered reverse iteration from `from` down to `to`
    pub fn read_range_values_reverse(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> RangeValuesIter<K, V> {
        let upper = from.min(self.source.last_available_segment_to(&self.key));
        let lower = to.max(self.source.first_available_segment_from(&self.key));
        RangeValuesIter {
            key: self.key.clone(),
            lifecycle: self.lifecycle.clone(),
            table: self.table.clone(),
            segments: SegmentStream::Reverse(ReverseSegments::new(
                self.finder.clone(),
                lower,
                upper,
            )),
            lower,
            upper,
            current: None,
            done: lower > upper,
        }
    }

    /// The value with the greatest time <= date, falling back to the first
    /// value when the date predates all data. Memoized serialized, both
    /// in memory and in the persistent lookup table.
    pub fn get_latest_value(&self, date: Timestamp) -> Result<Option<V>> {
        let encoded = self.latest_cache.get_or_try_insert(date, || {
            self.storage
                .latest_lookup()
                .get_or_load(&self.hash_key, &date, || self.load_latest_value(date))
        })?;
        self.decode_opt(encoded)
    }

    fn load_latest_value(&self, date: Timestamp) -> Result<Option<Vec<u8>>> {
        let lower = self.source.first_available_segment_from(&self.key);
        let upper = date.min(self.source.last_available_segment_to(&self.key));
        let mut segments = ReverseSegments::new(self.finder.clone(), lower, upper);
        for segment in &mut segments {
            let seg = SegmentedKey::new(self.key.clone(), segment?);
            self.lifecycle.ensure(&seg)?;
            // the first segment that can contribute a value at or before
            // the date holds the overall latest one
            if let Some(value) = self.table.latest_value(&seg, date)? {
                return Ok(Some(self.adapter.encode(&value)?));
            }
        }
        match self.get_first_value()? {
            Some(value) => Ok(Some(self.adapter.encode(&value)?)),
            None => Ok(None),
        }
    }

    /// The n-th value before the date, or None if fewer than n exist
    pub fn get_previous_value(&self, date: Timestamp, shift_back_units: u32) -> Result<Option<V>> {
        self.assert_shift_units(shift_back_units)?;
        let encoded = self
            .previous_cache
            .get_or_try_insert((date, shift_back_units), || {
                let shift_key = ShiftKey::new(date, shift_back_units);
                self.storage
                    .previous_lookup()
                    .get_or_load(&self.hash_key, &shift_key, || {
                        self.walk(self.read_range_values_reverse(date, MIN_TIME), shift_back_units)
                    })
            })?;
        self.decode_opt(encoded)
    }

    /// The n-th value after the date, or None if fewer than n exist
    pub fn get_next_value(&self, date: Timestamp, shift_forward_units: u32) -> Result<Option<V>> {
        self.assert_shift_units(shift_forward_units)?;
        let encoded = self
            .next_cache
            .get_or_try_insert((date, shift_forward_units), || {
                let shift_key = ShiftKey::new(date, shift_forward_units);
                self.storage
                    .next_lookup()
                    .get_or_load(&self.hash_key, &shift_key, || {
                        self.walk(self.read_range_values(date, MAX_TIME), shift_forward_units)
                    })
            })?;
        self.decode_opt(encoded)
    }

    fn walk(&self, mut iter: RangeValuesIter<K, V>, units: u32) -> Result<Option<Vec<u8>>> {
        let mut value = None;
        for _ in 0..units {
            match iter.next() {
                Some(next) => value = Some(next?),
                // fewer values than shift units exist
                None => return Ok(None),
            }
        }
        match value {
            Some(value) => Ok(Some(self.adapter.encode(&value)?)),
            None => Ok(None),
        }
    }

    /// First value of the series, cached set-once until the next mutation
    pub fn get_first_value(&self) -> Result<Option<V>> {
        if let Some(cached) = self.cached_first_value.lock().clone() {
            return Ok(cached);
        }
        let first_available = self.source.first_available_segment_from(&self.key);
        let segment = self.finder.segment_for(first_available);
        let seg = SegmentedKey::new(self.key.clone(), segment);
        self.lifecycle.ensure(&seg)?;
        let first = match self.storage.file_lookup().first_row(&seg.hash_key()) {
            Some((_, meta)) => Some(self.adapter.decode(&meta.first_value)?),
            None => None,
        };
        let mut guard = self.cached_first_value.lock();
        if guard.is_none() {
            *guard = Some(first.clone());
        }
        Ok(first)
    }

    /// Last value of the series, cached set-once until the next mutation
    pub fn get_last_value(&self) -> Result<Option<V>> {
        if let Some(cached) = self.cached_last_value.lock().clone() {
            return Ok(cached);
        }
        let last_available = self.source.last_available_segment_to(&self.key);
        let segment = self.finder.segment_for(last_available);
        let seg = SegmentedKey::new(self.key.clone(), segment);
        self.lifecycle.ensure(&seg)?;
        let last = match self.storage.file_lookup().last_row(&seg.hash_key()) {
            Some((_, meta)) => Some(self.adapter.decode(&meta.last_value)?),
            None => None,
        };
        let mut guard = self.cached_last_value.lock();
        if guard.is_none() {
            *guard = Some(last.clone());
        }
        Ok(last)
    }

    /// Drop the lookup rows an upcoming update can invalidate and clear
    /// the in-memory caches
    pub fn prepare_for_update(&self) -> Result<()> {
        let _serialized = self.mutate_lock.lock();
        let last = self.get_last_value()?;
        if let Some(last) = last {
            let last_time = self.adapter.extract_time(&last);
            self.storage
                .latest_lookup()
                .delete_range_from(&self.hash_key, &last_time)?;
            // shift keys can reach arbitrarily far, drop all next rows
            self.storage.next_lookup().delete_range(&self.hash_key)?;
            self.storage
                .previous_lookup()
                .delete_range_from(&self.hash_key, &ShiftKey::new(last_time, 0))?;
        }
        self.clear_caches();
        Ok(())
    }

    /// Delete all segments, lookup rows and chunk files of this key
    pub fn delete_all(&self) -> Result<()> {
        let _serialized = self.mutate_lock.lock();
        for (segment, _status) in self.storage.segment_status().range(&self.hash_key) {
            self.table
                .delete_segment(&SegmentedKey::new(self.key.clone(), segment))?;
        }
        self.storage.segment_status().delete_range(&self.hash_key)?;
        self.storage.latest_lookup().delete_range(&self.hash_key)?;
        self.storage.next_lookup().delete_range(&self.hash_key)?;
        self.storage.previous_lookup().delete_range(&self.hash_key)?;
        self.clear_caches();
        Ok(())
    }

    pub(crate) fn clear_caches(&self) {
        self.latest_cache.clear();
        self.previous_cache.clear();
        self.next_cache.clear();
        *self.cached_first_value.lock() = None;
        *self.cached_last_value.lock() = None;
    }

    /// True if the series holds no data, or its persisted data cannot be
    /// read back (a rebuild is needed)
    pub fn is_empty_or_inconsistent(&self) -> Result<bool> {
        match self.get_first_value().and_then(|_| self.get_last_value()) {
            Ok(_) => {}
            Err(e) if e.is_corruption() => {
                warn!(
                    hash_key = %self.hash_key,
                    error = %e,
                    "series data is inconsistent and needs to be reset"
                );
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
        let rows = self.storage.segment_status().range(&self.hash_key);
        if rows.is_empty() {
            return Ok(true);
        }
        for (segment, status) in rows {
            if status == SegmentStatus::Complete
                && self
                    .table
                    .is_empty_or_inconsistent(&SegmentedKey::new(self.key.clone(), segment))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn assert_shift_units(&self, shift_units: u32) -> Result<()> {
        if shift_units == 0 {
            return Err(SeriesError::InvalidArgument(format!(
                "shift units needs to be a positive non zero value: {}",
                shift_units
            )));
        }
        Ok(())
    }

    fn decode_opt(&self, encoded: Option<Vec<u8>>) -> Result<Option<V>> {
        match encoded {
            Some(bytes) => Ok(Some(self.adapter.decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

enum SegmentStream {
    Forward(ForwardSegments),
    Reverse(ReverseSegments),
}

impl Iterator for SegmentStream {
    type Item = Result<TimeRange>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SegmentStream::Forward(segments) => segments.next(),
            SegmentStream::Reverse(segments) => segments.next(),
        }
    }
}

/// Lazy flattened value iterator across the segments of a window.
///
/// Each covered segment is initialized on first touch, then its values
/// stream through clipped to the window.
pub struct RangeValuesIter<K: StreamKey, V: Clone + Send + 'static> {
    key: K,
    lifecycle: SegmentLifecycle<K, V>,
    table: Arc<SegmentTable<K, V>>,
    segments: SegmentStream,
    lower: Timestamp,
    upper: Timestamp,
    current: Option<ChunkValuesIter<V>>,
    done: bool,
}

impl<K: StreamKey, V: Clone + Send + 'static> Iterator for RangeValuesIter<K, V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(value)) => return Some(Ok(value)),
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let segment = match self.segments.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(segment)) => segment,
            };
            let seg = SegmentedKey::new(self.key.clone(), segment);
            if let Err(e) = self.lifecycle.ensure(&seg) {
                self.done = true;
                return Some(Err(e));
            }
            let from = self.lower.max(segment.start);
            let to = self.upper.min(segment.end);
            let values = match &self.segments {
                SegmentStream::Forward(_) => self.table.range_values(&seg, from, to),
                SegmentStream::Reverse(_) => self.table.range_values_reverse(&seg, from, to),
            };
            self.current = Some(values);
        }
    }
}
