//! Live segment overlay
//!
//! A single in-memory segment at the head of a series. Incoming values
//! land in the live segment; queries merge it with the historical
//! segments; when an incoming value passes the live segment's end, the
//! live values are promoted to a historical segment and a fresh live
//! segment opens for the next time range.

use crate::query::SegmentCache;
use crate::{
    Result, SegmentFinder, SegmentSource, SegmentedKey, SeriesError, StreamKey, TimeRange,
    Timestamp, ValueAdapter, MAX_TIME, MIN_TIME,
};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory ordered tail of a series.
///
/// Keys carry an insertion sequence so equal timestamps preserve arrival
/// order.
pub struct LiveSegment<V: Clone + Send + 'static> {
    segment: TimeRange,
    values: SkipMap<(Timestamp, u64), V>,
    seq: AtomicU64,
}

impl<V: Clone + Send + 'static> LiveSegment<V> {
    pub fn new(segment: TimeRange) -> Self {
        Self {
            segment,
            values: SkipMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn segment(&self) -> TimeRange {
        self.segment
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn put(&self, time: Timestamp, value: V) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.values.insert((time, seq), value);
    }

    pub fn first_value(&self) -> Option<V> {
        self.values.front().map(|e| e.value().clone())
    }

    pub fn last_value(&self) -> Option<V> {
        self.values.back().map(|e| e.value().clone())
    }

    /// The value with the greatest time <= t
    pub fn latest_value(&self, t: Timestamp) -> Option<V> {
        self.values
            .range(..=(t, u64::MAX))
            .next_back()
            .map(|e| e.value().clone())
    }

    /// Values of `[from, to]` in time order
    pub fn range_values(&self, from: Timestamp, to: Timestamp) -> Vec<V> {
        if from > to {
            return Vec::new();
        }
        self.values
            .range((from, 0)..=(to, u64::MAX))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Values of `[to, from]` in reverse time order (`from` is the upper
    /// bound)
    pub fn range_values_reverse(&self, from: Timestamp, to: Timestamp) -> Vec<V> {
        if to > from {
            return Vec::new();
        }
        self.values
            .range((to, 0)..=(from, u64::MAX))
            .rev()
            .map(|e| e.value().clone())
            .collect()
    }

    /// All values in order, for promotion
    pub fn values(&self) -> Vec<V> {
        self.values.iter().map(|e| e.value().clone()).collect()
    }
}

/// Merges a live segment into the historical query layer
pub struct LiveSegmentCache<K: StreamKey, V: Clone + Send + 'static> {
    historical: Arc<SegmentCache<K, V>>,
    key: K,
    live: RwLock<Option<Arc<LiveSegment<V>>>>,
}

impl<K: StreamKey, V: Clone + Send + 'static> LiveSegmentCache<K, V> {
    pub fn new(historical: Arc<SegmentCache<K, V>>) -> Self {
        let key = historical.key().clone();
        Self {
            historical,
            key,
            live: RwLock::new(None),
        }
    }

    pub fn historical(&self) -> &Arc<SegmentCache<K, V>> {
        &self.historical
    }

    fn live(&self) -> Option<Arc<LiveSegment<V>>> {
        self.live.read().clone()
    }

    fn historical_has_data(&self) -> bool {
        // a degenerate availability window means the series never had
        // historical data to begin with
        let source = self.historical.source();
        source.first_available_segment_from(&self.key)
            <= source.last_available_segment_to(&self.key)
    }

    pub fn is_empty_or_inconsistent(&self) -> Result<bool> {
        if let Some(live) = self.live() {
            if live.is_empty() {
                return Ok(true);
            }
        }
        self.historical.is_empty_or_inconsistent()
    }

    pub fn delete_all(&self) -> Result<()> {
        *self.live.write() = None;
        self.historical.delete_all()
    }

    /// Prefer the historical first value, fall back to the live one
    pub fn get_first_value(&self) -> Result<Option<V>> {
        if self.historical_has_data() {
            if let Some(value) = self.historical.get_first_value()? {
                return Ok(Some(value));
            }
        }
        Ok(self.live().and_then(|live| live.first_value()))
    }

    /// Prefer the live last value, fall back to the historical one
    pub fn get_last_value(&self) -> Result<Option<V>> {
        if let Some(live) = self.live() {
            if let Some(value) = live.last_value() {
                return Ok(Some(value));
            }
        }
        if self.historical_has_data() {
            return self.historical.get_latest_value(MAX_TIME);
        }
        Ok(None)
    }

    /// Forward scan of `[from, to]` merging historical and live values
    pub fn read_range_values(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Box<dyn Iterator<Item = Result<V>> + Send> {
        let live = match self.live() {
            None => return Box::new(self.historical.read_range_values(from, to)),
            Some(live) => live,
        };
        let live_from = live.segment().start;
        if live_from > to {
            // live segment is after the requested range
            Box::new(self.historical.read_range_values(from, to))
        } else if live_from <= from {
            // the whole range is covered by the live segment
            Box::new(live.range_values(from, to).into_iter().map(Ok))
        } else {
            let historical = self.historical.read_range_values(from, live_from - 1);
            let live_values = live.range_values(live_from, to);
            Box::new(historical.chain(live_values.into_iter().map(Ok)))
        }
    }

    /// Reverse scan from `from` down to `to`, merging live and historical
    pub fn read_range_values_reverse(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Box<dyn Iterator<Item = Result<V>> + Send> {
        let live = match self.live() {
            None => return Box::new(self.historical.read_range_values_reverse(from, to)),
            Some(live) => live,
        };
        let live_from = live.segment().start;
        if live_from > from {
            Box::new(self.historical.read_range_values_reverse(from, to))
        } else if live_from <= to {
            Box::new(live.range_values_reverse(from, to).into_iter().map(Ok))
        } else {
            let live_values = live.range_values_reverse(from, live_from);
            let historical = self
                .historical
                .read_range_values_reverse(live_from - 1, to);
            Box::new(live_values.into_iter().map(Ok).chain(historical))
        }
    }

    /// Latest value at or before the date, preferring the live segment
    pub fn get_latest_value(&self, date: Timestamp) -> Result<Option<V>> {
        let live = match self.live() {
            None => return self.historical.get_latest_value(date),
            Some(live) => live,
        };
        if let Some(value) = live.latest_value(date) {
            return Ok(Some(value));
        }
        if self.historical_has_data() {
            if let Some(value) = self.historical.get_latest_value(date)? {
                let time = self.historical.adapter().extract_time(&value);
                if time <= date {
                    return Ok(Some(value));
                }
            }
        }
        self.get_first_value()
    }

    /// The n-th value before the date, or None if fewer than n exist
    pub fn get_previous_value(&self, date: Timestamp, shift_back_units: u32) -> Result<Option<V>> {
        let live = match self.live() {
            None => return self.historical.get_previous_value(date, shift_back_units),
            Some(live) => live,
        };
        if live.segment().start > date {
            // live segment is after the requested range
            return self.historical.get_previous_value(date, shift_back_units);
        }
        self.assert_shift_units(shift_back_units)?;
        self.walk(
            self.read_range_values_reverse(date, MIN_TIME),
            shift_back_units,
        )
    }

    /// The n-th value after the date, or None if fewer than n exist
    pub fn get_next_value(&self, date: Timestamp, shift_forward_units: u32) -> Result<Option<V>> {
        let live = match self.live() {
            None => return self.historical.get_next_value(date, shift_forward_units),
            Some(live) => live,
        };
        self.assert_shift_units(shift_forward_units)?;
        if live.segment().start <= date {
            // the walk never leaves the live segment
            let values = live.range_values(date, MAX_TIME);
            return Ok(values.into_iter().nth(shift_forward_units as usize - 1));
        }
        self.walk(self.read_range_values(date, MAX_TIME), shift_forward_units)
    }

    /// Append the next incoming value.
    ///
    /// Out-of-order values against the historical availability are
    /// rejected; a value past the live segment's end promotes the live
    /// values to a historical segment and opens the next live segment.
    pub fn put_next_live_value(&self, value: V) -> Result<()> {
        let adapter = self.historical.adapter().clone();
        let next_time = adapter.extract_time(&value);
        let last_available = self
            .historical
            .source()
            .last_available_segment_to(&self.key);
        let segment = self.historical.finder().segment_for(next_time);
        // allow equality with the segment end for the single tick where
        // the availability was advanced before the value arrived
        if last_available >= segment.start && last_available != segment.end {
            return Err(SeriesError::Invariant(format!(
                "last available historical segment end [{}] should be before live segment start [{}]",
                last_available, segment.start
            )));
        }

        let mut guard = self.live.write();
        if let Some(live) = guard.clone() {
            if next_time > live.segment().end {
                if last_available > live.segment().end {
                    return Err(SeriesError::Invariant(format!(
                        "last available historical segment end [{}] should be at or before live segment end [{}]",
                        last_available,
                        live.segment().end
                    )));
                }
                let seg = SegmentedKey::new(self.key.clone(), live.segment());
                self.historical.prepare_for_update()?;
                self.historical.lifecycle().promote(&seg, live.values())?;
                *guard = None;
            }
        }
        let live = match guard.as_ref() {
            Some(live) => live.clone(),
            None => {
                let live = Arc::new(LiveSegment::new(segment));
                *guard = Some(live.clone());
                live
            }
        };
        live.put(next_time, value);
        Ok(())
    }

    /// Drop the live segment without promoting it
    pub fn close(&self) {
        *self.live.write() = None;
    }

    fn walk(
        &self,
        mut iter: Box<dyn Iterator<Item = Result<V>> + Send>,
        units: u32,
    ) -> Result<Option<V>> {
        let mut value = None;
        for _ in 0..units {
            match iter.next() {
                Some(next) => value = Some(next?),
                None => return Ok(None),
            }
        }
        Ok(value)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        fast_retry_policy, open_storage, ScriptedSource, Tick, TickAdapter, UniformFinder,
    };
    use crate::query::SegmentCache;
    use crate::segment::SegmentLifecycle;
    use crate::SegmentStatus;
    use tempfile::tempdir;

    fn live_cache(
        dir: &std::path::Path,
        source: Arc<ScriptedSource>,
    ) -> LiveSegmentCache<String, Tick> {
        let storage = open_storage(dir);
        let cache = SegmentCache::open(
            storage.clone(),
            "series".to_string(),
            source.clone(),
            Arc::new(TickAdapter),
            Arc::new(UniformFinder::new(100)),
        );
        let lifecycle = SegmentLifecycle::new(storage, cache.table().clone(), source)
            .with_retry_policy(fast_retry_policy());
        LiveSegmentCache::new(Arc::new(cache.with_lifecycle(lifecycle)))
    }

    fn times(iter: Box<dyn Iterator<Item = Result<Tick>> + Send>) -> Vec<i64> {
        iter.map(|r| r.unwrap().time).collect()
    }

    #[test]
    fn test_live_segment_ordering_and_ties() {
        let live: LiveSegment<Tick> = LiveSegment::new(TimeRange::new(0, 99));
        live.put(10, Tick { time: 10, end_time: 10, value: 1.0 });
        live.put(10, Tick { time: 10, end_time: 10, value: 2.0 });
        live.put(5, Tick::at(5));

        let values = live.range_values(MIN_TIME, MAX_TIME);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].time, 5);
        // equal timestamps keep arrival order, the later insert wins for
        // latest lookups
        assert_eq!(values[1].value, 1.0);
        assert_eq!(values[2].value, 2.0);
        assert_eq!(live.latest_value(10).unwrap().value, 2.0);
        assert_eq!(live.latest_value(7).unwrap().time, 5);
        assert!(live.latest_value(2).is_none());
    }

    #[test]
    fn test_live_only_series() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(&[], 0, -1));
        let cache = live_cache(dir.path(), source.clone());

        cache.put_next_live_value(Tick::at(410)).unwrap();
        cache.put_next_live_value(Tick::at(450)).unwrap();

        assert_eq!(cache.get_first_value().unwrap().unwrap().time, 410);
        assert_eq!(cache.get_last_value().unwrap().unwrap().time, 450);
        assert_eq!(cache.get_latest_value(455).unwrap().unwrap().time, 450);
        assert_eq!(cache.get_latest_value(420).unwrap().unwrap().time, 410);
        assert_eq!(times(cache.read_range_values(400, 460)), vec![410, 450]);
        assert_eq!(
            times(cache.read_range_values_reverse(460, 400)),
            vec![450, 410]
        );
        assert_eq!(cache.get_previous_value(450, 2).unwrap().unwrap().time, 410);
        assert_eq!(cache.get_previous_value(450, 3).unwrap(), None);
        assert_eq!(cache.get_next_value(410, 2).unwrap().unwrap().time, 450);
        // nothing was ever downloaded
        assert_eq!(source.downloads(), 0);
    }

    #[test]
    fn test_merged_range_scan() {
        let dir = tempdir().unwrap();
        // historical tiles [0..399] with values at {first, mid, last}
        let historical_times: Vec<i64> = (0..4).flat_map(|i| [i * 100, i * 100 + 50, i * 100 + 99]).collect();
        let source = Arc::new(ScriptedSource::new(&historical_times, 0, 399));
        let cache = live_cache(dir.path(), source);

        for t in [400, 410, 450] {
            cache.put_next_live_value(Tick::at(t)).unwrap();
        }

        // spans the historical tail and the live head
        assert_eq!(
            times(cache.read_range_values(350, 450)),
            vec![350, 399, 400, 410, 450]
        );
        assert_eq!(
            times(cache.read_range_values_reverse(450, 350)),
            vec![450, 410, 400, 399, 350]
        );
        // fully historical window
        assert_eq!(times(cache.read_range_values(120, 210)), vec![150, 199, 200]);
        // fully live window
        assert_eq!(times(cache.read_range_values(405, 460)), vec![410, 450]);

        // the live segment answers dates it covers, earlier dates fall
        // through to the historical latest
        assert_eq!(cache.get_latest_value(405).unwrap().unwrap().time, 400);
        assert_eq!(cache.get_latest_value(399).unwrap().unwrap().time, 399);
        assert!(!cache.is_empty_or_inconsistent().unwrap());
    }

    #[test]
    fn test_merged_shift_walks() {
        let dir = tempdir().unwrap();
        let historical_times: Vec<i64> = (0..4).flat_map(|i| [i * 100, i * 100 + 50, i * 100 + 99]).collect();
        let source = Arc::new(ScriptedSource::new(&historical_times, 0, 399));
        let cache = live_cache(dir.path(), source);
        for t in [400, 410] {
            cache.put_next_live_value(Tick::at(t)).unwrap();
        }

        // crosses from live back into historical
        assert_eq!(cache.get_previous_value(410, 3).unwrap().unwrap().time, 399);
        // date before the live segment delegates to historical
        assert_eq!(cache.get_previous_value(399, 1).unwrap().unwrap().time, 399);
        // forward from the historical tail into the live head
        assert_eq!(cache.get_next_value(399, 2).unwrap().unwrap().time, 400);
        // forward inside the live segment only
        assert_eq!(cache.get_next_value(400, 2).unwrap().unwrap().time, 410);
    }

    #[test]
    fn test_promotion_rolls_live_into_historical() {
        let dir = tempdir().unwrap();
        let historical_times: Vec<i64> = vec![0, 50, 99, 100, 150, 199];
        let source = Arc::new(ScriptedSource::new(&historical_times, 0, 199));
        let cache = live_cache(dir.path(), source.clone());

        for t in [200, 250, 299] {
            cache.put_next_live_value(Tick::at(t)).unwrap();
        }
        // the value after the live segment's end triggers promotion
        cache.put_next_live_value(Tick::at(300)).unwrap();
        // the availability callback catches up with the promoted segment
        source.set_last_available(299);

        assert_eq!(
            cache
                .historical()
                .storage()
                .segment_status()
                .get(&"series".to_string(), &TimeRange::new(200, 299)),
            Some(SegmentStatus::Complete)
        );

        let mut expected = historical_times.clone();
        expected.extend([200, 250, 299, 300]);
        assert_eq!(times(cache.read_range_values(MIN_TIME, MAX_TIME)), expected);
        assert_eq!(cache.get_last_value().unwrap().unwrap().time, 300);
        // promoted values came from memory, not from a download of the
        // promoted segment
        let promoted: Vec<i64> = cache
            .historical()
            .read_range_values(200, 299)
            .map(|r| r.unwrap().time)
            .collect();
        assert_eq!(promoted, vec![200, 250, 299]);
    }

    #[test]
    fn test_out_of_order_value_rejected() {
        let dir = tempdir().unwrap();
        let historical_times: Vec<i64> = vec![0, 50, 99, 100, 150, 199];
        let source = Arc::new(ScriptedSource::new(&historical_times, 0, 199));
        let cache = live_cache(dir.path(), source);

        // lands in a segment the historical availability already covers
        let result = cache.put_next_live_value(Tick::at(50));
        assert!(matches!(result, Err(SeriesError::Invariant(_))));
    }

    #[test]
    fn test_close_drops_live_segment() {
        let dir = tempdir().unwrap();
        let historical_times: Vec<i64> = vec![0, 50, 99];
        let source = Arc::new(ScriptedSource::new(&historical_times, 0, 99));
        let cache = live_cache(dir.path(), source);

        cache.put_next_live_value(Tick::at(150)).unwrap();
        assert_eq!(cache.get_last_value().unwrap().unwrap().time, 150);

        cache.close();
        assert_eq!(cache.get_last_value().unwrap().unwrap().time, 99);
    }
}
