//! Segment lifecycle manager
//!
//! Drives the per-segment state machine:
//!
//! ```text
//! absent ──► INITIALIZING ──► COMPLETE
//!    ▲            │
//!    └── purge ◄──┘ (crash observed as INITIALIZING)
//! ```
//!
//! Candidates for the same segment are serialized through the segment's
//! identity mutex before the bounded write-lock acquisition, so the timed
//! `try_write_for` never competes with another initialization candidate.
//! A timeout surfaces as a retry-later fault instead of a silent deadlock.

use crate::retry::{self, RetryPolicy};
use crate::storage::{SegmentLock, SegmentTable, SeriesStorage};
use crate::update::RangeUpdater;
use crate::{
    config, Result, SegmentSource, SegmentStatus, SegmentedKey, SeriesError, StreamKey,
};
use parking_lot::RwLockWriteGuard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ensures segments are initialized exactly once, with crash recovery
pub struct SegmentLifecycle<K: StreamKey, V: Send> {
    storage: Arc<SeriesStorage>,
    table: Arc<SegmentTable<K, V>>,
    source: Arc<dyn SegmentSource<K, V>>,
    retry_policy: RetryPolicy,
    parallel_writes: bool,
}

impl<K: StreamKey, V: Send> Clone for SegmentLifecycle<K, V> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            table: self.table.clone(),
            source: self.source.clone(),
            retry_policy: self.retry_policy.clone(),
            parallel_writes: self.parallel_writes,
        }
    }
}

impl<K: StreamKey, V: Send> SegmentLifecycle<K, V> {
    pub fn new(
        storage: Arc<SeriesStorage>,
        table: Arc<SegmentTable<K, V>>,
        source: Arc<dyn SegmentSource<K, V>>,
    ) -> Self {
        Self {
            storage,
            table,
            source,
            retry_policy: RetryPolicy::default(),
            parallel_writes: false,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_parallel_writes(mut self, parallel: bool) -> Self {
        self.parallel_writes = parallel;
        self
    }

    /// Initialize the segment if it is not COMPLETE yet.
    ///
    /// Readers observe either COMPLETE with all chunks present or an
    /// absent/initializing segment, never a partial chunk set.
    pub fn ensure(&self, seg: &SegmentedKey<K>) -> Result<()> {
        let hash = seg.key.hash_key();
        let lock = self.table.lock_for(seg);
        let _candidates = lock.monitor().lock();

        let status = {
            let _read = lock.rw().read();
            self.storage.segment_status().get(&hash, &seg.segment)
        };
        if status == Some(SegmentStatus::Complete) {
            return Ok(());
        }

        let _write = self.acquire_write(&lock, seg)?;
        // no double-checked status read required, the monitor serializes
        // all candidates of this segment
        if status == Some(SegmentStatus::Initializing) {
            warn!(segment = %seg, "aborted initialization found, purging and retrying");
            self.table.delete_segment(seg)?;
            self.storage.segment_status().delete(&hash, &seg.segment)?;
        }
        self.check_availability_bounds(seg)?;

        self.storage
            .segment_status()
            .put(hash.clone(), seg.segment, SegmentStatus::Initializing)?;
        retry::run_with_backoff(
            &self.retry_policy,
            &format!("init_segment {}", seg),
            || self.init_segment(seg),
        )?;
        if self.table.is_empty_or_inconsistent(seg) {
            return Err(SeriesError::Invariant(format!(
                "initialization of segment [{}] should have added at least one entry",
                seg
            )));
        }
        self.storage
            .segment_status()
            .put(hash, seg.segment, SegmentStatus::Complete)?;
        debug!(segment = %seg, "segment initialized");
        Ok(())
    }

    /// Install explicit values as a COMPLETE segment, used when a live
    /// segment is promoted to historical
    pub fn promote(&self, seg: &SegmentedKey<K>, values: Vec<V>) -> Result<()> {
        let hash = seg.key.hash_key();
        let lock = self.table.lock_for(seg);
        let _candidates = lock.monitor().lock();
        let _write = self.acquire_write(&lock, seg)?;

        self.storage
            .segment_status()
            .put(hash.clone(), seg.segment, SegmentStatus::Initializing)?;
        self.install(seg, values.into_iter())?;
        if self.table.is_empty_or_inconsistent(seg) {
            return Err(SeriesError::Invariant(format!(
                "promotion of segment [{}] should have added at least one entry",
                seg
            )));
        }
        self.storage
            .segment_status()
            .put(hash, seg.segment, SegmentStatus::Complete)?;
        debug!(segment = %seg, "live segment promoted to historical");
        Ok(())
    }

    fn acquire_write<'l>(
        &self,
        lock: &'l SegmentLock,
        seg: &SegmentedKey<K>,
    ) -> Result<RwLockWriteGuard<'l, ()>> {
        lock.rw()
            .try_write_for(Duration::from_secs(config::WRITE_LOCK_TIMEOUT_SECS))
            .ok_or_else(|| {
                SeriesError::RetryLater(format!(
                    "write lock could not be acquired for segment [{}], please ensure all iterators are closed",
                    seg
                ))
            })
    }

    fn check_availability_bounds(&self, seg: &SegmentedKey<K>) -> Result<()> {
        let first_available = self.source.first_available_segment_from(&seg.key);
        if seg.segment.end < first_available {
            return Err(SeriesError::Invariant(format!(
                "{}: segment end [{}] should not be before first available segment from [{}]",
                seg, seg.segment.end, first_available
            )));
        }
        let last_available = self.source.last_available_segment_to(&seg.key);
        if seg.segment.end > last_available {
            return Err(SeriesError::Invariant(format!(
                "{}: segment end [{}] should not be after last available segment to [{}]",
                seg, seg.segment.end, last_available
            )));
        }
        Ok(())
    }

    fn init_segment(&self, seg: &SegmentedKey<K>) -> Result<()> {
        let source =
            self.source
                .download_segment_elements(&seg.key, seg.segment.start, seg.segment.end)?;
        self.install(seg, source)
    }

    fn install(&self, seg: &SegmentedKey<K>, source: impl Iterator<Item = V> + Send) -> Result<()> {
        let mut updater = RangeUpdater::new(&self.table, seg.clone())
            .with_parallel(self.parallel_writes);
        match updater.run(source) {
            Ok(()) => {}
            Err(SeriesError::IncompleteUpdate(msg)) => {
                self.table.delete_segment(seg)?;
                return Err(SeriesError::RetryLater(msg));
            }
            Err(e) => return Err(e),
        }
        if let Some(min_time) = updater.min_time() {
            if min_time < seg.segment.start {
                return Err(SeriesError::Invariant(format!(
                    "{}: min time [{}] should not be before segment start [{}]",
                    seg, min_time, seg.segment.start
                )));
            }
        }
        if let Some(max_time) = updater.max_time() {
            if max_time > seg.segment.end {
                return Err(SeriesError::Invariant(format!(
                    "{}: max time [{}] should not be after segment end [{}]",
                    seg, max_time, seg.segment.end
                )));
            }
        }
        Ok(())
    }
}
