//! Shared test fixtures: a tick value type with codecs, a fixed-width
//! tiling finder, and a scripted source with a download counter

use crate::retry::RetryPolicy;
use crate::storage::{SegmentTable, SeriesStorage};
use crate::{
    Result, SegmentFinder, SegmentSource, SeriesError, TimeRange, Timestamp, ValueAdapter,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: Timestamp,
    pub end_time: Timestamp,
    pub value: f64,
}

impl Tick {
    pub fn at(time: Timestamp) -> Self {
        Self {
            time,
            end_time: time,
            value: time as f64,
        }
    }
}

/// Dynamic-framing tick codec
pub struct TickAdapter;

impl ValueAdapter<Tick> for TickAdapter {
    fn extract_time(&self, value: &Tick) -> Timestamp {
        value.time
    }

    fn extract_end_time(&self, value: &Tick) -> Timestamp {
        value.end_time
    }

    fn encode(&self, value: &Tick) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| SeriesError::InvalidFormat(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Tick> {
        bincode::deserialize(bytes).map_err(|e| SeriesError::Corruption(e.to_string()))
    }
}

/// Fixed-framing tick codec, 24 bytes per record
pub struct FixedTickAdapter;

impl ValueAdapter<Tick> for FixedTickAdapter {
    fn extract_time(&self, value: &Tick) -> Timestamp {
        value.time
    }

    fn extract_end_time(&self, value: &Tick) -> Timestamp {
        value.end_time
    }

    fn encode(&self, value: &Tick) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&value.time.to_be_bytes());
        bytes.extend_from_slice(&value.end_time.to_be_bytes());
        bytes.extend_from_slice(&value.value.to_be_bytes());
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Tick> {
        if bytes.len() != 24 {
            return Err(SeriesError::Corruption(format!(
                "expected 24 byte record, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[0..8]);
        let time = i64::from_be_bytes(buf);
        buf.copy_from_slice(&bytes[8..16]);
        let end_time = i64::from_be_bytes(buf);
        buf.copy_from_slice(&bytes[16..24]);
        let value = f64::from_be_bytes(buf);
        Ok(Tick {
            time,
            end_time,
            value,
        })
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(24)
    }
}

/// Tiles time into fixed-width segments
pub struct UniformFinder {
    width: i64,
}

impl UniformFinder {
    pub fn new(width: i64) -> Self {
        Self { width }
    }
}

impl SegmentFinder for UniformFinder {
    fn segment_for(&self, t: Timestamp) -> TimeRange {
        let start = t.div_euclid(self.width) * self.width;
        TimeRange::new(start, start.saturating_add(self.width - 1))
    }
}

/// In-memory source over a fixed value set, with adjustable availability
/// bounds and a download counter
pub struct ScriptedSource {
    values: parking_lot::Mutex<Vec<Tick>>,
    first_available: AtomicI64,
    last_available: AtomicI64,
    downloads: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(times: &[Timestamp], first_available: Timestamp, last_available: Timestamp) -> Self {
        Self {
            values: parking_lot::Mutex::new(times.iter().map(|&t| Tick::at(t)).collect()),
            first_available: AtomicI64::new(first_available),
            last_available: AtomicI64::new(last_available),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn set_last_available(&self, t: Timestamp) {
        self.last_available.store(t, Ordering::SeqCst);
    }
}

impl SegmentSource<String, Tick> for ScriptedSource {
    fn download_segment_elements(
        &self,
        _key: &String,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Tick> + Send>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let values: Vec<Tick> = self
            .values
            .lock()
            .iter()
            .filter(|t| t.time >= from && t.time <= to)
            .cloned()
            .collect();
        Ok(Box::new(values.into_iter()))
    }

    fn first_available_segment_from(&self, _key: &String) -> Timestamp {
        self.first_available.load(Ordering::SeqCst)
    }

    fn last_available_segment_to(&self, _key: &String) -> Timestamp {
        self.last_available.load(Ordering::SeqCst)
    }
}

pub fn open_storage(dir: &Path) -> Arc<SeriesStorage> {
    Arc::new(SeriesStorage::open(dir).unwrap())
}

pub fn tick_table(storage: &Arc<SeriesStorage>) -> Arc<SegmentTable<String, Tick>> {
    Arc::new(SegmentTable::new(storage.clone(), Arc::new(TickAdapter)))
}

/// Millisecond backoffs keep retry-path tests fast
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}
