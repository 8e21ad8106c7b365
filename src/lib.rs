//! SeriesDB - Embedded Segmented Time-Series Storage Engine
//!
//! An append-oriented storage engine for keyed streams of time-stamped
//! values. Each series is partitioned into segments (contiguous,
//! non-overlapping time ranges); a segment is materialized lazily on first
//! access by pulling from a user-supplied source and is written as a set of
//! compressed, chunked on-disk files. Queries span the required segments
//! transparently.
//!
//! # Architecture
//!
//! - **Chunk files**: append-only LZ4-framed record files, one per flushed
//!   batch
//! - **Segment table**: per-segment chunk metadata and value iteration
//! - **Lifecycle manager**: crash-consistent lazy initialization of
//!   segments with per-segment locking
//! - **Query layer**: range scans (forward/reverse) and memoized
//!   latest/previous/next lookups over the segments
//! - **Live overlay**: an in-memory tail segment merged into queries and
//!   promoted to a historical segment when it rolls over

pub mod chunk;
pub mod live;
pub mod query;
pub mod retry;
pub mod segment;
pub mod storage;
pub mod update;

mod error;
mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{Result, SeriesError};
pub use types::*;

/// SeriesDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Elements per chunk flush
    pub const BATCH_FLUSH_INTERVAL: usize = 10_000;

    /// Bounded producer queue depth for parallel writes
    pub const BATCH_QUEUE_SIZE: usize = 500_000 / BATCH_FLUSH_INTERVAL;

    /// Write lock acquisition budget in seconds
    pub const WRITE_LOCK_TIMEOUT_SECS: u64 = 60;

    /// Maximum entries per lookup cache
    pub const LOOKUP_CACHE_SIZE: usize = 1_000;
}
