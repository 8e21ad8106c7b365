//! Segment lifecycle and enumeration
//!
//! A segment is materialized lazily on first demand: the lifecycle manager
//! drives the `absent -> INITIALIZING -> COMPLETE` state machine with
//! crash recovery, and the enumerators produce the lazy forward/reverse
//! sequences of segments a query spans.

mod enumerator;
mod lifecycle;

pub use enumerator::{ForwardSegments, ReverseSegments, SegmentVerdict};
pub use lifecycle::SegmentLifecycle;
