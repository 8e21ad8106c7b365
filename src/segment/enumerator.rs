//! Segment enumerators
//!
//! Lazy forward and reverse sequences over the finder's tiling, clipped to
//! an availability window. Termination is decided by an explicit verdict
//! per segment rather than exception control flow.

use crate::{Result, SegmentFinder, SeriesError, TimeRange, Timestamp, MAX_TIME, MIN_TIME};
use std::sync::Arc;

/// Per-segment decision of an enumerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentVerdict {
    /// Yield the segment and keep going
    Continue,
    /// Drop the segment and keep going
    Skip,
    /// End the enumeration
    Stop,
}

/// Forward sequence of segments overlapping `[from, to]`
pub struct ForwardSegments {
    finder: Arc<dyn SegmentFinder>,
    from: Timestamp,
    to: Timestamp,
    cur: Option<TimeRange>,
    done: bool,
}

impl ForwardSegments {
    pub fn new(finder: Arc<dyn SegmentFinder>, from: Timestamp, to: Timestamp) -> Self {
        Self {
            finder,
            from,
            to,
            cur: None,
            done: from > to,
        }
    }

    fn step(&mut self) -> Option<Result<TimeRange>> {
        let seg = match self.cur {
            None => self.finder.segment_for(self.from),
            Some(prev) => {
                if prev.end == MAX_TIME {
                    return None;
                }
                let seg = self.finder.segment_for(prev.end + 1);
                if seg.start <= prev.end {
                    return Some(Err(SeriesError::Invariant(format!(
                        "segment finder did not advance: {} after {}",
                        seg, prev
                    ))));
                }
                seg
            }
        };
        self.cur = Some(seg);
        Some(Ok(seg))
    }

    fn verdict(&self, seg: &TimeRange) -> Result<SegmentVerdict> {
        if seg.end < self.from {
            return Err(SeriesError::Invariant(format!(
                "segment end [{}] should not be before window start [{}]",
                seg.end, self.from
            )));
        }
        if seg.start > self.to {
            return Ok(SegmentVerdict::Stop);
        }
        Ok(SegmentVerdict::Continue)
    }
}

impl Iterator for ForwardSegments {
    type Item = Result<TimeRange>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let seg = match self.step() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(seg)) => seg,
            };
            match self.verdict(&seg) {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(SegmentVerdict::Stop) => {
                    self.done = true;
                    return None;
                }
                Ok(SegmentVerdict::Skip) => continue,
                Ok(SegmentVerdict::Continue) => return Some(Ok(seg)),
            }
        }
    }
}

/// Reverse sequence of segments overlapping `[from, to]`, newest first
pub struct ReverseSegments {
    finder: Arc<dyn SegmentFinder>,
    from: Timestamp,
    to: Timestamp,
    cur: Option<TimeRange>,
    done: bool,
}

impl ReverseSegments {
    pub fn new(finder: Arc<dyn SegmentFinder>, from: Timestamp, to: Timestamp) -> Self {
        Self {
            finder,
            from,
            to,
            cur: None,
            done: from > to,
        }
    }

    fn step(&mut self) -> Option<Result<TimeRange>> {
        let seg = match self.cur {
            None => self.finder.segment_for(self.to),
            Some(prev) => {
                if prev.start == MIN_TIME {
                    return None;
                }
                // one time unit earlier
                let seg = self.finder.segment_for(prev.start - 1);
                if seg.end >= prev.start {
                    return Some(Err(SeriesError::Invariant(format!(
                        "segment finder did not step back: {} before {}",
                        seg, prev
                    ))));
                }
                seg
            }
        };
        self.cur = Some(seg);
        Some(Ok(seg))
    }

    fn verdict(&self, seg: &TimeRange) -> SegmentVerdict {
        if seg.end < self.from {
            return SegmentVerdict::Stop;
        }
        if seg.start > self.to {
            // still past the window end, continue with earlier segments
            return SegmentVerdict::Skip;
        }
        SegmentVerdict::Continue
    }
}

impl Iterator for ReverseSegments {
    type Item = Result<TimeRange>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let seg = match self.step() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(seg)) => seg,
            };
            match self.verdict(&seg) {
                SegmentVerdict::Stop => {
                    self.done = true;
                    return None;
                }
                SegmentVerdict::Skip => continue,
                SegmentVerdict::Continue => return Some(Ok(seg)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::UniformFinder;

    fn finder() -> Arc<dyn SegmentFinder> {
        Arc::new(UniformFinder::new(100))
    }

    #[test]
    fn test_forward_overlapping_segments() {
        let segments: Vec<_> = ForwardSegments::new(finder(), 150, 310)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            segments,
            vec![
                TimeRange::new(100, 199),
                TimeRange::new(200, 299),
                TimeRange::new(300, 399),
            ]
        );
    }

    #[test]
    fn test_forward_single_segment() {
        let segments: Vec<_> = ForwardSegments::new(finder(), 110, 120)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(segments, vec![TimeRange::new(100, 199)]);
    }

    #[test]
    fn test_forward_empty_window() {
        assert_eq!(ForwardSegments::new(finder(), 200, 100).count(), 0);
    }

    #[test]
    fn test_reverse_overlapping_segments() {
        let segments: Vec<_> = ReverseSegments::new(finder(), 150, 310)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            segments,
            vec![
                TimeRange::new(300, 399),
                TimeRange::new(200, 299),
                TimeRange::new(100, 199),
            ]
        );
    }

    #[test]
    fn test_reverse_includes_boundary_segment() {
        // a segment ending exactly at the window start still overlaps it
        let segments: Vec<_> = ReverseSegments::new(finder(), 199, 250)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            segments,
            vec![TimeRange::new(200, 299), TimeRange::new(100, 199)]
        );
    }

    #[test]
    fn test_exhausted_enumerators_stay_exhausted() {
        let mut forward = ForwardSegments::new(finder(), 0, 50);
        assert!(forward.next().is_some());
        assert!(forward.next().is_none());
        assert!(forward.next().is_none());

        let mut reverse = ReverseSegments::new(finder(), 0, 50);
        assert!(reverse.next().is_some());
        assert!(reverse.next().is_none());
        assert!(reverse.next().is_none());
    }
}
