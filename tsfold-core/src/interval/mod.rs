//! Disjoint time-range tracking
//!
//! - [`Interval`]: closed `[start, end]` range
//! - [`IntervalSet`]: sorted, disjoint, coalesced sequence of intervals
//! - [`IntervalIndex`]: keyed collection of interval sets
//! - [`SpaceStatistics`]: device-level and measurement-level indexes
//!   cooperating as a coarse/fine overlap check

mod index;
mod set;
mod stats;

pub use index::IntervalIndex;
pub use set::IntervalSet;
pub use stats::SpaceStatistics;

use crate::{FoldError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed time range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    start: Timestamp,
    end: Timestamp,
}

impl Interval {
    /// Create a new interval.
    ///
    /// # Panics
    /// Panics if `start > end`; use [`Interval::try_new`] for untrusted input.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        assert!(
            start <= end,
            "malformed interval: start {} > end {}",
            start,
            end
        );
        Self { start, end }
    }

    /// Create a new interval, rejecting `start > end`
    pub fn try_new(start: Timestamp, end: Timestamp) -> Result<Self> {
        if start > end {
            return Err(FoldError::MalformedInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Single-point interval
    pub fn point(t: Timestamp) -> Self {
        Self { start: t, end: t }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.start && t <= self.end
    }

    /// Check if two ranges share at least one timestamp
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Smallest interval covering both
    pub fn span(&self, other: &Interval) -> Interval {
        Interval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Widen to include `t`
    pub fn extend_to(&mut self, t: Timestamp) {
        self.start = self.start.min(t);
        self.end = self.end.max(t);
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// When two intervals of a set are merged into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TouchPolicy {
    /// Merge intervals that intersect or are integer neighbours (`a.end + 1 == b.start`)
    #[default]
    Adjacent,
    /// Merge only intervals that share at least one timestamp
    Overlapping,
}

impl TouchPolicy {
    /// Whether `a` and `b` must be coalesced under this policy
    pub fn touches(self, a: &Interval, b: &Interval) -> bool {
        match self {
            TouchPolicy::Overlapping => a.overlaps(b),
            TouchPolicy::Adjacent => {
                a.start <= b.end.saturating_add(1) && b.start <= a.end.saturating_add(1)
            }
        }
    }
}
