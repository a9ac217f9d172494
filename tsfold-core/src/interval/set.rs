//! Sorted, disjoint interval set with local merge on insert

use super::{Interval, TouchPolicy};

/// Ordered sequence of disjoint intervals.
///
/// Invariant: ascending by start, and no two neighbours touch under the
/// set's [`TouchPolicy`]. Inserts only rewrite the neighbours they touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
    policy: TouchPolicy,
}

impl IntervalSet {
    /// Create an empty set with the default (adjacent) touch policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set with an explicit touch policy
    pub fn with_policy(policy: TouchPolicy) -> Self {
        Self {
            intervals: Vec::new(),
            policy,
        }
    }

    pub fn policy(&self) -> TouchPolicy {
        self.policy
    }

    /// Insert an interval, coalescing it with every neighbour it touches
    pub fn add(&mut self, interval: Interval) {
        let adjacent = self.policy == TouchPolicy::Adjacent;

        // first interval not entirely (and non-touchingly) before the new one
        let lo = self.intervals.partition_point(|iv| {
            if adjacent {
                iv.end().saturating_add(1) < interval.start()
            } else {
                iv.end() < interval.start()
            }
        });
        // first interval entirely after the new one
        let hi = self.intervals.partition_point(|iv| {
            if adjacent {
                iv.start() <= interval.end().saturating_add(1)
            } else {
                iv.start() <= interval.end()
            }
        });

        if lo >= hi {
            self.intervals.insert(lo, interval);
            return;
        }

        let merged = interval
            .span(&self.intervals[lo])
            .span(&self.intervals[hi - 1]);
        self.intervals.splice(lo..hi, std::iter::once(merged));
    }

    /// True iff some interval of the set shares a timestamp with `interval`
    pub fn is_overlapped(&self, interval: &Interval) -> bool {
        let idx = self
            .intervals
            .partition_point(|iv| iv.end() < interval.start());
        idx < self.intervals.len() && self.intervals[idx].start() <= interval.end()
    }

    /// Smallest interval covering the whole set
    pub fn span(&self) -> Option<Interval> {
        match (self.intervals.first(), self.intervals.last()) {
            (Some(first), Some(last)) => Some(first.span(last)),
            _ => None,
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}
