//! Keyed collection of interval sets

use super::{Interval, IntervalSet, TouchPolicy};
use std::borrow::Borrow;
use std::collections::BTreeMap;

/// Map from key to [`IntervalSet`]
#[derive(Debug, Clone)]
pub struct IntervalIndex<K: Ord> {
    sets: BTreeMap<K, IntervalSet>,
    policy: TouchPolicy,
}

impl<K: Ord> Default for IntervalIndex<K> {
    fn default() -> Self {
        Self::new(TouchPolicy::default())
    }
}

impl<K: Ord> IntervalIndex<K> {
    /// Create an empty index whose sets all use `policy`
    pub fn new(policy: TouchPolicy) -> Self {
        Self {
            sets: BTreeMap::new(),
            policy,
        }
    }

    /// Insert or merge `interval` into the set of `key`
    pub fn add_interval(&mut self, key: K, interval: Interval) {
        let policy = self.policy;
        self.sets
            .entry(key)
            .or_insert_with(|| IntervalSet::with_policy(policy))
            .add(interval);
    }

    /// True iff `key` has a recorded interval intersecting `interval`.
    /// An unknown key has no data yet and never overlaps.
    pub fn is_overlapped<Q>(&self, key: &Q, interval: &Interval) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.sets
            .get(key)
            .map_or(false, |set| set.is_overlapped(interval))
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&IntervalSet>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.sets.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &IntervalSet)> {
        self.sets.iter()
    }

    pub(crate) fn range<R>(&self, range: R) -> impl Iterator<Item = (&K, &IntervalSet)>
    where
        R: std::ops::RangeBounds<K>,
    {
        self.sets.range(range)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_key_is_not_overlapped() {
        let index: IntervalIndex<String> = IntervalIndex::default();
        assert!(!index.is_overlapped("root.sg.d1", &Interval::new(0, 100)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut index = IntervalIndex::default();
        index.add_interval("d1".to_string(), Interval::new(0, 10));
        index.add_interval("d2".to_string(), Interval::new(50, 60));

        assert!(index.is_overlapped("d1", &Interval::new(5, 5)));
        assert!(!index.is_overlapped("d1", &Interval::new(50, 60)));
        assert!(index.is_overlapped("d2", &Interval::new(55, 70)));
        assert_eq!(index.len(), 2);
    }
}
