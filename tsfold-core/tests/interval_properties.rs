//! Property tests for interval sets
//!
//! For every touch policy and any insertion sequence:
//!  - intervals stay sorted and pairwise non-touching
//!  - the set covers exactly the union of the inserted points
//!  - overlap queries agree with a brute-force scan of the inputs
//!  - the result does not depend on insertion order

use proptest::prelude::*;
use tsfold_core::interval::{Interval, IntervalSet, TouchPolicy};

fn interval_strategy() -> impl Strategy<Value = Interval> {
    (0i64..200, 0i64..20).prop_map(|(start, len)| Interval::new(start, start + len))
}

fn intervals_strategy() -> impl Strategy<Value = Vec<Interval>> {
    prop::collection::vec(interval_strategy(), 0..30)
}

fn policy_strategy() -> impl Strategy<Value = TouchPolicy> {
    prop_oneof![Just(TouchPolicy::Adjacent), Just(TouchPolicy::Overlapping)]
}

fn build(policy: TouchPolicy, intervals: &[Interval]) -> IntervalSet {
    let mut set = IntervalSet::with_policy(policy);
    for iv in intervals {
        set.add(*iv);
    }
    set
}

proptest! {
    #[test]
    fn prop_disjoint_and_sorted(policy in policy_strategy(), inputs in intervals_strategy()) {
        let set = build(policy, &inputs);
        for pair in set.intervals().windows(2) {
            prop_assert!(pair[0].end() < pair[1].start());
            prop_assert!(!policy.touches(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn prop_covers_exactly_the_union(policy in policy_strategy(), inputs in intervals_strategy()) {
        let set = build(policy, &inputs);
        for t in -1i64..222 {
            let expected = inputs.iter().any(|iv| iv.contains(t));
            let actual = set.iter().any(|iv| iv.contains(t));
            prop_assert_eq!(expected, actual, "timestamp {}", t);
        }
    }

    #[test]
    fn prop_overlap_matches_brute_force(
        policy in policy_strategy(),
        inputs in intervals_strategy(),
        query in interval_strategy(),
    ) {
        let set = build(policy, &inputs);
        let expected = inputs.iter().any(|iv| iv.overlaps(&query));
        prop_assert_eq!(set.is_overlapped(&query), expected);
    }

    #[test]
    fn prop_insertion_order_is_irrelevant(policy in policy_strategy(), inputs in intervals_strategy()) {
        let forward = build(policy, &inputs);
        let mut reversed_inputs = inputs.clone();
        reversed_inputs.reverse();
        let reversed = build(policy, &reversed_inputs);
        prop_assert_eq!(forward.intervals(), reversed.intervals());
    }

    #[test]
    fn prop_span_covers_inputs(inputs in intervals_strategy()) {
        let set = build(TouchPolicy::Adjacent, &inputs);
        match set.span() {
            None => prop_assert!(inputs.is_empty()),
            Some(span) => {
                let lo = inputs.iter().map(|iv| iv.start()).min();
                let hi = inputs.iter().map(|iv| iv.end()).max();
                prop_assert_eq!(Some(span.start()), lo);
                prop_assert_eq!(Some(span.end()), hi);
            }
        }
    }
}

#[test]
fn adjacent_policy_joins_integer_neighbours() {
    let mut set = IntervalSet::with_policy(TouchPolicy::Adjacent);
    set.add(Interval::new(10, 20));
    set.add(Interval::new(21, 30));
    assert_eq!(set.intervals(), &[Interval::new(10, 30)]);
    set.add(Interval::new(5, 9));
    assert_eq!(set.intervals(), &[Interval::new(5, 30)]);
}

#[test]
fn overlapping_policy_keeps_neighbours_apart() {
    let mut set = IntervalSet::with_policy(TouchPolicy::Overlapping);
    set.add(Interval::new(10, 20));
    set.add(Interval::new(21, 30));
    set.add(Interval::new(5, 9));
    assert_eq!(set.len(), 3);

    let mut shared = IntervalSet::with_policy(TouchPolicy::Overlapping);
    shared.add(Interval::new(10, 20));
    shared.add(Interval::new(20, 30));
    assert_eq!(shared.intervals(), &[Interval::new(10, 30)]);
}
