//! Two-tier overlap statistics for one storage partition

use super::{Interval, IntervalIndex, IntervalSet, TouchPolicy};
use crate::SeriesKey;
use std::ops::Bound;

/// Time ranges already present in a data space, per device and per series.
///
/// The device-level (chunk-group) index is kept a superset of the union of
/// the device's series: every measurement update also widens the device.
/// That makes the device-level answer a sound pre-filter.
#[derive(Debug, Clone, Default)]
pub struct SpaceStatistics {
    series: IntervalIndex<SeriesKey>,
    devices: IntervalIndex<String>,
}

impl SpaceStatistics {
    pub fn new(policy: TouchPolicy) -> Self {
        Self {
            series: IntervalIndex::new(policy),
            devices: IntervalIndex::new(policy),
        }
    }

    /// Record data of one series
    pub fn update_measurement(&mut self, device: &str, measurement: &str, interval: Interval) {
        self.series
            .add_interval(SeriesKey::new(device, measurement), interval);
        self.devices.add_interval(device.to_string(), interval);
    }

    /// Record data of a whole chunk group (device-level only)
    pub fn update_device(&mut self, device: &str, interval: Interval) {
        self.devices.add_interval(device.to_string(), interval);
    }

    /// Measurement-level check
    pub fn chunk_has_overlap(&self, device: &str, measurement: &str, interval: &Interval) -> bool {
        self.series
            .is_overlapped(&SeriesKey::new(device, measurement), interval)
    }

    /// Device-level check
    pub fn chunk_group_has_overlap(&self, device: &str, interval: &Interval) -> bool {
        self.devices.is_overlapped(device, interval)
    }

    /// Device-level pre-filter followed by the measurement-level check
    pub fn has_overlap(&self, device: &str, measurement: &str, interval: &Interval) -> bool {
        if !self.chunk_group_has_overlap(device, interval) {
            return false;
        }
        self.chunk_has_overlap(device, measurement, interval)
    }

    pub fn device_intervals(&self, device: &str) -> Option<&IntervalSet> {
        self.devices.get(device)
    }

    pub fn series_intervals(&self, device: &str, measurement: &str) -> Option<&IntervalSet> {
        self.series.get(&SeriesKey::new(device, measurement))
    }

    /// Measurements recorded for `device`, in order
    pub fn measurements<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let from = SeriesKey::new(device, "");
        self.series
            .range((Bound::Included(from), Bound::Unbounded))
            .take_while(move |(key, _)| key.device == device)
            .map(|(key, _)| key.measurement.as_str())
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|(device, _)| device.as_str())
    }

    pub fn clear(&mut self) {
        self.series.clear();
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_and_device_levels() {
        let mut stats = SpaceStatistics::default();
        stats.update_measurement("d1", "s0", Interval::new(0, 99));
        stats.update_measurement("d1", "s1", Interval::new(200, 299));

        assert!(stats.chunk_has_overlap("d1", "s0", &Interval::new(50, 60)));
        assert!(!stats.chunk_has_overlap("d1", "s1", &Interval::new(50, 60)));
        assert!(!stats.chunk_has_overlap("d1", "s9", &Interval::new(50, 60)));
        assert!(!stats.chunk_has_overlap("d9", "s0", &Interval::new(50, 60)));

        assert!(stats.chunk_group_has_overlap("d1", &Interval::new(250, 260)));
        assert!(!stats.chunk_group_has_overlap("d1", &Interval::new(120, 180)));
    }

    #[test]
    fn test_device_level_short_circuits() {
        let mut stats = SpaceStatistics::default();
        stats.update_measurement("d1", "s0", Interval::new(0, 10));
        stats.update_measurement("d1", "s1", Interval::new(100, 110));

        // gap between the series: the device-level filter rejects without a series lookup
        assert!(!stats.has_overlap("d1", "s0", &Interval::new(50, 60)));
        // device overlaps, series does not
        assert!(!stats.has_overlap("d1", "s0", &Interval::new(105, 106)));
        assert!(stats.has_overlap("d1", "s1", &Interval::new(105, 106)));
    }

    #[test]
    fn test_device_superset_invariant() {
        let mut stats = SpaceStatistics::default();
        stats.update_measurement("d1", "s0", Interval::new(0, 10));
        stats.update_measurement("d1", "s1", Interval::new(5, 30));
        stats.update_measurement("d2", "s0", Interval::new(7, 8));

        for device in ["d1", "d2"] {
            let dev = stats.device_intervals(device).unwrap();
            for m in stats.measurements(device) {
                for iv in stats.series_intervals(device, m).unwrap().iter() {
                    assert!(dev.is_overlapped(iv));
                    assert!(dev.iter().any(|d| d.start() <= iv.start() && d.end() >= iv.end()));
                }
            }
        }
        assert_eq!(stats.measurements("d1").collect::<Vec<_>>(), vec!["s0", "s1"]);
        assert_eq!(stats.devices().collect::<Vec<_>>(), vec!["d1", "d2"]);
    }
}
