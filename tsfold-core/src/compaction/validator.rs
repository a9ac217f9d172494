//! Post-merge consistency check
//!
//! Replays the sources through the same cursor + merge path the executor
//! uses, then compares the targets against that expectation point by point.

use super::merge::{MergePriority, SeriesMerger};
use crate::codec::ChunkCodec;
use crate::resource::FileResource;
use crate::tsfile::TsFileReader;
use crate::{Result, SeriesKey, TimeValuePair, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Deduplicated union of the sources, per series
#[derive(Debug, Clone, Default)]
pub struct ExpectedData {
    series: BTreeMap<SeriesKey, Vec<TimeValuePair>>,
}

impl ExpectedData {
    pub fn series(&self, key: &SeriesKey) -> Option<&[TimeValuePair]> {
        self.series.get(key).map(Vec::as_slice)
    }

    pub fn point_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

/// One defect found in a series
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesDefect {
    /// Points differ at `index`
    Mismatch {
        series: SeriesKey,
        index: usize,
        expected: TimeValuePair,
        actual: TimeValuePair,
    },
    /// Expected points missing from the targets
    DataLoss {
        series: SeriesKey,
        missing: usize,
        first_missing: Timestamp,
    },
    /// Target points beyond the expectation
    Duplication {
        series: SeriesKey,
        extra: usize,
        first_extra: Timestamp,
    },
}

impl fmt::Display for SeriesDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesDefect::Mismatch {
                series,
                index,
                expected,
                actual,
            } => write!(
                f,
                "{}: point {} is {:?}@{}, expected {:?}@{}",
                series, index, actual.value, actual.timestamp, expected.value, expected.timestamp
            ),
            SeriesDefect::DataLoss {
                series,
                missing,
                first_missing,
            } => write!(
                f,
                "{}: {} point(s) lost, first at {}",
                series, missing, first_missing
            ),
            SeriesDefect::Duplication {
                series,
                extra,
                first_extra,
            } => write!(
                f,
                "{}: {} extra point(s), first at {}",
                series, extra, first_extra
            ),
        }
    }
}

/// Outcome of a validation
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub series_checked: usize,
    pub points_checked: usize,
    pub defects: Vec<SeriesDefect>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Replays sources and targets to prove a merge lost nothing
pub struct ConsistencyValidator {
    codec: Arc<dyn ChunkCodec>,
}

impl ConsistencyValidator {
    pub fn new(codec: Arc<dyn ChunkCodec>) -> Self {
        Self { codec }
    }

    /// Merge every series of `sources` with last-writer-wins
    pub fn expected(&self, sources: &[Arc<FileResource>]) -> Result<ExpectedData> {
        let readers = sources
            .iter()
            .map(|r| -> Result<(TsFileReader, MergePriority)> {
                Ok((
                    TsFileReader::open(r.path(), Arc::clone(&self.codec))?,
                    MergePriority::of(r),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let all_series: BTreeSet<SeriesKey> =
            readers.iter().flat_map(|(reader, _)| reader.series()).collect();

        let mut expected = ExpectedData::default();
        for series in all_series {
            let cursors = readers
                .iter()
                .filter(|(reader, _)| reader.contains_series(&series))
                .map(|(reader, priority)| (reader.cursor(&series), *priority))
                .collect();
            let mut merger = SeriesMerger::new(cursors)?;
            let mut points = Vec::new();
            while let Some(point) = merger.next_point()? {
                points.push(point);
            }
            expected.series.insert(series, points);
        }
        Ok(expected)
    }

    /// Compare `targets` (in order, without deduplication) to `expected`
    pub fn validate(
        &self,
        expected: &ExpectedData,
        targets: &[Arc<FileResource>],
    ) -> Result<ValidationReport> {
        let readers = targets
            .iter()
            .map(|r| TsFileReader::open(r.path(), Arc::clone(&self.codec)))
            .collect::<Result<Vec<_>>>()?;

        let mut all_series: BTreeSet<SeriesKey> = expected.series.keys().cloned().collect();
        for reader in &readers {
            all_series.extend(reader.series());
        }

        let mut report = ValidationReport::default();
        for series in all_series {
            let mut actual = Vec::new();
            for reader in &readers {
                if reader.contains_series(&series) {
                    actual.extend(reader.read_series(&series)?);
                }
            }
            let wanted = expected.series(&series).unwrap_or(&[]);
            report.series_checked += 1;
            report.points_checked += actual.len();
            compare(&series, wanted, &actual, &mut report.defects);
        }
        Ok(report)
    }
}

fn compare(
    series: &SeriesKey,
    expected: &[TimeValuePair],
    actual: &[TimeValuePair],
    defects: &mut Vec<SeriesDefect>,
) {
    if let Some(index) = expected.iter().zip(actual).position(|(e, a)| e != a) {
        defects.push(SeriesDefect::Mismatch {
            series: series.clone(),
            index,
            expected: expected[index].clone(),
            actual: actual[index].clone(),
        });
        return;
    }
    if expected.len() > actual.len() {
        defects.push(SeriesDefect::DataLoss {
            series: series.clone(),
            missing: expected.len() - actual.len(),
            first_missing: expected[actual.len()].timestamp,
        });
    } else if actual.len() > expected.len() {
        defects.push(SeriesDefect::Duplication {
            series: series.clone(),
            extra: actual.len() - expected.len(),
            first_extra: actual[expected.len()].timestamp,
        });
    }
}
