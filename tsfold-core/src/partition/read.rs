//! Pinned read views

use crate::codec::ChunkCodec;
use crate::compaction::{MergePriority, SeriesMerger};
use crate::interval::Interval;
use crate::registry::RegistrySnapshot;
use crate::resource::{FileResource, PinGuard, ResourceStatus};
use crate::tsfile::TsFileReader;
use crate::{FoldError, Result, SeriesKey, TimeValuePair};
use std::sync::Arc;

/// A consistent set of files held open against retirement.
///
/// Every file of the snapshot is pinned, so a compaction that finishes while
/// the view is alive parks its sources instead of deleting them.
pub struct ReadView {
    guards: Vec<PinGuard>,
    codec: Arc<dyn ChunkCodec>,
}

impl ReadView {
    /// Pin the closed files of `snapshot`. `Ok(None)` if one of them was
    /// deleted in the meantime and a fresh snapshot is needed.
    pub(super) fn pin(
        snapshot: &RegistrySnapshot,
        codec: Arc<dyn ChunkCodec>,
    ) -> Result<Option<Self>> {
        let mut guards = Vec::with_capacity(snapshot.len());
        let files = snapshot.sequence.iter().chain(snapshot.unsequence.iter());
        for resource in files.filter(|r| r.status() != ResourceStatus::Unclosed) {
            match resource.pin() {
                Ok(guard) => guards.push(guard),
                Err(FoldError::ResourceDeleted(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(Self { guards, codec }))
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<FileResource>> {
        self.guards.iter().map(PinGuard::resource)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Points of `series` within `range`, merged across files with the same
    /// precedence a compaction applies
    pub fn query(&self, series: &SeriesKey, range: Interval) -> Result<Vec<TimeValuePair>> {
        let readers = self
            .resources()
            .filter(|r| r.series_interval(series).is_some_and(|iv| iv.overlaps(&range)))
            .map(|r| -> Result<(TsFileReader, MergePriority)> {
                Ok((
                    TsFileReader::open(r.path(), Arc::clone(&self.codec))?,
                    MergePriority::of(r),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let cursors = readers
            .iter()
            .map(|(reader, priority)| (reader.cursor(series), *priority))
            .collect();
        let mut merger = SeriesMerger::new(cursors)?;

        let mut points = Vec::new();
        while let Some(point) = merger.next_point()? {
            if point.timestamp > range.end() {
                break;
            }
            if range.contains(point.timestamp) {
                points.push(point);
            }
        }
        Ok(points)
    }
}

impl std::fmt::Debug for ReadView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadView")
            .field("files", &self.guards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::interval::Interval;
    use crate::partition::{PartitionConfig, StoragePartition};
    use crate::registry::PartitionId;
    use crate::resource::StreamKind;
    use crate::{SeriesKey, TimeValuePair};
    use tempfile::TempDir;

    #[test]
    fn test_query_prefers_unsequence_on_collision() {
        let dir = TempDir::new().unwrap();
        let partition =
            StoragePartition::open(dir.path(), PartitionId::new("root.sg", 0), PartitionConfig::default())
                .unwrap();
        let key = SeriesKey::new("d1", "s0");

        let seq: Vec<_> = (0..10)
            .map(|t| (key.clone(), TimeValuePair::new(t, t)))
            .collect();
        partition.ingest(&seq).unwrap();
        let late = vec![(key.clone(), TimeValuePair::new(4, 400i64))];
        let sealed = partition.ingest(&late).unwrap();
        assert_eq!(sealed[0].stream(), StreamKind::Unsequence);

        let view = partition.pin_for_read().unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.resources().all(|r| r.pin_count() == 1));

        let points = view.query(&key, Interval::new(3, 5)).unwrap();
        assert_eq!(
            points,
            vec![
                TimeValuePair::new(3, 3i64),
                TimeValuePair::new(4, 400i64),
                TimeValuePair::new(5, 5i64),
            ]
        );
        assert!(view
            .query(&SeriesKey::new("d2", "s0"), Interval::new(0, 100))
            .unwrap()
            .is_empty());

        let files: Vec<_> = view.resources().cloned().collect();
        drop(view);
        assert!(files.iter().all(|r| r.pin_count() == 0));
    }
}
