//! K-way merge of one series across several source files

use crate::resource::{FileName, FileResource, StreamKind};
use crate::tsfile::SeriesCursor;
use crate::{Result, TimeValuePair, Timestamp, Value};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Last-writer-wins rank of a source; the greater priority wins a collision.
///
/// Within one space the file name order decides. Across spaces the
/// unsequence file wins, since it holds the later arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MergePriority {
    unsequence: bool,
    name: FileName,
}

impl MergePriority {
    pub fn new(stream: StreamKind, name: FileName) -> Self {
        Self {
            unsequence: stream == StreamKind::Unsequence,
            name,
        }
    }

    pub fn of(resource: &FileResource) -> Self {
        Self::new(resource.stream(), resource.name())
    }
}

struct HeapEntry {
    timestamp: Timestamp,
    priority: MergePriority,
    source: usize,
    value: Value,
}

// Max-heap order: earliest timestamp first, then highest priority
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merges per-source cursors of one series into one ordered, deduplicated
/// stream. On equal timestamps the highest-priority point is emitted and the
/// others are dropped.
pub struct SeriesMerger<'a> {
    sources: Vec<(SeriesCursor<'a>, MergePriority)>,
    heap: BinaryHeap<HeapEntry>,
    last_emitted: Option<Timestamp>,
    duplicates: u64,
}

impl<'a> SeriesMerger<'a> {
    pub fn new(sources: Vec<(SeriesCursor<'a>, MergePriority)>) -> Result<Self> {
        let mut merger = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            last_emitted: None,
            duplicates: 0,
        };
        for source in 0..merger.sources.len() {
            merger.refill(source)?;
        }
        Ok(merger)
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        let (cursor, priority) = &mut self.sources[source];
        if let Some(point) = cursor.next_point()? {
            self.heap.push(HeapEntry {
                timestamp: point.timestamp,
                priority: *priority,
                source,
                value: point.value,
            });
        }
        Ok(())
    }

    pub fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        while let Some(top) = self.heap.pop() {
            self.refill(top.source)?;
            if self.last_emitted == Some(top.timestamp) {
                self.duplicates += 1;
                continue;
            }
            self.last_emitted = Some(top.timestamp);
            return Ok(Some(TimeValuePair {
                timestamp: top.timestamp,
                value: top.value,
            }));
        }
        Ok(None)
    }

    /// Points shadowed by a higher-priority point at the same timestamp
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Lz4Codec;
    use crate::tsfile::{ChunkConfig, TsFileReader, TsFileWriter};
    use crate::SeriesKey;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: FileName, points: &[(i64, i64)]) -> TsFileReader {
        let path = dir.path().join(name.file_name());
        let key = SeriesKey::new("d1", "s0");
        let config = ChunkConfig {
            max_points: 2,
            max_bytes: usize::MAX,
        };
        let mut w = TsFileWriter::create(&path, Arc::new(Lz4Codec), config).unwrap();
        for &(t, v) in points {
            w.write_point(&key, TimeValuePair::new(t, v)).unwrap();
        }
        w.finish().unwrap();
        TsFileReader::open(&path, Arc::new(Lz4Codec)).unwrap()
    }

    fn drain(merger: &mut SeriesMerger<'_>) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        while let Some(p) = merger.next_point().unwrap() {
            match p.value {
                Value::Int64(v) => out.push((p.timestamp, v)),
                other => panic!("unexpected value {:?}", other),
            }
        }
        out
    }

    #[test]
    fn test_priority_order() {
        let old = MergePriority::new(StreamKind::Sequence, FileName::new(10, 1));
        let newer = MergePriority::new(StreamKind::Sequence, FileName::new(10, 2));
        let late = MergePriority::new(StreamKind::Unsequence, FileName::new(5, 0));
        assert!(old < newer);
        assert!(newer < late);
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let key = SeriesKey::new("d1", "s0");
        let a = write(&dir, FileName::new(1, 1), &[(1, 10), (3, 10), (5, 10), (7, 10)]);
        let b = write(&dir, FileName::new(1, 2), &[(2, 20), (3, 20), (7, 20), (9, 20)]);
        let c = write(&dir, FileName::new(1, 3), &[(3, 30)]);

        let mut merger = SeriesMerger::new(vec![
            (a.cursor(&key), MergePriority::new(StreamKind::Sequence, FileName::new(1, 1))),
            (c.cursor(&key), MergePriority::new(StreamKind::Sequence, FileName::new(1, 3))),
            (b.cursor(&key), MergePriority::new(StreamKind::Sequence, FileName::new(1, 2))),
        ])
        .unwrap();

        assert_eq!(
            drain(&mut merger),
            vec![(1, 10), (2, 20), (3, 30), (5, 10), (7, 20), (9, 20)]
        );
        assert_eq!(merger.duplicates_dropped(), 3);
    }

    #[test]
    fn test_merge_with_empty_source() {
        let dir = TempDir::new().unwrap();
        let key = SeriesKey::new("d1", "s0");
        let a = write(&dir, FileName::new(1, 1), &[(4, 1), (8, 2)]);
        let other = SeriesKey::new("d9", "s0");

        let mut merger = SeriesMerger::new(vec![
            (a.cursor(&key), MergePriority::new(StreamKind::Sequence, FileName::new(1, 1))),
            (a.cursor(&other), MergePriority::new(StreamKind::Sequence, FileName::new(1, 1))),
        ])
        .unwrap();
        assert_eq!(drain(&mut merger), vec![(4, 1), (8, 2)]);
        assert_eq!(merger.duplicates_dropped(), 0);
    }
}
