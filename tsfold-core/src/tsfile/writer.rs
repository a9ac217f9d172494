//! Streaming data file writer

use super::chunk::{encode_chunk, put_str};
use super::{ChunkConfig, ChunkHeader, ChunkMeta, FORMAT_VERSION, MAGIC};
use crate::codec::ChunkCodec;
use crate::interval::Interval;
use crate::resource::FileResource;
use crate::{DataType, FoldError, Result, SeriesKey, TimeValuePair, Timestamp};
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes series in `SeriesKey` order, each series in strictly increasing
/// timestamp order. Chunks are flushed to disk as soon as they fill up.
pub struct TsFileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    codec: Arc<dyn ChunkCodec>,
    config: ChunkConfig,
    retry_attempts: u32,
    offset: u64,
    index: Vec<ChunkMeta>,
    pending: Option<PendingChunk>,
    last: Option<(SeriesKey, Timestamp, DataType)>,
    point_count: u64,
}

struct PendingChunk {
    series: SeriesKey,
    data_type: DataType,
    points: Vec<TimeValuePair>,
    bytes: usize,
}

/// Result of a finished file
#[derive(Debug, Clone)]
pub struct TsFileSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub point_count: u64,
    pub chunks: Vec<ChunkMeta>,
}

impl TsFileSummary {
    /// Per-series time bounds of everything written
    pub fn series_bounds(&self) -> BTreeMap<SeriesKey, Interval> {
        let mut bounds: BTreeMap<SeriesKey, Interval> = BTreeMap::new();
        for chunk in &self.chunks {
            bounds
                .entry(chunk.series.clone())
                .and_modify(|iv| *iv = iv.span(&chunk.interval))
                .or_insert(chunk.interval);
        }
        bounds
    }

    /// Record bounds and size on an UNCLOSED resource
    pub fn apply_to(&self, resource: &FileResource) -> Result<()> {
        for (series, interval) in self.series_bounds() {
            resource.update_series(&series, interval)?;
        }
        resource.set_file_size(self.file_size)
    }
}

impl TsFileWriter {
    /// Create the file and write its header
    pub fn create(
        path: impl AsRef<Path>,
        codec: Arc<dyn ChunkCodec>,
        config: ChunkConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);

        let mut header = BytesMut::with_capacity(super::HEADER_SIZE);
        header.put_slice(MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        file.write_all(&header)?;

        Ok(Self {
            path,
            file,
            codec,
            config,
            retry_attempts: crate::config::IO_RETRY_ATTEMPTS,
            offset: header.len() as u64,
            index: Vec::new(),
            pending: None,
            last: None,
            point_count: 0,
        })
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes on disk plus the raw size of the open chunk
    pub fn bytes_written(&self) -> u64 {
        self.offset + self.pending.as_ref().map_or(0, |p| p.bytes as u64)
    }

    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    /// Append one point
    pub fn write_point(&mut self, series: &SeriesKey, point: TimeValuePair) -> Result<()> {
        let data_type = point.value.data_type();
        if let Some((last_series, last_ts, last_type)) = &self.last {
            match series.cmp(last_series) {
                std::cmp::Ordering::Less => {
                    return Err(FoldError::InvalidFormat(format!(
                        "series {} written after {}",
                        series, last_series
                    )));
                }
                std::cmp::Ordering::Equal => {
                    if point.timestamp <= *last_ts {
                        return Err(FoldError::InvalidFormat(format!(
                            "{}: timestamp {} not after {}",
                            series, point.timestamp, last_ts
                        )));
                    }
                    if data_type != *last_type {
                        return Err(FoldError::Codec(format!(
                            "{}: {} value in a {} series",
                            series, data_type, last_type
                        )));
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }

        if self.pending.as_ref().is_some_and(|p| &p.series != series) {
            self.flush_chunk()?;
        }

        self.last = Some((series.clone(), point.timestamp, data_type));
        self.point_count += 1;

        let pending = self.pending.get_or_insert_with(|| PendingChunk {
            series: series.clone(),
            data_type,
            points: Vec::new(),
            bytes: 0,
        });
        pending.bytes += point.size();
        pending.points.push(point);

        if pending.points.len() >= self.config.max_points || pending.bytes >= self.config.max_bytes {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Append an ordered run of points of one series
    pub fn write_series(&mut self, series: &SeriesKey, points: &[TimeValuePair]) -> Result<()> {
        for point in points {
            self.write_point(series, point.clone())?;
        }
        Ok(())
    }

    /// Close the open chunk, if any
    pub fn flush_chunk(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let (first, last) = match (pending.points.first(), pending.points.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Ok(()),
        };

        let header = ChunkHeader {
            series: pending.series,
            data_type: pending.data_type,
            count: pending.points.len() as u32,
            interval: Interval::try_new(first, last)?,
        };
        let payload = self.codec.encode(header.data_type, &pending.points)?;
        let bytes = encode_chunk(&header, &payload);
        self.file.write_all(&bytes)?;

        self.index.push(ChunkMeta {
            series: header.series,
            data_type: header.data_type,
            count: header.count,
            interval: header.interval,
            offset: self.offset,
            size: bytes.len() as u32,
        });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Write index and footer, then fsync
    pub fn finish(mut self) -> Result<TsFileSummary> {
        self.flush_chunk()?;

        let index_offset = self.offset;
        let index = self.encode_index();
        self.file.write_all(&index)?;

        let mut footer = BytesMut::with_capacity(super::FOOTER_SIZE);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_slice(MAGIC);
        self.file.write_all(&footer)?;

        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        crate::io::with_retry(self.retry_attempts, || file.sync_all())?;

        Ok(TsFileSummary {
            path: self.path,
            file_size: index_offset + index.len() as u64 + footer.len() as u64,
            point_count: self.point_count,
            chunks: self.index,
        })
    }

    /// Drop the partial file
    pub fn abort(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        crate::io::remove_if_exists(&path)?;
        Ok(())
    }

    fn encode_index(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.index.len() as u32);
        for meta in &self.index {
            put_str(&mut buf, &meta.series.device);
            put_str(&mut buf, &meta.series.measurement);
            buf.put_u8(meta.data_type as u8);
            buf.put_u32_le(meta.count);
            buf.put_i64_le(meta.interval.start());
            buf.put_i64_le(meta.interval.end());
            buf.put_u64_le(meta.offset);
            buf.put_u32_le(meta.size);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Lz4Codec;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, max_points: usize) -> TsFileWriter {
        let config = ChunkConfig {
            max_points,
            max_bytes: usize::MAX,
        };
        TsFileWriter::create(dir.path().join("1-1-0-0.tsfile"), Arc::new(Lz4Codec), config).unwrap()
    }

    #[test]
    fn test_chunks_split_at_point_limit() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 4);
        let key = SeriesKey::new("root.sg.d1", "s0");
        for t in 0..10 {
            w.write_point(&key, TimeValuePair::new(t, t)).unwrap();
        }
        let summary = w.finish().unwrap();

        assert_eq!(summary.point_count, 10);
        let counts: Vec<u32> = summary.chunks.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![4, 4, 2]);
        assert_eq!(summary.series_bounds()[&key], Interval::new(0, 9));
        assert_eq!(
            summary.file_size,
            std::fs::metadata(&summary.path).unwrap().len()
        );
    }

    #[test]
    fn test_rejects_out_of_order_writes() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 100);
        let s1 = SeriesKey::new("d1", "s1");
        let s0 = SeriesKey::new("d1", "s0");

        w.write_point(&s1, TimeValuePair::new(5, 1i64)).unwrap();
        assert!(w.write_point(&s1, TimeValuePair::new(5, 2i64)).is_err());
        assert!(w.write_point(&s1, TimeValuePair::new(6, 2.0)).is_err());
        assert!(w.write_point(&s0, TimeValuePair::new(9, 1i64)).is_err());
        w.write_point(&s1, TimeValuePair::new(6, 2i64)).unwrap();
    }

    #[test]
    fn test_abort_removes_file() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 100);
        w.write_point(&SeriesKey::new("d1", "s0"), TimeValuePair::new(1, true))
            .unwrap();
        let path = w.path().to_path_buf();
        w.abort().unwrap();
        assert!(!path.exists());
    }
}
