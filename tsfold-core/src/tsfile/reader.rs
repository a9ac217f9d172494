//! Data file reader and per-series cursors

use super::chunk::{decode_chunk, ensure_remaining, get_str};
use super::{ChunkMeta, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::codec::ChunkCodec;
use crate::interval::Interval;
use crate::{DataType, FoldError, Result, SeriesKey, TimeValuePair};
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reader over one finished data file
pub struct TsFileReader {
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    index: Vec<ChunkMeta>,
    codec: Arc<dyn ChunkCodec>,
    retry_attempts: u32,
}

impl TsFileReader {
    /// Open a data file: validate header and footer, load the chunk index
    pub fn open(path: impl AsRef<Path>, codec: Arc<dyn ChunkCodec>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(FoldError::Corruption(format!(
                "{:?}: {} bytes is too short for a data file",
                path, file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(FoldError::InvalidFormat("Invalid data file header".into()));
        }
        let mut version_bytes = &header[4..];
        let version = version_bytes.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(FoldError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        let mut cursor = &footer[..];
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        let index_crc = cursor.get_u32_le();
        if cursor != MAGIC {
            return Err(FoldError::InvalidFormat("Invalid data file magic".into()));
        }
        let index_end = index_offset
            .checked_add(index_size)
            .and_then(|end| end.checked_add(FOOTER_SIZE as u64));
        if index_offset < HEADER_SIZE as u64 || index_end != Some(file_size) {
            return Err(FoldError::Corruption(format!(
                "{:?}: index [{}, +{}) does not end at the footer",
                path, index_offset, index_size
            )));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_data = vec![0u8; index_size as usize];
        file.read_exact(&mut index_data)?;
        let actual = crc32fast::hash(&index_data);
        if actual != index_crc {
            return Err(FoldError::ChecksumMismatch {
                expected: index_crc,
                actual,
            });
        }
        let index = Self::parse_index(&index_data)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size,
            index,
            codec,
            retry_attempts: crate::config::IO_RETRY_ATTEMPTS,
        })
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    fn parse_index(data: &[u8]) -> Result<Vec<ChunkMeta>> {
        let mut cursor = data;
        ensure_remaining(cursor, 4)?;
        let count = cursor.get_u32_le() as usize;
        let mut index = Vec::with_capacity(count);

        for _ in 0..count {
            let device = get_str(&mut cursor)?;
            let measurement = get_str(&mut cursor)?;
            ensure_remaining(cursor, 1 + 4 + 8 + 8 + 8 + 4)?;
            let tag = cursor.get_u8();
            let data_type = DataType::from_u8(tag)
                .ok_or_else(|| FoldError::InvalidFormat(format!("Unknown data type tag {}", tag)))?;
            let count = cursor.get_u32_le();
            let interval = Interval::try_new(cursor.get_i64_le(), cursor.get_i64_le())?;
            index.push(ChunkMeta {
                series: SeriesKey::new(device, measurement),
                data_type,
                count,
                interval,
                offset: cursor.get_u64_le(),
                size: cursor.get_u32_le(),
            });
        }
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Chunk index in file order
    pub fn chunks(&self) -> &[ChunkMeta] {
        &self.index
    }

    /// Series present in the file, sorted
    pub fn series(&self) -> Vec<SeriesKey> {
        let mut series: Vec<SeriesKey> = self.index.iter().map(|c| c.series.clone()).collect();
        series.dedup();
        series
    }

    /// Devices present in the file, sorted
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.index.iter().map(|c| c.series.device.clone()).collect();
        devices.dedup();
        devices
    }

    pub fn contains_series(&self, series: &SeriesKey) -> bool {
        self.index.iter().any(|c| &c.series == series)
    }

    /// Type recorded in the series' first chunk
    pub fn data_type(&self, series: &SeriesKey) -> Option<DataType> {
        self.index
            .iter()
            .find(|c| &c.series == series)
            .map(|c| c.data_type)
    }

    /// Read and decode one chunk, verifying its checksum
    pub fn read_chunk(&self, meta: &ChunkMeta) -> Result<Vec<TimeValuePair>> {
        let mut buf = vec![0u8; meta.size as usize];
        {
            let mut file = self.file.lock();
            crate::io::with_retry(self.retry_attempts, || {
                file.seek(SeekFrom::Start(meta.offset))?;
                file.read_exact(&mut buf)
            })?;
        }

        let (header, payload) = decode_chunk(&buf)?;
        if header.series != meta.series || header.count != meta.count {
            return Err(FoldError::Corruption(format!(
                "{:?}: chunk at {} is {} x{}, index says {} x{}",
                self.path, meta.offset, header.series, header.count, meta.series, meta.count
            )));
        }

        let points = self.codec.decode(header.data_type, payload)?;
        if points.len() != header.count as usize {
            return Err(FoldError::Corruption(format!(
                "{:?}: chunk at {} decoded {} points, expected {}",
                self.path,
                meta.offset,
                points.len(),
                header.count
            )));
        }
        Ok(points)
    }

    /// Cursor over every point of `series` in timestamp order
    pub fn cursor(&self, series: &SeriesKey) -> SeriesCursor<'_> {
        SeriesCursor {
            reader: self,
            chunks: self.index.iter().filter(|c| &c.series == series).collect(),
            next_chunk: 0,
            buffer: VecDeque::new(),
        }
    }

    /// All points of `series`
    pub fn read_series(&self, series: &SeriesKey) -> Result<Vec<TimeValuePair>> {
        let mut cursor = self.cursor(series);
        let mut points = Vec::new();
        while let Some(point) = cursor.next_point()? {
            points.push(point);
        }
        Ok(points)
    }
}

impl std::fmt::Debug for TsFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsFileReader")
            .field("path", &self.path)
            .field("chunks", &self.index.len())
            .field("codec", &self.codec.name())
            .finish()
    }
}

/// Lazily decodes one series chunk by chunk
pub struct SeriesCursor<'a> {
    reader: &'a TsFileReader,
    chunks: Vec<&'a ChunkMeta>,
    next_chunk: usize,
    buffer: VecDeque<TimeValuePair>,
}

impl<'a> SeriesCursor<'a> {
    pub fn next_point(&mut self) -> Result<Option<TimeValuePair>> {
        loop {
            if let Some(point) = self.buffer.pop_front() {
                return Ok(Some(point));
            }
            let Some(meta) = self.chunks.get(self.next_chunk) else {
                return Ok(None);
            };
            self.next_chunk += 1;
            self.buffer = self.reader.read_chunk(meta)?.into();
        }
    }

    /// Type of the series in this file, `None` if the file lacks it
    pub fn data_type(&self) -> Option<DataType> {
        self.chunks.first().map(|c| c.data_type)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn path(&self) -> &'a Path {
        self.reader.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Lz4Codec;
    use crate::tsfile::{ChunkConfig, TsFileWriter};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("1-1-0-0.tsfile");
        let config = ChunkConfig {
            max_points: 3,
            max_bytes: usize::MAX,
        };
        let mut w = TsFileWriter::create(&path, Arc::new(Lz4Codec), config).unwrap();
        for t in 0..7 {
            w.write_point(&SeriesKey::new("d1", "s0"), TimeValuePair::new(t, t * 10))
                .unwrap();
        }
        w.write_point(&SeriesKey::new("d1", "s1"), TimeValuePair::new(3, "x"))
            .unwrap();
        w.write_point(&SeriesKey::new("d2", "s0"), TimeValuePair::new(100, 1.5))
            .unwrap();
        w.finish().unwrap();
        path
    }

    #[test]
    fn test_oversized_footer_offsets_are_corruption() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let len = std::fs::metadata(&path).unwrap().len();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - FOOTER_SIZE as u64)).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.sync_all().unwrap();

        let err = TsFileReader::open(&path, Arc::new(Lz4Codec)).unwrap_err();
        assert!(err.is_corruption(), "{}", err);
    }

    #[test]
    fn test_read_back() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let reader = TsFileReader::open(&path, Arc::new(Lz4Codec)).unwrap();

        assert_eq!(reader.chunks().len(), 5);
        assert_eq!(reader.devices(), vec!["d1".to_string(), "d2".to_string()]);
        assert_eq!(reader.series().len(), 3);

        let s0 = reader.read_series(&SeriesKey::new("d1", "s0")).unwrap();
        let ts: Vec<i64> = s0.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, (0..7).collect::<Vec<_>>());
        assert_eq!(s0[6].value, crate::Value::Int64(60));

        assert_eq!(
            reader.data_type(&SeriesKey::new("d1", "s1")),
            Some(DataType::Text)
        );
        assert!(reader.cursor(&SeriesKey::new("d3", "s0")).is_empty());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert!(TsFileReader::open(&path, Arc::new(Lz4Codec)).is_err());
    }

    #[test]
    fn test_corrupt_chunk_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let offset = {
            let reader = TsFileReader::open(&path, Arc::new(Lz4Codec)).unwrap();
            reader.chunks()[0].offset + 10
        };

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[offset as usize] ^= 0x55;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let reader = TsFileReader::open(&path, Arc::new(Lz4Codec)).unwrap();
        let err = reader
            .read_series(&SeriesKey::new("d1", "s0"))
            .unwrap_err();
        assert!(err.is_corruption());
    }
}
