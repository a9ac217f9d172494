//! Data file container
//!
//! Layout of a `.tsfile`:
//!
//! ```text
//! +--------+---------+---------+-----+-------+--------+
//! | header | chunk 0 | chunk 1 | ... | index | footer |
//! +--------+---------+---------+-----+-------+--------+
//! ```
//!
//! Chunks of one device are contiguous (a chunk group) and series appear in
//! `SeriesKey` order. Chunk payloads are produced by a [`ChunkCodec`];
//! this module only frames and checksums them.
//!
//! [`ChunkCodec`]: crate::codec::ChunkCodec

mod chunk;
mod reader;
mod writer;

pub use chunk::ChunkHeader;
pub use reader::{SeriesCursor, TsFileReader};
pub use writer::{TsFileSummary, TsFileWriter};

use crate::interval::Interval;
use crate::{DataType, SeriesKey};
use serde::{Deserialize, Serialize};

/// File magic, at the start and at the very end
pub const MAGIC: &[u8; 4] = b"TSFD";

/// Data file format version
pub const FORMAT_VERSION: u32 = 1;

/// magic + version
pub const HEADER_SIZE: usize = 8;

/// index offset + index size + index crc + magic
pub const FOOTER_SIZE: usize = 8 + 8 + 4 + 4;

/// Location and summary of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub series: SeriesKey,
    pub data_type: DataType,
    pub count: u32,
    pub interval: Interval,
    pub offset: u64,
    pub size: u32,
}

/// Paging policy for written chunks
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Start a new chunk after this many points
    pub max_points: usize,
    /// Start a new chunk once the raw point size reaches this many bytes
    pub max_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_points: crate::config::TARGET_CHUNK_POINTS,
            max_bytes: crate::config::TARGET_CHUNK_BYTES,
        }
    }
}
