//! Chunk payload codec
//!
//! The engine never looks inside a chunk payload: it hands a series' ordered
//! points to a [`ChunkCodec`] and stores whatever bytes come back.

use crate::{DataType, FoldError, Result, TimeValuePair};

/// Encoding capability for one series chunk
pub trait ChunkCodec: Send + Sync {
    /// Short identifier, recorded for diagnostics
    fn name(&self) -> &'static str;

    /// Encode ordered points of one series into an opaque payload
    fn encode(&self, data_type: DataType, points: &[TimeValuePair]) -> Result<Vec<u8>>;

    /// Inverse of [`ChunkCodec::encode`]
    fn decode(&self, data_type: DataType, payload: &[u8]) -> Result<Vec<TimeValuePair>>;
}

/// Default codec: bincode points compressed with LZ4
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl ChunkCodec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, data_type: DataType, points: &[TimeValuePair]) -> Result<Vec<u8>> {
        if let Some(bad) = points.iter().find(|p| p.value.data_type() != data_type) {
            return Err(FoldError::Codec(format!(
                "{} value at {} in a {} chunk",
                bad.value.data_type(),
                bad.timestamp,
                data_type
            )));
        }
        let raw = bincode::serialize(points).map_err(|e| FoldError::Codec(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(&self, data_type: DataType, payload: &[u8]) -> Result<Vec<TimeValuePair>> {
        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| FoldError::Codec(e.to_string()))?;
        let points: Vec<TimeValuePair> =
            bincode::deserialize(&raw).map_err(|e| FoldError::Codec(e.to_string()))?;
        if points.iter().any(|p| p.value.data_type() != data_type) {
            return Err(FoldError::Codec(format!(
                "decoded values do not match chunk type {}",
                data_type
            )));
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_codec() {
        let codec = Lz4Codec;
        let points: Vec<_> = (0..500)
            .map(|i| TimeValuePair::new(i * 10, i as f64 * 0.5))
            .collect();

        let payload = codec.encode(DataType::Double, &points).unwrap();
        assert!(!payload.is_empty());

        let decoded = codec.decode(DataType::Double, &payload).unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_type_mismatch() {
        let codec = Lz4Codec;
        let points = vec![TimeValuePair::new(1, 1i64)];
        assert!(codec.encode(DataType::Double, &points).is_err());

        let payload = codec.encode(DataType::Int64, &points).unwrap();
        assert!(codec.decode(DataType::Text, &payload).is_err());
        assert!(codec.decode(DataType::Int64, &payload[..3]).is_err());
    }
}
