//! Chunk framing

use crate::interval::Interval;
use crate::{DataType, FoldError, Result, SeriesKey};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub series: SeriesKey,
    pub data_type: DataType,
    pub count: u32,
    pub interval: Interval,
}

/// Serialize a chunk: header, payload length, payload, CRC32
pub(crate) fn encode_chunk(header: &ChunkHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + header.series.size() + 40);

    put_str(&mut buf, &header.series.device);
    put_str(&mut buf, &header.series.measurement);
    buf.put_u8(header.data_type as u8);
    buf.put_u32_le(header.count);
    buf.put_i64_le(header.interval.start());
    buf.put_i64_le(header.interval.end());

    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.freeze()
}

/// Parse a chunk written by [`encode_chunk`], verifying its checksum
pub(crate) fn decode_chunk(data: &[u8]) -> Result<(ChunkHeader, &[u8])> {
    if data.len() < 4 {
        return Err(FoldError::InvalidFormat("Chunk too short".into()));
    }
    let body_end = data.len() - 4;
    let mut trailer = &data[body_end..];
    let expected = trailer.get_u32_le();
    let actual = crc32fast::hash(&data[..body_end]);
    if expected != actual {
        return Err(FoldError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = &data[..body_end];
    let device = get_str(&mut cursor)?;
    let measurement = get_str(&mut cursor)?;
    ensure_remaining(cursor, 1 + 4 + 8 + 8 + 4)?;
    let tag = cursor.get_u8();
    let data_type = DataType::from_u8(tag)
        .ok_or_else(|| FoldError::InvalidFormat(format!("Unknown data type tag {}", tag)))?;
    let count = cursor.get_u32_le();
    let interval = Interval::try_new(cursor.get_i64_le(), cursor.get_i64_le())?;
    let payload_len = cursor.get_u32_le() as usize;
    if cursor.len() != payload_len {
        return Err(FoldError::Corruption(format!(
            "chunk payload length {} but {} bytes remain",
            payload_len,
            cursor.len()
        )));
    }

    let header = ChunkHeader {
        series: SeriesKey::new(device, measurement),
        data_type,
        count,
        interval,
    };
    Ok((header, cursor))
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_str(cursor: &mut &[u8]) -> Result<String> {
    ensure_remaining(cursor, 2)?;
    let len = cursor.get_u16_le() as usize;
    ensure_remaining(cursor, len)?;
    let s = String::from_utf8(cursor[..len].to_vec())
        .map_err(|e| FoldError::InvalidFormat(e.to_string()))?;
    cursor.advance(len);
    Ok(s)
}

pub(crate) fn ensure_remaining(cursor: &[u8], n: usize) -> Result<()> {
    if cursor.len() < n {
        return Err(FoldError::InvalidFormat(format!(
            "need {} bytes, {} remain",
            n,
            cursor.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ChunkHeader {
        ChunkHeader {
            series: SeriesKey::new("root.sg.d1", "s0"),
            data_type: DataType::Int64,
            count: 3,
            interval: Interval::new(10, 30),
        }
    }

    #[test]
    fn test_chunk_framing() {
        let bytes = encode_chunk(&header(), b"opaque");
        let (decoded, payload) = decode_chunk(&bytes).unwrap();
        assert_eq!(decoded, header());
        assert_eq!(payload, b"opaque");
    }

    #[test]
    fn test_chunk_checksum() {
        let mut bytes = encode_chunk(&header(), b"opaque").to_vec();
        let last_payload_byte = bytes.len() - 5;
        bytes[last_payload_byte] ^= 1;
        assert!(matches!(
            decode_chunk(&bytes),
            Err(FoldError::ChecksumMismatch { .. })
        ));
    }
}
