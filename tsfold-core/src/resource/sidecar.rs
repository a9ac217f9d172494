//! Resource sidecar: versioned, checksummed record of a file resource

use super::file_resource::Bounds;
use super::{ResourceStatus, StreamKind};
use crate::interval::Interval;
use crate::{FoldError, Result, SeriesKey};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const SIDECAR_MAGIC: &[u8; 4] = b"TSRS";
const SIDECAR_VERSION: u8 = 1;
/// magic + version + body length
const HEADER_SIZE: usize = 4 + 1 + 4;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResourceSidecar {
    stream: StreamKind,
    status: ResourceStatus,
    file_size: u64,
    devices: Vec<(String, i64, i64)>,
    series: Vec<(String, String, i64, i64)>,
}

impl ResourceSidecar {
    pub(crate) fn capture(stream: StreamKind, status: ResourceStatus, bounds: &Bounds) -> Self {
        Self {
            stream,
            status,
            file_size: bounds.file_size,
            devices: bounds
                .devices
                .iter()
                .map(|(d, iv)| (d.clone(), iv.start(), iv.end()))
                .collect(),
            series: bounds
                .series
                .iter()
                .map(|(k, iv)| (k.device.clone(), k.measurement.clone(), iv.start(), iv.end()))
                .collect(),
        }
    }

    pub(crate) fn into_parts(self) -> Result<(StreamKind, ResourceStatus, Bounds)> {
        let mut bounds = Bounds {
            file_size: self.file_size,
            ..Default::default()
        };
        for (device, start, end) in self.devices {
            bounds.devices.insert(device, Interval::try_new(start, end)?);
        }
        for (device, measurement, start, end) in self.series {
            bounds
                .series
                .insert(SeriesKey::new(device, measurement), Interval::try_new(start, end)?);
        }
        Ok((self.stream, self.status, bounds))
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| FoldError::InvalidFormat(format!("sidecar encode: {}", e)))?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len() + 4);
        buf.put_slice(SIDECAR_MAGIC);
        buf.put_u8(SIDECAR_VERSION);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.to_vec())
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(FoldError::InvalidFormat("Sidecar too short".into()));
        }
        if &data[..4] != SIDECAR_MAGIC {
            return Err(FoldError::InvalidFormat("Invalid sidecar magic".into()));
        }

        let mut cursor = &data[4..];
        let version = cursor.get_u8();
        if version != SIDECAR_VERSION {
            return Err(FoldError::InvalidFormat(format!(
                "Unsupported sidecar version: {}",
                version
            )));
        }
        let body_len = cursor.get_u32_le() as usize;
        let body_end = HEADER_SIZE + body_len;
        if data.len() != body_end + 4 {
            return Err(FoldError::Corruption(format!(
                "sidecar length {} does not match body length {}",
                data.len(),
                body_len
            )));
        }

        let mut trailer = &data[body_end..];
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(&data[..body_end]);
        if expected != actual {
            return Err(FoldError::ChecksumMismatch { expected, actual });
        }

        bincode::deserialize(&data[HEADER_SIZE..body_end])
            .map_err(|e| FoldError::Corruption(format!("sidecar body: {}", e)))
    }

    pub(crate) fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        crate::io::atomic_write(path, &bytes, crate::config::IO_RETRY_ATTEMPTS)?;
        Ok(())
    }

    pub(crate) fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResourceSidecar {
        let mut bounds = Bounds::default();
        bounds.devices.insert("d1".into(), Interval::new(0, 10));
        bounds
            .series
            .insert(SeriesKey::new("d1", "s0"), Interval::new(0, 10));
        bounds.file_size = 77;
        ResourceSidecar::capture(StreamKind::Unsequence, ResourceStatus::Compacting, &bounds)
    }

    #[test]
    fn test_decode_rejects_bit_flip() {
        let mut bytes = sample().to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(ResourceSidecar::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = sample().to_bytes().unwrap();
        let err = ResourceSidecar::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_reversed_bounds_are_rejected() {
        let mut sidecar = sample();
        sidecar.devices[0] = ("d1".into(), 10, 0);
        let bytes = sidecar.to_bytes().unwrap();
        let decoded = ResourceSidecar::from_bytes(&bytes).unwrap();
        assert!(decoded.into_parts().is_err());
    }
}
