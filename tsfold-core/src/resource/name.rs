//! Data file naming: `<creationTimestamp>-<version>-<inner>-<cross>.tsfile`

use crate::{FoldError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data file extension
pub const TSFILE_SUFFIX: &str = ".tsfile";

/// Sidecar extension, appended to the data file name
pub const RESOURCE_SUFFIX: &str = ".resource";

/// Name quadruple of a data file.
///
/// Field order matters: the derived `Ord` is the total order used for
/// selection order, recovery replay and last-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileName {
    pub timestamp: i64,
    pub version: u64,
    pub inner_compaction_count: u32,
    pub cross_compaction_count: u32,
}

impl FileName {
    /// Name of a freshly flushed file
    pub fn new(timestamp: i64, version: u64) -> Self {
        Self {
            timestamp,
            version,
            inner_compaction_count: 0,
            cross_compaction_count: 0,
        }
    }

    /// Same file position, produced by another inner compaction
    pub fn with_inner(self, count: u32) -> Self {
        Self {
            inner_compaction_count: count,
            ..self
        }
    }

    /// Same file position, produced by another cross compaction
    pub fn with_cross(self, count: u32) -> Self {
        Self {
            cross_compaction_count: count,
            ..self
        }
    }

    /// File name with extension
    pub fn file_name(&self) -> String {
        format!("{}{}", self, TSFILE_SUFFIX)
    }

    /// Parse a data file name (with or without the extension)
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.timestamp, self.version, self.inner_compaction_count, self.cross_compaction_count
        )
    }
}

impl FromStr for FileName {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self> {
        let stem = s.strip_suffix(TSFILE_SUFFIX).unwrap_or(s);
        let invalid = || FoldError::InvalidFormat(format!("bad data file name: {}", s));

        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        Ok(Self {
            timestamp: parts[0].parse().map_err(|_| invalid())?,
            version: parts[1].parse().map_err(|_| invalid())?,
            inner_compaction_count: parts[2].parse().map_err(|_| invalid())?,
            cross_compaction_count: parts[3].parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let name = FileName::parse("1700000000000-12-3-1.tsfile").unwrap();
        assert_eq!(name.timestamp, 1_700_000_000_000);
        assert_eq!(name.version, 12);
        assert_eq!(name.inner_compaction_count, 3);
        assert_eq!(name.cross_compaction_count, 1);
        assert_eq!(name.file_name(), "1700000000000-12-3-1.tsfile");
        assert_eq!(FileName::parse("1700000000000-12-3-1").unwrap(), name);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(FileName::parse("abc.tsfile").is_err());
        assert!(FileName::parse("1-2-3.tsfile").is_err());
        assert!(FileName::parse("1-2-3-x.tsfile").is_err());
        assert!(FileName::parse("1-2-3-4-5.tsfile").is_err());
    }

    #[test]
    fn test_total_order() {
        let a = FileName::new(100, 1);
        let b = FileName::new(100, 2);
        let c = FileName::new(101, 0);
        assert!(a < b && b < c);
        assert!(a < a.with_inner(1));
        assert!(a.with_inner(1) < a.with_inner(1).with_cross(1));
        assert!(a.with_inner(5) < b);
    }
}
