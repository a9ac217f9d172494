//! Compaction journal
//!
//! One journal per running compaction, named after its first target
//! (`<target>.tsfile.compaction`). It holds two kinds of records:
//!
//! - 4 bytes: record length (excluding this field)
//! - 1 byte: record type
//! - N bytes: body
//! - 4 bytes: CRC32 of type + body
//!
//! The plan record (sources and candidate targets) is written and fsynced
//! before any source changes status. The published record is the commit
//! point: once it is durable the targets replace the sources, before it
//! they are garbage.

use super::CompactionKind;
use crate::resource::{FileName, StreamKind};
use crate::{FoldError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Journal file extension, appended to the first target's file name
pub const COMPACTION_LOG_SUFFIX: &str = ".compaction";

const RECORD_PLAN: u8 = 1;
const RECORD_PUBLISHED: u8 = 2;

/// A file named in a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedFile {
    pub stream: StreamKind,
    pub name: FileName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanRecord {
    kind: CompactionKind,
    sources: Vec<LoggedFile>,
    targets: Vec<LoggedFile>,
}

/// Decoded journal
#[derive(Debug, Clone)]
pub struct LogContents {
    pub kind: CompactionKind,
    pub sources: Vec<LoggedFile>,
    /// Every name a target may have been written under
    pub targets: Vec<LoggedFile>,
    pub published: bool,
}

/// Open journal of a running compaction
#[derive(Debug)]
pub struct CompactionLog {
    path: PathBuf,
    file: File,
    retry_attempts: u32,
}

impl CompactionLog {
    /// Journal path for a compaction whose first target is `first_target`
    pub fn path_for(dir: &Path, first_target: FileName) -> PathBuf {
        dir.join(format!(
            "{}{}",
            first_target.file_name(),
            COMPACTION_LOG_SUFFIX
        ))
    }

    /// Create the journal and durably record the plan
    pub fn create(
        path: PathBuf,
        kind: CompactionKind,
        sources: Vec<LoggedFile>,
        targets: Vec<LoggedFile>,
        retry_attempts: u32,
    ) -> Result<Self> {
        let body = bincode::serialize(&PlanRecord {
            kind,
            sources,
            targets,
        })
        .map_err(|e| FoldError::InvalidFormat(e.to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut log = Self {
            path,
            file,
            retry_attempts,
        };
        log.append(RECORD_PLAN, &body)?;
        if let Some(parent) = log.path.parent() {
            crate::io::sync_dir(parent)?;
        }
        Ok(log)
    }

    /// Append the commit record
    pub fn publish(&mut self) -> Result<()> {
        self.append(RECORD_PUBLISHED, &[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the journal once nothing depends on it
    pub fn remove(self) -> Result<()> {
        let path = self.path;
        drop(self.file);
        remove_journal(&path)
    }

    fn append(&mut self, record_type: u8, body: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(body.len() + 9);
        buf.put_u32_le(0);
        buf.put_u8(record_type);
        buf.put_slice(body);
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);
        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        self.file.write_all(&buf)?;
        let file = &self.file;
        crate::io::with_retry(self.retry_attempts, || file.sync_all())?;
        Ok(())
    }

    /// Decode a journal. `None` if the plan record never became durable.
    pub fn read(path: &Path) -> Result<Option<LogContents>> {
        let data = fs::read(path)?;
        let mut records = Vec::new();
        let mut cursor = &data[..];

        while cursor.len() >= 4 {
            let len = (&cursor[..4]).get_u32_le() as usize;
            if len < 5 || cursor.len() < 4 + len {
                warn!("Torn record at the end of journal {:?}", path);
                break;
            }
            let record = &cursor[4..4 + len];
            let (content, mut trailer) = record.split_at(len - 4);
            let expected = trailer.get_u32_le();
            if crc32fast::hash(content) != expected {
                warn!("Journal {:?} has a record with a bad checksum", path);
                break;
            }
            records.push((content[0], &content[1..]));
            cursor = &cursor[4 + len..];
        }

        let Some(&(RECORD_PLAN, body)) = records.first() else {
            return Ok(None);
        };
        let plan: PlanRecord =
            bincode::deserialize(body).map_err(|e| FoldError::Corruption(e.to_string()))?;
        let published = records[1..].iter().any(|(t, _)| *t == RECORD_PUBLISHED);

        Ok(Some(LogContents {
            kind: plan.kind,
            sources: plan.sources,
            targets: plan.targets,
            published,
        }))
    }
}

/// Remove a journal file and make the unlink durable
pub(crate) fn remove_journal(path: &Path) -> Result<()> {
    crate::io::remove_if_exists(path)?;
    if let Some(parent) = path.parent() {
        crate::io::sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(stream: StreamKind, versions: &[u64]) -> Vec<LoggedFile> {
        versions
            .iter()
            .map(|&v| LoggedFile {
                stream,
                name: FileName::new(100, v),
            })
            .collect()
    }

    fn create(dir: &TempDir) -> CompactionLog {
        let target = FileName::new(100, 1).with_cross(1);
        CompactionLog::create(
            CompactionLog::path_for(dir.path(), target),
            CompactionKind::Cross,
            files(StreamKind::Sequence, &[1, 2]),
            vec![LoggedFile {
                stream: StreamKind::Sequence,
                name: target,
            }],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_plan_then_publish() {
        let dir = TempDir::new().unwrap();
        let mut log = create(&dir);
        let path = log.path().to_path_buf();
        assert!(path.to_string_lossy().ends_with("100-1-0-1.tsfile.compaction"));

        let contents = CompactionLog::read(&path).unwrap().unwrap();
        assert_eq!(contents.kind, CompactionKind::Cross);
        assert_eq!(contents.sources.len(), 2);
        assert!(!contents.published);

        log.publish().unwrap();
        assert!(CompactionLog::read(&path).unwrap().unwrap().published);

        log.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_torn_publish_record_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut log = create(&dir);
        log.publish().unwrap();
        let path = log.path().to_path_buf();
        drop(log);

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 2]).unwrap();
        let contents = CompactionLog::read(&path).unwrap().unwrap();
        assert!(!contents.published);
    }

    #[test]
    fn test_torn_plan_record() {
        let dir = TempDir::new().unwrap();
        let log = create(&dir);
        let path = log.path().to_path_buf();
        drop(log);

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..10]).unwrap();
        assert!(CompactionLog::read(&path).unwrap().is_none());
    }
}
