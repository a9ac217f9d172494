//! Startup recovery
//!
//! Runs before a partition accepts work:
//!
//! 1. every compaction journal is resolved: unpublished merges are rolled
//!    back (targets deleted, sources CLOSED again), published ones are rolled
//!    forward (leftover sources deleted)
//! 2. leftover temp files and sidecars without data are removed
//! 3. every data file with a sidecar is registered; in-flight statuses
//!    revert to CLOSED

use super::StoragePartition;
use crate::compaction::{CompactionLog, LoggedFile, COMPACTION_LOG_SUFFIX};
use crate::resource::{FileResource, ResourceStatus, StreamKind, RESOURCE_SUFFIX, TSFILE_SUFFIX};
use crate::{io, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TEMP_SUFFIX: &str = ".tmp";

/// What recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Unpublished compactions undone
    pub rolled_back: usize,
    /// Published compactions completed
    pub rolled_forward: usize,
    /// Journals without a durable plan
    pub empty_journals: usize,
    /// Files found COMPACTING or COMPACTION_CANDIDATE and reset to CLOSED
    pub reverted: usize,
    /// Files registered
    pub loaded: usize,
    /// Temp files and sidecars without data removed
    pub leftovers_removed: usize,
    /// Data files skipped (no sidecar, still UNCLOSED, or unreadable sidecar)
    pub ignored: usize,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loaded {}, rolled back {}, rolled forward {}, reverted {}, ignored {}",
            self.loaded, self.rolled_back, self.rolled_forward, self.reverted, self.ignored
        )
    }
}

fn files_in(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((entry.path(), name.to_string()));
        }
    }
    files.sort();
    Ok(files)
}

/// Delete a data file together with its sidecar and any temp copies
fn remove_data_file(path: &Path) -> Result<()> {
    let sidecar = FileResource::sidecar_path(path);
    io::remove_if_exists(path)?;
    io::remove_if_exists(&io::temp_path(path))?;
    io::remove_if_exists(&sidecar)?;
    io::remove_if_exists(&io::temp_path(&sidecar))?;
    Ok(())
}

impl StoragePartition {
    fn logged_path(&self, file: &LoggedFile) -> PathBuf {
        self.dir(file.stream).join(file.name.file_name())
    }

    /// Resolve every compaction journal of the partition
    pub(super) fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for stream in [StreamKind::Sequence, StreamKind::Unsequence] {
            for (path, name) in files_in(self.dir(stream))? {
                if name.ends_with(COMPACTION_LOG_SUFFIX) {
                    self.resolve_journal(&path, &mut report)?;
                }
            }
        }
        if report.rolled_back + report.rolled_forward > 0 {
            for stream in [StreamKind::Sequence, StreamKind::Unsequence] {
                io::sync_dir(self.dir(stream))?;
            }
        }
        Ok(report)
    }

    fn resolve_journal(&self, journal: &Path, report: &mut RecoveryReport) -> Result<()> {
        match CompactionLog::read(journal)? {
            None => {
                debug!("Journal {:?} has no plan, removing it", journal);
                report.empty_journals += 1;
            }
            Some(contents) if contents.published => {
                info!(
                    "Completing published {} compaction from {:?}",
                    contents.kind, journal
                );
                for source in &contents.sources {
                    remove_data_file(&self.logged_path(source))?;
                }
                report.rolled_forward += 1;
            }
            Some(contents) => {
                info!(
                    "Rolling back unpublished {} compaction from {:?}",
                    contents.kind, journal
                );
                for target in &contents.targets {
                    remove_data_file(&self.logged_path(target))?;
                }
                for source in &contents.sources {
                    self.release_source(&self.logged_path(source), report)?;
                }
                report.rolled_back += 1;
            }
        }
        crate::compaction::release_journal(journal);
        Ok(())
    }

    fn release_source(&self, path: &Path, report: &mut RecoveryReport) -> Result<()> {
        if !FileResource::sidecar_path(path).exists() {
            warn!("Compaction source {:?} has no sidecar", path);
            return Ok(());
        }
        let resource = FileResource::deserialize(path)?;
        if resource.status().is_in_flight() {
            resource.persist_status(ResourceStatus::Closed)?;
            report.reverted += 1;
        }
        Ok(())
    }

    /// Register every sealed file; returns the highest version seen
    pub(super) fn load(&self, report: &mut RecoveryReport) -> Result<u64> {
        let mut max_version = 0;
        for stream in [StreamKind::Sequence, StreamKind::Unsequence] {
            let dir = self.dir(stream);
            for (path, name) in files_in(dir)? {
                if name.ends_with(TEMP_SUFFIX) {
                    io::remove_if_exists(&path)?;
                    report.leftovers_removed += 1;
                } else if let Some(data_name) = name.strip_suffix(RESOURCE_SUFFIX) {
                    if !dir.join(data_name).exists() {
                        warn!("Dropping sidecar {:?} without data file", path);
                        io::remove_if_exists(&path)?;
                        report.leftovers_removed += 1;
                    }
                }
            }

            for (path, name) in files_in(dir)? {
                if !name.ends_with(TSFILE_SUFFIX) {
                    continue;
                }
                let Some(resource) = self.load_file(&path, stream, report) else {
                    report.ignored += 1;
                    continue;
                };
                max_version = max_version.max(resource.name().version);
                self.registry.add(Arc::new(resource))?;
                report.loaded += 1;
            }
        }
        Ok(max_version)
    }

    fn load_file(
        &self,
        path: &Path,
        stream: StreamKind,
        report: &mut RecoveryReport,
    ) -> Option<FileResource> {
        if !FileResource::sidecar_path(path).exists() {
            warn!("Ignoring data file {:?} without sidecar", path);
            return None;
        }
        let resource = match FileResource::deserialize(path) {
            Ok(resource) => resource,
            Err(e) => {
                warn!("Ignoring {:?}, sidecar unreadable: {}", path, e);
                return None;
            }
        };
        if resource.stream() != stream {
            warn!(
                "Ignoring {:?}: sidecar says {}, found under {}",
                path,
                resource.stream().dir_name(),
                stream.dir_name()
            );
            return None;
        }

        match resource.status() {
            ResourceStatus::Closed => Some(resource),
            status if status.is_in_flight() => {
                let reset = resource
                    .set_status(ResourceStatus::Closed)
                    .and_then(|()| resource.serialize());
                if let Err(e) = reset {
                    warn!("Ignoring {:?}, failed to reset to CLOSED: {}", path, e);
                    return None;
                }
                report.reverted += 1;
                Some(resource)
            }
            status => {
                warn!("Ignoring {:?} in status {:?}", path, status);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{self, FaultPoint, MergeExecutor};
    use crate::interval::Interval;
    use crate::partition::PartitionConfig;
    use crate::registry::PartitionId;
    use crate::resource::FileName;
    use crate::{FoldError, SeriesKey, TimeValuePair};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn open(dir: &TempDir) -> StoragePartition {
        StoragePartition::open(dir.path(), PartitionId::new("root.sg", 0), PartitionConfig::default())
            .unwrap()
    }

    fn batch(range: std::ops::RangeInclusive<i64>, scale: i64) -> Vec<(SeriesKey, TimeValuePair)> {
        let mut points = Vec::new();
        for t in range {
            for device in ["d1", "d2"] {
                points.push((SeriesKey::new(device, "s0"), TimeValuePair::new(t, t * scale)));
            }
        }
        points
    }

    /// Two sequence files and one overlapping unsequence file
    fn populate(partition: &StoragePartition) {
        partition.ingest(&batch(0..=99, 1)).unwrap();
        partition.ingest(&batch(100..=199, 1)).unwrap();
        partition.ingest(&batch(50..=120, 10)).unwrap();
    }

    fn read_all(partition: &StoragePartition) -> Vec<Vec<TimeValuePair>> {
        let view = partition.pin_for_read().unwrap();
        ["d1", "d2"]
            .iter()
            .map(|d| {
                view.query(&SeriesKey::new(*d, "s0"), Interval::new(i64::MIN, i64::MAX))
                    .unwrap()
            })
            .collect()
    }

    fn journals(partition: &StoragePartition) -> usize {
        [StreamKind::Sequence, StreamKind::Unsequence]
            .iter()
            .flat_map(|s| files_in(partition.dir(*s)).unwrap())
            .filter(|(_, name)| name.ends_with(COMPACTION_LOG_SUFFIX))
            .count()
    }

    fn crash_at(fault: FaultPoint) -> (TempDir, Vec<Vec<TimeValuePair>>) {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir);
        populate(&partition);
        let before = read_all(&partition);

        let plan = partition.select().unwrap();
        assert!(plan.kind.is_cross());
        compaction::claim(&plan).unwrap();
        let executor = MergeExecutor::new(partition.config.compaction.clone()).with_fault(fault);
        let err = executor
            .execute(&plan, &partition.registry, &partition.stats, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, FoldError::Internal(_)));
        (dir, before)
    }

    #[test]
    fn test_crash_before_publish_rolls_back() {
        for fault in [
            FaultPoint::AfterJournal,
            FaultPoint::AfterSourcesMarked,
            FaultPoint::AfterFirstSeries,
            FaultPoint::BeforePublish,
        ] {
            let (dir, before) = crash_at(fault);
            let partition = open(&dir);

            assert_eq!(partition.registry().len(StreamKind::Sequence), 2, "{:?}", fault);
            assert_eq!(partition.registry().len(StreamKind::Unsequence), 1, "{:?}", fault);
            for resource in partition.snapshot().sequence.iter() {
                assert_eq!(resource.status(), ResourceStatus::Closed);
                assert_eq!(resource.name().cross_compaction_count, 0);
            }
            assert_eq!(journals(&partition), 0);
            assert_eq!(read_all(&partition), before, "{:?}", fault);

            // the partition is usable again
            let outcome = partition.compact_once(&CancellationToken::new()).unwrap();
            assert!(outcome.is_some());
            assert_eq!(read_all(&partition), before);
        }
    }

    #[test]
    fn test_crash_after_publish_rolls_forward() {
        for fault in [FaultPoint::AfterPublish, FaultPoint::AfterSwap] {
            let (dir, before) = crash_at(fault);
            let partition = open(&dir);

            let sequence = partition.registry().list(StreamKind::Sequence);
            assert_eq!(sequence.len(), 1, "{:?}", fault);
            assert_eq!(sequence[0].name().cross_compaction_count, 1);
            assert_eq!(sequence[0].status(), ResourceStatus::Closed);
            assert_eq!(partition.registry().len(StreamKind::Unsequence), 0);
            assert_eq!(journals(&partition), 0);
            assert_eq!(read_all(&partition), before, "{:?}", fault);
        }
    }

    #[test]
    fn test_recovery_is_repeatable() {
        let (dir, before) = crash_at(FaultPoint::AfterFirstSeries);
        drop(open(&dir));
        let partition = open(&dir);
        assert_eq!(partition.registry().len(StreamKind::Sequence), 2);
        assert_eq!(read_all(&partition), before);
    }

    #[test]
    fn test_load_cleans_leftovers() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir);
        partition.ingest(&batch(0..=9, 1)).unwrap();
        let seq_dir = partition.dir(StreamKind::Sequence).to_path_buf();
        let live_version = partition.registry().list(StreamKind::Sequence)[0]
            .name()
            .version;
        drop(partition);

        let orphan_sidecar = seq_dir.join(format!(
            "{}{}",
            FileName::new(1, 900).file_name(),
            RESOURCE_SUFFIX
        ));
        fs::write(&orphan_sidecar, b"stale").unwrap();
        let temp = seq_dir.join("x.tsfile.resource.tmp");
        fs::write(&temp, b"partial").unwrap();
        let bare_data = seq_dir.join(FileName::new(1, 901).file_name());
        fs::write(&bare_data, b"no sidecar").unwrap();

        let partition = open(&dir);
        assert!(!orphan_sidecar.exists());
        assert!(!temp.exists());
        assert!(bare_data.exists());
        assert_eq!(partition.registry().len(StreamKind::Sequence), 1);
        assert!(partition.status().next_version > live_version);
    }

    #[test]
    fn test_in_flight_sidecar_reverts() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir);
        let sealed = partition.ingest(&batch(0..=9, 1)).unwrap();
        let resource = &sealed[0];
        resource.claim().unwrap();
        resource
            .transition(ResourceStatus::CompactionCandidate, ResourceStatus::Compacting)
            .unwrap();
        resource.serialize().unwrap();
        drop(partition);

        let partition = open(&dir);
        let reloaded = &partition.registry().list(StreamKind::Sequence)[0];
        assert_eq!(reloaded.status(), ResourceStatus::Closed);
        assert_eq!(
            FileResource::deserialize(reloaded.path()).unwrap().status(),
            ResourceStatus::Closed
        );
    }
}
