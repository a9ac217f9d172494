//! Journaled merge execution
//!
//! A merge runs in three phases:
//!
//! 1. **prepare**: write the journal, move sources to COMPACTING
//! 2. **merge**: stream every series through a [`SeriesMerger`] into targets,
//!    seal the targets and append the published record (commit point)
//! 3. **install**: swap the registry, widen the statistics, retire sources
//!
//! Any error before the commit point rolls back: targets are deleted and the
//! sources return to CLOSED. After it, a crash is finished by recovery.

use super::log::{remove_journal, CompactionLog, LoggedFile};
use super::merge::{MergePriority, SeriesMerger};
use super::{CompactionConfig, CompactionKind, CompactionPlan};
use crate::catalog::{OpenSchema, SchemaLookup};
use crate::codec::{ChunkCodec, Lz4Codec};
use crate::interval::SpaceStatistics;
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::registry::ResourceRegistry;
use crate::resource::{FileName, FileResource, ResourceStatus, StreamKind};
use crate::tsfile::{TsFileReader, TsFileWriter};
use crate::{FoldError, Result, SeriesKey};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of a finished compaction
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub kind: CompactionKind,
    pub sources: Vec<FileName>,
    pub targets: Vec<Arc<FileResource>>,
    pub points_written: u64,
    pub duplicates_dropped: u64,
    pub bytes_written: u64,
    /// Sources deleted right away
    pub retired: usize,
    /// Sources left for [`purge`](crate::partition::StoragePartition::purge_retired)
    pub parked: usize,
    pub duration: Duration,
}

/// Places where a test can simulate a crash: the run stops and leaves the
/// disk exactly as it is, without rolling back.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    AfterJournal,
    AfterSourcesMarked,
    AfterFirstSeries,
    BeforePublish,
    AfterPublish,
    AfterSwap,
}

#[cfg(test)]
const CRASH_MARKER: &str = "simulated crash";

/// Runs compaction plans
pub struct MergeExecutor {
    config: CompactionConfig,
    codec: Arc<dyn ChunkCodec>,
    schema: Arc<dyn SchemaLookup>,
    metrics: Arc<dyn MetricsSink>,
    #[cfg(test)]
    fault: Option<FaultPoint>,
}

struct OpenTarget {
    resource: Arc<FileResource>,
    writer: TsFileWriter,
}

#[derive(Default)]
struct RunState {
    journal: Option<CompactionLog>,
    current: Option<OpenTarget>,
    sealed: Vec<Arc<FileResource>>,
    points_written: u64,
    duplicates_dropped: u64,
    bytes_written: u64,
}

impl MergeExecutor {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            codec: Arc::new(Lz4Codec),
            schema: Arc::new(OpenSchema),
            metrics: Arc::new(NoopMetrics),
            #[cfg(test)]
            fault: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ChunkCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn SchemaLookup>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fault(mut self, fault: FaultPoint) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Run a claimed plan (all sources COMPACTION_CANDIDATE)
    pub fn execute(
        &self,
        plan: &CompactionPlan,
        registry: &ResourceRegistry,
        stats: &RwLock<SpaceStatistics>,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome> {
        let started = Instant::now();
        self.metrics.counter(names::COMPACTION_STARTED, 1);
        info!("Starting {} in {}", plan, registry.id());

        let mut state = RunState::default();
        let result = self.merge(plan, cancel, &mut state);

        let targets = match result {
            Ok(targets) => targets,
            Err(e) => {
                #[cfg(test)]
                if matches!(&e, FoldError::Internal(m) if m.starts_with(CRASH_MARKER)) {
                    return Err(e);
                }
                warn!("{} in {} failed: {}", plan.kind, registry.id(), e);
                self.abort(plan, state);
                self.metrics.counter(names::COMPACTION_FAILED, 1);
                return Err(e);
            }
        };

        let journal = match state.journal.take() {
            Some(journal) => journal,
            None => {
                return Err(FoldError::Internal(
                    "published compaction without a journal".into(),
                ))
            }
        };
        let (retired, parked) = self.install(plan, &targets, registry, stats, journal)?;

        let duration = started.elapsed();
        self.metrics.counter(names::COMPACTION_SUCCEEDED, 1);
        self.metrics
            .counter(names::COMPACTION_POINTS_WRITTEN, state.points_written);
        self.metrics
            .counter(names::COMPACTION_DUPLICATES_DROPPED, state.duplicates_dropped);
        self.metrics
            .counter(names::COMPACTION_BYTES_WRITTEN, state.bytes_written);
        self.metrics
            .gauge(names::COMPACTION_DURATION_MS, duration.as_millis() as f64);
        info!(
            "Finished {} in {}: {} sources -> {} targets, {} points, {} duplicates dropped in {:?}",
            plan.kind,
            registry.id(),
            plan.source_count(),
            targets.len(),
            state.points_written,
            state.duplicates_dropped,
            duration
        );

        Ok(CompactionOutcome {
            kind: plan.kind,
            sources: plan.sources().map(|r| r.name()).collect(),
            targets,
            points_written: state.points_written,
            duplicates_dropped: state.duplicates_dropped,
            bytes_written: state.bytes_written,
            retired,
            parked,
            duration,
        })
    }

    #[cfg(test)]
    fn crash_point(&self, at: FaultPoint) -> Result<()> {
        if self.fault == Some(at) {
            return Err(FoldError::Internal(format!("{} at {:?}", CRASH_MARKER, at)));
        }
        Ok(())
    }

    /// Names the targets may take, one per source they replace
    fn target_names(plan: &CompactionPlan) -> Vec<FileName> {
        let bases = plan.target_bases();
        if plan.kind.is_cross() {
            let next = plan
                .sources()
                .map(|r| r.name().cross_compaction_count)
                .max()
                .unwrap_or(0)
                + 1;
            bases.iter().map(|r| r.name().with_cross(next)).collect()
        } else {
            let next = plan
                .sources()
                .map(|r| r.name().inner_compaction_count)
                .max()
                .unwrap_or(0)
                + 1;
            bases.iter().map(|r| r.name().with_inner(next)).collect()
        }
    }

    fn merge(
        &self,
        plan: &CompactionPlan,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<Vec<Arc<FileResource>>> {
        let target_dir = plan
            .target_bases()
            .first()
            .and_then(|r| r.path().parent())
            .map(Path::to_path_buf)
            .ok_or_else(|| FoldError::Compaction(format!("{} has no target position", plan)))?;
        let target_stream = plan.kind.target_stream();
        let target_names = Self::target_names(plan);

        let journal = CompactionLog::create(
            CompactionLog::path_for(&target_dir, target_names[0]),
            plan.kind,
            plan.sources()
                .map(|r| LoggedFile {
                    stream: r.stream(),
                    name: r.name(),
                })
                .collect(),
            target_names
                .iter()
                .map(|&name| LoggedFile {
                    stream: target_stream,
                    name,
                })
                .collect(),
            self.config.io_retry_attempts,
        )?;
        debug!("Journal {:?} written", journal.path());
        state.journal = Some(journal);
        #[cfg(test)]
        self.crash_point(FaultPoint::AfterJournal)?;

        for source in plan.sources() {
            source.transition(ResourceStatus::CompactionCandidate, ResourceStatus::Compacting)?;
            source.serialize()?;
        }
        #[cfg(test)]
        self.crash_point(FaultPoint::AfterSourcesMarked)?;

        let sources: Vec<(TsFileReader, MergePriority)> = plan
            .sources()
            .map(|r| -> Result<(TsFileReader, MergePriority)> {
                let reader = TsFileReader::open(r.path(), Arc::clone(&self.codec))?
                    .with_retry_attempts(self.config.io_retry_attempts);
                Ok((reader, MergePriority::of(r)))
            })
            .collect::<Result<_>>()?;

        let all_series: BTreeSet<SeriesKey> = sources
            .iter()
            .flat_map(|(reader, _)| reader.series())
            .collect();

        let mut next_target = 0usize;
        let mut current_device: Option<&str> = None;
        for series in &all_series {
            if cancel.is_cancelled() {
                return Err(FoldError::Cancelled(format!("series {}", series)));
            }

            if current_device != Some(series.device.as_str()) {
                current_device = Some(series.device.as_str());
                let over_size = state
                    .current
                    .as_ref()
                    .is_some_and(|t| t.writer.bytes_written() >= self.config.target_file_bytes);
                if over_size && next_target < target_names.len() {
                    self.seal_current(state)?;
                }
            }
            if state.current.is_none() {
                let name = target_names[next_target];
                next_target += 1;
                state.current = Some(self.open_target(&target_dir, name, target_stream)?);
            }

            let cursors = sources
                .iter()
                .filter(|(reader, _)| reader.contains_series(series))
                .map(|(reader, priority)| (reader.cursor(series), *priority))
                .collect::<Vec<_>>();
            self.check_schema(series, &cursors)?;

            let mut merger = SeriesMerger::new(cursors)?;
            let target = state
                .current
                .as_mut()
                .ok_or_else(|| FoldError::Internal("no open target".into()))?;
            while let Some(point) = merger.next_point()? {
                target.writer.write_point(series, point)?;
                state.points_written += 1;
            }
            state.duplicates_dropped += merger.duplicates_dropped();
            #[cfg(test)]
            self.crash_point(FaultPoint::AfterFirstSeries)?;
        }

        self.seal_current(state)?;
        #[cfg(test)]
        self.crash_point(FaultPoint::BeforePublish)?;

        let journal = state
            .journal
            .as_mut()
            .ok_or_else(|| FoldError::Internal("journal missing".into()))?;
        journal.publish()?;
        debug!("Compaction published in {:?}", journal.path());
        #[cfg(test)]
        self.crash_point(FaultPoint::AfterPublish)?;

        Ok(std::mem::take(&mut state.sealed))
    }

    fn open_target(
        &self,
        dir: &Path,
        name: FileName,
        stream: StreamKind,
    ) -> Result<OpenTarget> {
        let path = dir.join(name.file_name());
        let resource = Arc::new(FileResource::new(path.clone(), stream)?);
        let writer = TsFileWriter::create(&path, Arc::clone(&self.codec), self.config.chunk_config())?
            .with_retry_attempts(self.config.io_retry_attempts);
        debug!("Writing compaction target {:?}", path);
        Ok(OpenTarget { resource, writer })
    }

    /// Finish the open target and persist its sidecar as CLOSED
    fn seal_current(&self, state: &mut RunState) -> Result<()> {
        let Some(target) = state.current.take() else {
            return Ok(());
        };
        let summary = target.writer.finish()?;
        summary.apply_to(&target.resource)?;
        target.resource.set_status(ResourceStatus::Closed)?;
        target.resource.serialize()?;
        state.bytes_written += summary.file_size;
        state.sealed.push(target.resource);
        Ok(())
    }

    fn check_schema(
        &self,
        series: &SeriesKey,
        cursors: &[(crate::tsfile::SeriesCursor<'_>, MergePriority)],
    ) -> Result<()> {
        let expected = self
            .schema
            .data_type(series)
            .or_else(|| cursors.first().and_then(|(c, _)| c.data_type()));
        let Some(expected) = expected else {
            return Ok(());
        };
        for (cursor, _) in cursors {
            if let Some(actual) = cursor.data_type() {
                if actual != expected {
                    return Err(FoldError::SchemaMismatch {
                        series: series.to_string(),
                        file: cursor.path().display().to_string(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn install(
        &self,
        plan: &CompactionPlan,
        targets: &[Arc<FileResource>],
        registry: &ResourceRegistry,
        stats: &RwLock<SpaceStatistics>,
        journal: CompactionLog,
    ) -> Result<(usize, usize)> {
        let sources: Vec<Arc<FileResource>> = plan.sources().cloned().collect();
        registry.replace(&sources, targets)?;

        if plan.kind.target_stream() == StreamKind::Sequence {
            let mut stats = stats.write();
            for target in targets {
                for (device, _) in target.devices() {
                    for (measurement, interval) in target.series_of(&device) {
                        stats.update_measurement(&device, &measurement, interval);
                    }
                }
            }
        }
        #[cfg(test)]
        self.crash_point(FaultPoint::AfterSwap)?;

        let mut retired = 0;
        let mut parked = 0;
        for source in &sources {
            if source.wait_unpinned(self.config.retire_wait()) && source.try_retire()? {
                if let Err(e) = source.remove_files() {
                    warn!("Failed to delete retired file {:?}: {}", source.path(), e);
                }
                retired += 1;
            } else {
                debug!(
                    "{} still has {} reader(s), parking it",
                    source.name(),
                    source.pin_count()
                );
                registry.park_for_deletion(Arc::clone(source), journal.path().to_path_buf());
                parked += 1;
            }
        }

        if parked == 0 {
            journal.remove()?;
        }
        Ok((retired, parked))
    }

    /// Roll back an unpublished merge
    fn abort(&self, plan: &CompactionPlan, mut state: RunState) {
        if let Some(target) = state.current.take() {
            let path = target.writer.path().to_path_buf();
            if let Err(e) = target.writer.abort() {
                warn!("Failed to delete partial target {:?}: {}", path, e);
            }
            if let Err(e) = target.resource.remove_files() {
                warn!("Failed to delete partial target {:?}: {}", path, e);
            }
        }
        for target in &state.sealed {
            if let Err(e) = target.remove_files() {
                warn!("Failed to delete target {:?}: {}", target.path(), e);
            }
        }

        for source in plan.sources() {
            if source.status().is_in_flight() {
                if let Err(e) = source.set_status(ResourceStatus::Closed) {
                    warn!("Failed to release {}: {}", source.name(), e);
                    continue;
                }
                if let Err(e) = source.serialize() {
                    warn!("Failed to rewrite sidecar of {}: {}", source.name(), e);
                }
            }
        }

        if let Some(journal) = state.journal.take() {
            let path: PathBuf = journal.path().to_path_buf();
            if let Err(e) = journal.remove() {
                warn!("Failed to delete journal {:?}: {}", path, e);
            }
        }
    }
}

/// Remove a journal left behind by parked sources once they are purged
pub(crate) fn release_journal(path: &Path) {
    if let Err(e) = remove_journal(path) {
        warn!("Failed to delete journal {:?}: {}", path, e);
    }
}
