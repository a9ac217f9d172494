//! Storage partition - owns the files of one `(storage group, time partition)`

mod appender;
mod read;
mod recovery;

pub use appender::FileAppender;
pub use read::ReadView;
pub use recovery::RecoveryReport;

use crate::catalog::{OpenSchema, SchemaLookup};
use crate::codec::{ChunkCodec, Lz4Codec};
use crate::compaction::{
    self, CompactionConfig, CompactionOutcome, CompactionPlan, CompactionSelector, MergeExecutor,
};
use crate::interval::{SpaceStatistics, TouchPolicy};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::registry::{PartitionId, RegistrySnapshot, ResourceRegistry};
use crate::resource::{FileName, FileResource, ResourceStatus, StreamKind};
use crate::tsfile::ChunkConfig;
use crate::{Result, SeriesKey, TimeValuePair, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Partition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Coalescing rule of the overlap statistics
    pub touch_policy: TouchPolicy,
    /// Chunk paging of freshly ingested files
    pub chunk: ChunkConfig,
    /// Compaction settings
    pub compaction: CompactionConfig,
}

/// Collaborators a partition talks to
#[derive(Clone)]
pub struct Collaborators {
    pub codec: Arc<dyn ChunkCodec>,
    pub schema: Arc<dyn SchemaLookup>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            codec: Arc::new(Lz4Codec),
            schema: Arc::new(OpenSchema),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// One file as shown by [`StoragePartition::status`]
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub name: String,
    pub status: ResourceStatus,
    pub file_size: u64,
    pub devices: usize,
    pub pins: usize,
}

impl FileSummary {
    fn of(resource: &FileResource) -> Self {
        Self {
            name: resource.name().file_name(),
            status: resource.status(),
            file_size: resource.file_size(),
            devices: resource.devices().len(),
            pins: resource.pin_count(),
        }
    }
}

/// Point-in-time view of a partition
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub storage_group: String,
    pub time_partition: i64,
    pub sequence: Vec<FileSummary>,
    pub unsequence: Vec<FileSummary>,
    pub pending_deletions: usize,
    pub next_version: u64,
}

/// Files, statistics and compaction entry points of one partition
pub struct StoragePartition {
    id: PartitionId,
    sequence_dir: PathBuf,
    unsequence_dir: PathBuf,
    config: PartitionConfig,
    registry: ResourceRegistry,
    stats: RwLock<SpaceStatistics>,
    // routing and recording of one batch happen under this lock
    ingest: Mutex<()>,
    version: AtomicU64,
    codec: Arc<dyn ChunkCodec>,
    metrics: Arc<dyn MetricsSink>,
    executor: MergeExecutor,
    recovery: RecoveryReport,
}

impl StoragePartition {
    /// Open with default collaborators
    pub fn open(root: impl AsRef<Path>, id: PartitionId, config: PartitionConfig) -> Result<Self> {
        Self::open_with(root, id, config, Collaborators::default())
    }

    /// Open the partition under `root`, recovering interrupted compactions
    pub fn open_with(
        root: impl AsRef<Path>,
        id: PartitionId,
        config: PartitionConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.compaction.validate()?;
        let root = root.as_ref();
        let sequence_dir = Self::stream_dir(root, &id, StreamKind::Sequence);
        let unsequence_dir = Self::stream_dir(root, &id, StreamKind::Unsequence);
        std::fs::create_dir_all(&sequence_dir)?;
        std::fs::create_dir_all(&unsequence_dir)?;

        let executor = MergeExecutor::new(config.compaction.clone())
            .with_codec(Arc::clone(&collaborators.codec))
            .with_schema(collaborators.schema)
            .with_metrics(Arc::clone(&collaborators.metrics));

        let mut partition = Self {
            registry: ResourceRegistry::new(id.clone()),
            stats: RwLock::new(SpaceStatistics::new(config.touch_policy)),
            ingest: Mutex::new(()),
            version: AtomicU64::new(0),
            codec: collaborators.codec,
            metrics: collaborators.metrics,
            id,
            sequence_dir,
            unsequence_dir,
            config,
            executor,
            recovery: RecoveryReport::default(),
        };

        let mut report = partition.recover()?;
        let max_version = partition.load(&mut report)?;
        partition.version.store(max_version + 1, Ordering::SeqCst);
        partition.rebuild_statistics();
        partition.report_gauges();

        info!(
            "Opened partition {}: {} sequence, {} unsequence files ({})",
            partition.id,
            partition.registry.len(StreamKind::Sequence),
            partition.registry.len(StreamKind::Unsequence),
            report
        );
        partition.recovery = report;
        Ok(partition)
    }

    /// `<root>/<sequence|unsequence>/<storage group>/<time partition>`
    pub fn stream_dir(root: &Path, id: &PartitionId, stream: StreamKind) -> PathBuf {
        root.join(stream.dir_name())
            .join(&id.storage_group)
            .join(id.time_partition.to_string())
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// What recovery did when the partition was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn dir(&self, stream: StreamKind) -> &Path {
        match stream {
            StreamKind::Sequence => &self.sequence_dir,
            StreamKind::Unsequence => &self.unsequence_dir,
        }
    }

    /// Copy of the sequence-space statistics
    pub fn statistics(&self) -> SpaceStatistics {
        self.stats.read().clone()
    }

    pub fn codec(&self) -> Arc<dyn ChunkCodec> {
        Arc::clone(&self.codec)
    }

    fn next_file_name(&self) -> FileName {
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        FileName::new(chrono::Utc::now().timestamp_millis(), version)
    }

    fn rebuild_statistics(&self) {
        let mut stats = self.stats.write();
        stats.clear();
        for resource in self.registry.list(StreamKind::Sequence) {
            add_series_ranges(&mut stats, &resource);
        }
    }

    /// Make a freshly sealed sequence file visible to routing and selection
    fn record_sequence_file(&self, resource: &FileResource) {
        add_series_ranges(&mut self.stats.write(), resource);
    }

    /// Start a new file in `stream`; it is registered as UNCLOSED
    pub fn create_appender(&self, stream: StreamKind) -> Result<FileAppender<'_>> {
        let path = self.dir(stream).join(self.next_file_name().file_name());
        let resource = Arc::new(FileResource::new(path, stream)?);
        self.registry.add(Arc::clone(&resource))?;
        debug!("Created {} file {}", stream.dir_name(), resource.name());
        Ok(FileAppender::new(self, resource))
    }

    /// Space a point belongs to: sequence if it lies after everything the
    /// sealed sequence files hold for the device, unsequence otherwise
    pub fn route(&self, device: &str, timestamp: Timestamp) -> StreamKind {
        let stats = self.stats.read();
        match stats.device_intervals(device).and_then(|set| set.span()) {
            Some(span) if timestamp <= span.end() => StreamKind::Unsequence,
            _ => StreamKind::Sequence,
        }
    }

    /// Route and write a batch, sealing at most one file per space.
    ///
    /// All or nothing: if any file of the batch fails to seal, every file of
    /// the batch is unregistered and removed.
    pub fn ingest(&self, points: &[(SeriesKey, TimeValuePair)]) -> Result<Vec<Arc<FileResource>>> {
        let _batch = self.ingest.lock();
        let mut appenders: [Option<FileAppender<'_>>; 2] = [None, None];
        if let Err(e) = self.fill(points, &mut appenders) {
            for appender in appenders.into_iter().flatten() {
                appender.abort();
            }
            return Err(e);
        }

        let sealed = FileAppender::close_all(appenders.into_iter().flatten().collect());
        self.report_gauges();
        sealed
    }

    fn fill<'a>(
        &'a self,
        points: &[(SeriesKey, TimeValuePair)],
        appenders: &mut [Option<FileAppender<'a>>; 2],
    ) -> Result<()> {
        for (series, point) in points {
            let stream = self.route(&series.device, point.timestamp);
            let slot = &mut appenders[stream as usize];
            if slot.is_none() {
                *slot = Some(self.create_appender(stream)?);
            }
            if let Some(appender) = slot {
                appender.write(series, point.clone())?;
            }
        }
        Ok(())
    }

    /// Pin every live file. The view keeps its files readable until dropped,
    /// even if a compaction retires them meanwhile.
    pub fn pin_for_read(&self) -> Result<ReadView> {
        loop {
            let snapshot = self.registry.snapshot();
            match ReadView::pin(&snapshot, Arc::clone(&self.codec)) {
                Ok(Some(view)) => return Ok(view),
                // a file was retired after the snapshot; its targets are
                // registered by now
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Next plan, without claiming it
    pub fn select(&self) -> Option<CompactionPlan> {
        let snapshot = self.registry.snapshot();
        let stats = self.stats.read();
        CompactionSelector::new(&self.config.compaction).select(&snapshot, &stats)
    }

    /// Run one already claimed plan
    pub fn execute(
        &self,
        plan: &CompactionPlan,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome> {
        let outcome = self
            .executor
            .execute(plan, &self.registry, &self.stats, cancel);
        self.report_gauges();
        outcome
    }

    /// Select, claim and run one compaction. `Ok(None)` when there is
    /// nothing to do or another task claimed the files first.
    pub fn compact_once(&self, cancel: &CancellationToken) -> Result<Option<CompactionOutcome>> {
        let Some(plan) = self.select() else {
            return Ok(None);
        };
        if let Err(e) = compaction::claim(&plan) {
            debug!("Plan for {} lost a claim race: {}", self.id, e);
            return Ok(None);
        }
        self.execute(&plan, cancel).map(Some)
    }

    /// Delete parked files whose readers are gone; returns how many
    pub fn purge_retired(&self) -> Result<usize> {
        let mut purged = 0;
        for pending in self.registry.pending_deletions() {
            if !pending.resource.try_retire()? {
                continue;
            }
            if let Err(e) = pending.resource.remove_files() {
                warn!(
                    "Failed to delete retired file {:?}: {}",
                    pending.resource.path(),
                    e
                );
            }
            if let Some(journal) = self.registry.forget_pending(&pending.resource) {
                compaction::release_journal(&journal);
            }
            purged += 1;
        }
        if purged > 0 {
            debug!("Purged {} retired file(s) in {}", purged, self.id);
            self.report_gauges();
        }
        Ok(purged)
    }

    pub fn status(&self) -> PartitionStatus {
        let snapshot = self.registry.snapshot();
        PartitionStatus {
            storage_group: self.id.storage_group.clone(),
            time_partition: self.id.time_partition,
            sequence: snapshot.sequence.iter().map(|r| FileSummary::of(r)).collect(),
            unsequence: snapshot.unsequence.iter().map(|r| FileSummary::of(r)).collect(),
            pending_deletions: self.registry.pending_deletions().len(),
            next_version: self.version.load(Ordering::SeqCst),
        }
    }

    fn report_gauges(&self) {
        self.metrics.gauge(
            names::SEQUENCE_FILES,
            self.registry.len(StreamKind::Sequence) as f64,
        );
        self.metrics.gauge(
            names::UNSEQUENCE_FILES,
            self.registry.len(StreamKind::Unsequence) as f64,
        );
        self.metrics.gauge(
            names::PENDING_DELETIONS,
            self.registry.pending_deletions().len() as f64,
        );
    }
}

fn add_series_ranges(stats: &mut SpaceStatistics, resource: &FileResource) {
    for (device, _) in resource.devices() {
        for (measurement, interval) in resource.series_of(&device) {
            stats.update_measurement(&device, &measurement, interval);
        }
    }
}

impl std::fmt::Debug for StoragePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePartition")
            .field("id", &self.id)
            .field("sequence_dir", &self.sequence_dir)
            .field("unsequence_dir", &self.unsequence_dir)
            .finish()
    }
}
