//! Background compaction
//!
//! Three kinds of merges keep a partition small and non-overlapping:
//!
//! - **inner sequence**: consecutive sequence files into one
//! - **inner unsequence**: consecutive unsequence files into one
//! - **cross**: unsequence files folded into the sequence files they overlap
//!
//! The [`CompactionSelector`] decides what to merge, the [`MergeExecutor`]
//! performs a plan under a journal, and the [`ConsistencyValidator`] checks
//! that targets hold exactly the deduplicated union of the sources.

mod executor;
mod log;
mod merge;
mod scheduler;
mod selector;
mod validator;

pub use executor::{CompactionOutcome, MergeExecutor};
pub use log::{CompactionLog, LogContents, LoggedFile, COMPACTION_LOG_SUFFIX};
pub use merge::{MergePriority, SeriesMerger};
pub use scheduler::{CompactionScheduler, SchedulerHandle};
pub use selector::{claim, release, CompactionSelector};
pub use validator::{ConsistencyValidator, ExpectedData, SeriesDefect, ValidationReport};

pub(crate) use executor::release_journal;
#[cfg(test)]
pub(crate) use executor::FaultPoint;

use crate::resource::{FileName, FileResource, StreamKind};
use crate::tsfile::ChunkConfig;
use crate::{FoldError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Compaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompactionKind {
    InnerSequence,
    InnerUnsequence,
    Cross,
}

impl CompactionKind {
    /// Space the targets are written to
    pub fn target_stream(self) -> StreamKind {
        match self {
            CompactionKind::InnerUnsequence => StreamKind::Unsequence,
            CompactionKind::InnerSequence | CompactionKind::Cross => StreamKind::Sequence,
        }
    }

    pub fn is_cross(self) -> bool {
        self == CompactionKind::Cross
    }
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompactionKind::InnerSequence => "inner-sequence",
            CompactionKind::InnerUnsequence => "inner-unsequence",
            CompactionKind::Cross => "cross",
        };
        f.write_str(name)
    }
}

/// Files chosen for one merge
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub kind: CompactionKind,
    /// Sequence sources, in `FileName` order
    pub sequence: Vec<Arc<FileResource>>,
    /// Unsequence sources, in `FileName` order
    pub unsequence: Vec<Arc<FileResource>>,
}

impl CompactionPlan {
    pub fn inner(stream: StreamKind, files: Vec<Arc<FileResource>>) -> Self {
        match stream {
            StreamKind::Sequence => Self {
                kind: CompactionKind::InnerSequence,
                sequence: files,
                unsequence: Vec::new(),
            },
            StreamKind::Unsequence => Self {
                kind: CompactionKind::InnerUnsequence,
                sequence: Vec::new(),
                unsequence: files,
            },
        }
    }

    pub fn cross(sequence: Vec<Arc<FileResource>>, unsequence: Vec<Arc<FileResource>>) -> Self {
        Self {
            kind: CompactionKind::Cross,
            sequence,
            unsequence,
        }
    }

    /// Sequence sources first, then unsequence sources
    pub fn sources(&self) -> impl Iterator<Item = &Arc<FileResource>> {
        self.sequence.iter().chain(self.unsequence.iter())
    }

    pub fn source_count(&self) -> usize {
        self.sequence.len() + self.unsequence.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.sources().map(|r| r.file_size()).sum()
    }

    /// Source names, for comparing plans
    pub fn names(&self) -> Vec<(StreamKind, FileName)> {
        self.sources().map(|r| (r.stream(), r.name())).collect()
    }

    /// Sources whose names the targets take over, in order
    pub(crate) fn target_bases(&self) -> &[Arc<FileResource>] {
        match self.kind {
            CompactionKind::InnerUnsequence => &self.unsequence,
            CompactionKind::InnerSequence | CompactionKind::Cross => &self.sequence,
        }
    }
}

impl fmt::Display for CompactionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} compaction of {} sequence + {} unsequence files",
            self.kind,
            self.sequence.len(),
            self.unsequence.len()
        )
    }
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Plan cross compactions
    pub enable_cross: bool,
    /// Plan inner compactions of the sequence space
    pub enable_sequence_inner: bool,
    /// Plan inner compactions of the unsequence space
    pub enable_unsequence_inner: bool,
    /// Closed files needed before an inner compaction is planned
    pub inner_candidate_file_threshold: usize,
    /// Maximum sources of one inner compaction
    pub max_inner_compaction_files: usize,
    /// Maximum sources of one cross compaction
    pub max_cross_compaction_files: usize,
    /// Maximum total source bytes of one compaction
    pub max_compaction_bytes: u64,
    /// Points per target chunk
    pub target_chunk_points: usize,
    /// Raw bytes per target chunk
    pub target_chunk_bytes: usize,
    /// Target size before the output is split at a device boundary
    pub target_file_bytes: u64,
    /// How long to wait for readers before parking retired sources
    pub retire_wait_ms: u64,
    /// Attempts for transient I/O failures
    pub io_retry_attempts: u32,
    /// Scheduler tick
    pub schedule_interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        use crate::config::*;
        Self {
            enable_cross: true,
            enable_sequence_inner: true,
            enable_unsequence_inner: true,
            inner_candidate_file_threshold: INNER_CANDIDATE_FILE_THRESHOLD,
            max_inner_compaction_files: MAX_INNER_COMPACTION_FILES,
            max_cross_compaction_files: MAX_CROSS_COMPACTION_FILES,
            max_compaction_bytes: MAX_COMPACTION_BYTES,
            target_chunk_points: TARGET_CHUNK_POINTS,
            target_chunk_bytes: TARGET_CHUNK_BYTES,
            target_file_bytes: TARGET_FILE_BYTES,
            retire_wait_ms: RETIRE_WAIT_MS,
            io_retry_attempts: IO_RETRY_ATTEMPTS,
            schedule_interval_secs: SCHEDULE_INTERVAL_SECS,
        }
    }
}

impl CompactionConfig {
    /// Reject settings the selector and executor cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.inner_candidate_file_threshold < 2 {
            return Err(FoldError::Config(
                "inner_candidate_file_threshold must be at least 2".into(),
            ));
        }
        if self.max_inner_compaction_files < self.inner_candidate_file_threshold {
            return Err(FoldError::Config(format!(
                "max_inner_compaction_files ({}) is below inner_candidate_file_threshold ({})",
                self.max_inner_compaction_files, self.inner_candidate_file_threshold
            )));
        }
        if self.max_cross_compaction_files < 2 {
            return Err(FoldError::Config(
                "max_cross_compaction_files must be at least 2".into(),
            ));
        }
        if self.target_chunk_points == 0 || self.target_chunk_bytes == 0 {
            return Err(FoldError::Config("chunk targets must be positive".into()));
        }
        if self.target_file_bytes == 0 {
            return Err(FoldError::Config("target_file_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_points: self.target_chunk_points,
            max_bytes: self.target_chunk_bytes,
        }
    }

    pub fn retire_wait(&self) -> Duration {
        Duration::from_millis(self.retire_wait_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs.max(1))
    }
}
