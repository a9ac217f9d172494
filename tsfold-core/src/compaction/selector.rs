//! Compaction selection
//!
//! Selection is a pure function of a registry snapshot and the sequence-space
//! statistics: it only reads statuses and bounds. Taking ownership of the
//! chosen files is a separate step, [`claim`].

use super::{CompactionConfig, CompactionPlan};
use crate::interval::{Interval, SpaceStatistics};
use crate::registry::RegistrySnapshot;
use crate::resource::{FileResource, ResourceStatus, StreamKind};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Chooses inner and cross compaction plans
#[derive(Debug, Clone, Copy)]
pub struct CompactionSelector<'a> {
    config: &'a CompactionConfig,
}

impl<'a> CompactionSelector<'a> {
    pub fn new(config: &'a CompactionConfig) -> Self {
        Self { config }
    }

    /// Cross first, then sequence inner, then unsequence inner
    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        stats: &SpaceStatistics,
    ) -> Option<CompactionPlan> {
        if self.config.enable_cross {
            if let Some(plan) = self.select_cross(snapshot, stats) {
                return Some(plan);
            }
        }
        if self.config.enable_sequence_inner {
            if let Some(plan) = self.select_inner(snapshot, StreamKind::Sequence) {
                return Some(plan);
            }
        }
        if self.config.enable_unsequence_inner {
            return self.select_inner(snapshot, StreamKind::Unsequence);
        }
        None
    }

    /// Oldest run of consecutive CLOSED files of one space, within limits
    pub fn select_inner(
        &self,
        snapshot: &RegistrySnapshot,
        stream: StreamKind,
    ) -> Option<CompactionPlan> {
        let threshold = self.config.inner_candidate_file_threshold;
        let mut run: Vec<Arc<FileResource>> = Vec::new();
        let mut bytes = 0u64;

        for resource in snapshot.list(stream) {
            if resource.status() != ResourceStatus::Closed {
                if run.len() >= threshold {
                    break;
                }
                run.clear();
                bytes = 0;
                continue;
            }

            let size = resource.file_size();
            let full = run.len() >= self.config.max_inner_compaction_files
                || bytes + size > self.config.max_compaction_bytes;
            if !run.is_empty() && full {
                if run.len() >= threshold {
                    break;
                }
                run.clear();
                bytes = 0;
            }
            run.push(Arc::clone(resource));
            bytes += size;
        }

        if run.len() < threshold {
            return None;
        }
        debug!(
            "Selected {} {} files ({} bytes) for inner compaction",
            run.len(),
            stream.dir_name(),
            bytes
        );
        Some(CompactionPlan::inner(stream, run))
    }

    /// Oldest unsequence files together with the sequence files they overlap
    pub fn select_cross(
        &self,
        snapshot: &RegistrySnapshot,
        stats: &SpaceStatistics,
    ) -> Option<CompactionPlan> {
        let unseq = &snapshot.unsequence;
        let seq = &snapshot.sequence;

        // newer unsequence files shadow older ones, so only a prefix of the
        // list may leave the space. Leading files that miss the sequence data
        // still ride along, placed by their successor or predecessor.
        let mut chosen_unseq: Vec<Arc<FileResource>> = Vec::new();
        let mut chosen_seq: Vec<Arc<FileResource>> = Vec::new();
        let mut overlapping = false;

        for next in unseq {
            if next.status() != ResourceStatus::Closed {
                break;
            }
            let mut candidate = chosen_unseq.clone();
            candidate.push(Arc::clone(next));
            let Some(run) = sequence_run(&candidate, seq) else {
                break;
            };
            if !self.within_cross_limits(&candidate, &run) {
                break;
            }
            overlapping |= overlaps_space(next, stats);
            chosen_unseq = candidate;
            chosen_seq = run;
        }

        if !overlapping || chosen_seq.is_empty() {
            return None;
        }

        debug!(
            "Selected {} sequence and {} unsequence files for cross compaction",
            chosen_seq.len(),
            chosen_unseq.len()
        );
        Some(CompactionPlan::cross(chosen_seq, chosen_unseq))
    }

    fn within_cross_limits(
        &self,
        unseq: &[Arc<FileResource>],
        seq: &[Arc<FileResource>],
    ) -> bool {
        let files = unseq.len() + seq.len();
        let bytes: u64 = unseq.iter().chain(seq).map(|r| r.file_size()).sum();
        files <= self.config.max_cross_compaction_files && bytes <= self.config.max_compaction_bytes
    }
}

/// Whether any series of `resource` intersects data already in the space
fn overlaps_space(resource: &FileResource, stats: &SpaceStatistics) -> bool {
    resource.devices().into_iter().any(|(device, _)| {
        resource
            .series_of(&device)
            .iter()
            .any(|(measurement, interval)| stats.has_overlap(&device, measurement, interval))
    })
}

/// Contiguous run of sequence files the unsequence files must merge into.
///
/// Per device: the sequence files whose device range intersects, else the
/// successor, else the predecessor. Empty if no sequence file holds any of
/// the devices, `None` if a file in the run is not CLOSED.
fn sequence_run(
    unseq: &[Arc<FileResource>],
    seq: &[Arc<FileResource>],
) -> Option<Vec<Arc<FileResource>>> {
    let mut chosen: BTreeSet<usize> = BTreeSet::new();

    for resource in unseq {
        for (device, range) in resource.devices() {
            chosen.extend(seq_files_for_device(seq, &device, &range));
        }
    }

    let (Some(&lo), Some(&hi)) = (chosen.first(), chosen.last()) else {
        return Some(Vec::new());
    };
    let run = &seq[lo..=hi];
    if run.iter().any(|r| r.status() != ResourceStatus::Closed) {
        debug!("Cross selection vetoed: sequence file in the run is busy");
        return None;
    }
    Some(run.to_vec())
}

fn seq_files_for_device(seq: &[Arc<FileResource>], device: &str, range: &Interval) -> Vec<usize> {
    let holding: Vec<(usize, Interval)> = seq
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.device_interval(device).map(|iv| (i, iv)))
        .collect();

    let overlapping: Vec<usize> = holding
        .iter()
        .filter(|(_, iv)| iv.overlaps(range))
        .map(|(i, _)| *i)
        .collect();
    if !overlapping.is_empty() {
        return overlapping;
    }

    if let Some((i, _)) = holding.iter().find(|(_, iv)| iv.start() > range.end()) {
        return vec![*i];
    }
    holding
        .iter()
        .rev()
        .find(|(_, iv)| iv.end() < range.start())
        .map(|(i, _)| vec![*i])
        .unwrap_or_default()
}

/// Take ownership of every source: CLOSED -> COMPACTION_CANDIDATE.
///
/// All or nothing: on the first refusal the files claimed so far go back to
/// CLOSED and the error is returned.
pub fn claim(plan: &CompactionPlan) -> Result<()> {
    let mut claimed: Vec<&Arc<FileResource>> = Vec::with_capacity(plan.source_count());
    for resource in plan.sources() {
        if let Err(e) = resource.claim() {
            for done in claimed {
                let _ = done.transition(ResourceStatus::CompactionCandidate, ResourceStatus::Closed);
            }
            return Err(e);
        }
        claimed.push(resource);
    }
    Ok(())
}

/// Give back a claimed plan that will not run
pub fn release(plan: &CompactionPlan) {
    for resource in plan.sources() {
        let _ = resource.transition(ResourceStatus::CompactionCandidate, ResourceStatus::Closed);
    }
}
