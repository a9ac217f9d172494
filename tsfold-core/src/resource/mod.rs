//! File resources: metadata records of on-disk data files
//!
//! A [`FileResource`] carries the file's [`FileName`] (its place in the total
//! order), per-device and per-series time bounds and a [`ResourceStatus`]
//! that doubles as the compaction lock. Its sidecar (`<file>.resource`) lets
//! recovery restore all of that without scanning the data file.

mod file_resource;
mod name;
mod sidecar;

pub use file_resource::{FileResource, PinGuard};
pub use name::{FileName, RESOURCE_SUFFIX, TSFILE_SUFFIX};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Still being written; bounds may widen
    Unclosed,
    /// Sealed and eligible for compaction
    Closed,
    /// Chosen by a selector pass, not yet merging
    CompactionCandidate,
    /// Being read by a merge; never mutated
    Compacting,
    /// Retired after a published merge
    Deleted,
}

impl ResourceStatus {
    /// Lifecycle transition table
    pub fn can_transition_to(self, to: ResourceStatus) -> bool {
        use ResourceStatus::*;
        matches!(
            (self, to),
            (Unclosed, Closed)
                | (Closed, CompactionCandidate)
                | (CompactionCandidate, Compacting)
                | (CompactionCandidate, Closed)
                | (Compacting, Closed)
                | (Compacting, Deleted)
        )
    }

    /// Statuses a restart must roll back to `Closed`
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ResourceStatus::CompactionCandidate | ResourceStatus::Compacting
        )
    }
}

/// Which data space a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    /// In-order arrivals
    Sequence,
    /// Late arrivals overlapping sequence data
    Unsequence,
}

impl StreamKind {
    /// Directory name of this space under the data root
    pub fn dir_name(self) -> &'static str {
        match self {
            StreamKind::Sequence => "sequence",
            StreamKind::Unsequence => "unsequence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceStatus::*;

    #[test]
    fn test_transition_table() {
        let all = [Unclosed, Closed, CompactionCandidate, Compacting, Deleted];
        let allowed = [
            (Unclosed, Closed),
            (Closed, CompactionCandidate),
            (CompactionCandidate, Compacting),
            (CompactionCandidate, Closed),
            (Compacting, Closed),
            (Compacting, Deleted),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_deleted_is_terminal() {
        assert!(!Deleted.can_transition_to(Compacting));
        assert!(!Deleted.can_transition_to(Closed));
    }
}
