//! tsfold core - compaction for time-partitioned time-series storage
//!
//! Data lands in many small, time-ordered files, split into a *sequence*
//! space (in-order arrivals) and an *unsequence* space (late arrivals).
//! This crate merges those files into fewer, larger, non-overlapping ones
//! while readers keep using the pre-merge files until the merge is durable.
//!
//! # Architecture
//!
//! - **Interval Index**: per-device and per-series sets of disjoint time ranges
//! - **File Resource**: metadata, bounds and lifecycle status of one data file
//! - **Resource Registry**: ordered sequence/unsequence lists of a partition
//! - **Compaction Selector**: picks inner and cross compaction plans
//! - **Merge Executor**: k-way merges sources into targets, journaled
//! - **Consistency Validator**: proves a merge lost and duplicated nothing

pub mod catalog;
pub mod codec;
pub mod compaction;
pub mod interval;
pub mod io;
pub mod metrics;
pub mod partition;
pub mod registry;
pub mod resource;
pub mod tsfile;

mod error;
mod types;

pub use error::{FoldError, Result};
pub use types::*;

/// tsfold version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Attempts for transient I/O failures (first try included)
    pub const IO_RETRY_ATTEMPTS: u32 = 3;

    /// Points per chunk before a new chunk is started
    pub const TARGET_CHUNK_POINTS: usize = 100_000;

    /// Raw bytes per chunk before a new chunk is started (1MB)
    pub const TARGET_CHUNK_BYTES: usize = 1024 * 1024;

    /// Target file size before a merge output is split (512MB)
    pub const TARGET_FILE_BYTES: u64 = 512 * 1024 * 1024;

    /// Closed files in one space before an inner compaction is planned
    pub const INNER_CANDIDATE_FILE_THRESHOLD: usize = 10;

    /// Maximum sources of one inner compaction
    pub const MAX_INNER_COMPACTION_FILES: usize = 30;

    /// Maximum sources (both spaces) of one cross compaction
    pub const MAX_CROSS_COMPACTION_FILES: usize = 30;

    /// Maximum total source bytes of one compaction (2GB)
    pub const MAX_COMPACTION_BYTES: u64 = 2 * 1024 * 1024 * 1024;

    /// How long a merge waits for readers before parking a retired file
    pub const RETIRE_WAIT_MS: u64 = 500;

    /// Scheduler tick
    pub const SCHEDULE_INTERVAL_SECS: u64 = 60;
}
