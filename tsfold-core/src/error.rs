//! Error types for tsfold

use crate::resource::ResourceStatus;
use std::io;
use thiserror::Error;

/// Result type alias for tsfold operations
pub type Result<T> = std::result::Result<T, FoldError>;

/// tsfold error types
#[derive(Error, Debug)]
pub enum FoldError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Chunk codec failed to encode or decode a payload
    #[error("Codec error: {0}")]
    Codec(String),

    /// Interval with start after end
    #[error("Malformed interval [{start}, {end}]")]
    MalformedInterval { start: i64, end: i64 },

    /// Status change outside the lifecycle table
    #[error("Illegal status transition for {file}: {from:?} -> {to:?}")]
    IllegalTransition {
        file: String,
        from: ResourceStatus,
        to: ResourceStatus,
    },

    /// Resource already taken by another compaction
    #[error("Resource {file} is already claimed ({status:?})")]
    AlreadyClaimed { file: String, status: ResourceStatus },

    /// Resource was retired and can no longer be read
    #[error("Resource {0} has been deleted")]
    ResourceDeleted(String),

    /// Resource still has readers and cannot be deleted
    #[error("Resource {file} is pinned by {pins} reader(s)")]
    ResourcePinned { file: String, pins: usize },

    /// Bounds of a sealed resource were modified
    #[error("Resource {0} is sealed, bounds are frozen")]
    ResourceSealed(String),

    /// Catalog type disagrees with the stored chunk type
    #[error("Schema mismatch for {series}: catalog says {expected}, file {file} holds {actual}")]
    SchemaMismatch {
        series: String,
        file: String,
        expected: String,
        actual: String,
    },

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Compaction stopped by a shutdown request
    #[error("Compaction cancelled before {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FoldError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FoldError::Io(e) => crate::io::is_transient(e),
            _ => false,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FoldError::Corruption(_) | FoldError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is a broken invariant rather than an environmental failure
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            FoldError::MalformedInterval { .. }
                | FoldError::IllegalTransition { .. }
                | FoldError::AlreadyClaimed { .. }
                | FoldError::ResourceSealed(_)
        )
    }
}
