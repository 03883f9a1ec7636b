//! Snapshot error types

use thiserror::Error;

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors from loading or querying a cluster snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Loading failed; the previous snapshot is still in place
    #[error("Snapshot load failed: {0}")]
    Load(String),

    /// The reader handed out a timestamp not newer than the current snapshot
    #[error("Non-monotonic snapshot timestamp: current {current}, loaded {loaded}")]
    NonMonotonicTimestamp { current: u64, loaded: u64 },

    /// A duplicate id within one object type
    #[error("Duplicate {kind} id {id:?}")]
    DuplicateId { kind: &'static str, id: String },

    /// Underlying reader failure
    #[error("Cluster reader error: {0}")]
    Reader(String),
}
