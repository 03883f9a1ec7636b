//! Scheduler error types
//!
//! The variants mirror the domain error kinds: transient master failures
//! are retried at the call site, stale incarnations are rejected and the
//! sender rebuilds, operation and job failures feed the lifecycle state
//! machine, and `Canceled` is the benign unwind of a canceled scope.

use atoll_core::{AgentId, IncarnationId, NodeId, OperationId};
use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler error kinds
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    /// Master call failed in a way that a retry can fix
    #[error("Transient master error: {0}")]
    TransientMaster(String),

    /// Master call failed permanently
    #[error("Master error: {0}")]
    Master(String),

    /// The scheduler lost its master lock; the process must hand over
    #[error("Scheduler master lock lost")]
    LockLost,

    /// A message carried an incarnation from a previous life of its sender
    #[error("Stale incarnation: expected {expected}, got {got}")]
    StaleIncarnation {
        expected: IncarnationId,
        got: IncarnationId,
    },

    /// Unrecoverable controller failure; moves the operation to `Failing`
    #[error("Operation failure: {0}")]
    OperationFailure(String),

    /// A job failed; whether the operation survives is the controller's
    /// call
    #[error("Job failure: {0}")]
    JobFailure(String),

    /// The node disappeared; its jobs surface as aborted
    #[error("Node {0} lost")]
    NodeLost(NodeId),

    /// Admission was rejected; existing operations are untouched
    #[error("Resource limit violation: {0}")]
    ResourceLimitViolation(String),

    /// A cancelable scope unwound; benign
    #[error("Canceled")]
    Canceled,

    #[error("Invalid operation state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation {0} is not known")]
    UnknownOperation(OperationId),

    #[error("Agent {0} is not known")]
    UnknownAgent(AgentId),

    #[error("Agent {agent} is in state {state:?}")]
    AgentNotRegistered { agent: AgentId, state: String },

    #[error("No controller agent matches tag {0:?}")]
    NoAgentAvailable(String),

    #[error("User {user} lacks {permission} permission on {path}")]
    PermissionDenied {
        user: String,
        path: String,
        permission: String,
    },

    /// Strategy-level failure (unknown pool, count limits, tree routing)
    #[error(transparent)]
    Strategy(#[from] atoll_fairshare::StrategyError),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl SchedulerError {
    /// True for errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::TransientMaster(_))
    }
}

impl From<atoll_snapshot::SnapshotError> for SchedulerError {
    fn from(error: atoll_snapshot::SnapshotError) -> Self {
        SchedulerError::Snapshot(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SchedulerError::TransientMaster("busy".to_string()).is_transient());
        assert!(!SchedulerError::Master("gone".to_string()).is_transient());
        assert!(!SchedulerError::Canceled.is_transient());
    }
}
