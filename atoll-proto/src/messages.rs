//! Stream payloads
//!
//! Every event carries the operation's controller epoch; the receiving side
//! drops events stamped with an epoch older than the operation's current
//! one, which fences stale senders after a revival.

use atoll_core::{
    ControllerEpoch, JobId, JobResources, JobResourcesWithQuota, NodeId, OperationId,
    TransactionId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An error as it travels between the two processes
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct WireError {
    pub message: String,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A job as the controller remembers it across a revival
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevivedJob {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub resource_usage: JobResources,
    pub start_time: DateTime<Utc>,
}

/// Operation lifecycle event, agent -> scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOperationEvent {
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub kind: AgentOperationEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentOperationEventKind {
    /// Controller finished initializing the operation
    Initialized { result: Result<(), WireError> },
    /// Controller finished preparing inputs
    Prepared { result: Result<(), WireError> },
    /// Controller materialized the job graph
    Materialized { result: Result<(), WireError> },
    /// Controller reconstructed a running operation; carries the jobs it
    /// still believes to be running
    Revived {
        result: Result<Vec<RevivedJob>, WireError>,
    },
    /// Controller committed operation outputs
    Committed { result: Result<(), WireError> },
    /// All jobs done, outputs committed
    Completed,
    /// Controller wants the operation suspended but alive
    Suspended { error: WireError },
    /// Controller aborted the operation
    Aborted { error: WireError },
    /// Unrecoverable controller failure
    Failed { error: WireError },
    /// Operation gave up on a tentative tree; its jobs there must be aborted
    BannedInTentativeTree {
        tree_id: String,
        job_ids: Vec<JobId>,
    },
}

/// Job-level request, agent -> scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJobEvent {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub kind: AgentJobEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentJobEventKind {
    /// Ask the node to wind the job down gracefully
    Interrupt,
    /// Kill the job
    Abort { error: WireError },
    /// Mark the job failed
    Fail { error: WireError },
    /// The controller no longer needs the job record
    Release,
}

/// Why a schedule-job request produced no job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleJobFailReason {
    Timeout,
    NoPendingJobs,
    NotEnoughResources,
    OperationNotRunning,
    ResourceOvercommit,
    TaskRefusal,
}

/// How willingly a job yields to preemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Preemptable once the owner exceeds its tolerated share
    #[default]
    Normal,
    /// Additionally preemptable by the aggressive starvation tier
    Aggressive,
    /// Never preempted
    None,
}

/// What the node should run; produced by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStartSpec {
    pub resources: JobResourcesWithQuota,
    pub interruptible: bool,
    pub preemption_mode: PreemptionMode,
}

/// Answer to a [`ScheduleJobRequest`], agent -> scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobResponse {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub result: Result<JobStartSpec, ScheduleJobFailReason>,
}

/// Operation command, scheduler -> agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOperationEvent {
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub kind: SchedulerOperationEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerOperationEventKind {
    /// Take ownership and initialize; the spec blob is opaque to the core
    Start {
        operation_type: String,
        user: String,
        spec: serde_json::Value,
    },
    /// Prepare inputs
    Prepare,
    /// Materialize the job graph
    Materialize,
    /// Reconstruct a running operation from the persisted snapshot
    Revive {
        controller_transactions: Vec<TransactionId>,
    },
    /// Commit outputs
    Commit,
    /// Drop the operation
    Abort { error: WireError },
}

/// Reason a job was aborted by the scheduler side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAbortReason {
    /// Killed to free resources; names the job it made room for when known
    Preempted {
        preempted_for: Option<JobId>,
        reason: String,
    },
    /// The node went offline
    NodeLost,
    /// The node reported a job the scheduler does not know
    Unknown,
    /// The operation reached a terminal state
    OperationFinished,
    /// Revival found the job's node gone
    RevivalNodeLost,
    /// Explicit user/scheduler decision
    Scheduler,
}

/// Job event, scheduler -> agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJobEvent {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub kind: SchedulerJobEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerJobEventKind {
    /// The job started on a node
    Started {
        node_id: NodeId,
        resources: JobResources,
        start_time: DateTime<Utc>,
    },
    /// The node reported successful completion
    Completed,
    /// The node reported a failure
    Failed { error: WireError },
    /// The job was aborted
    Aborted { reason: JobAbortReason },
    /// Periodic running-state refresh with current usage
    Running { resource_usage: JobResources },
}

/// Ask the controller for one job for this node, scheduler -> agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobRequest {
    /// Pre-minted by the scheduler so both sides agree on the id before the
    /// controller answers
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub controller_epoch: ControllerEpoch,
    pub tree_id: String,
    pub node_id: NodeId,
    pub node_address: String,
    /// Free resources the job may claim
    pub resource_limit: JobResourcesWithQuota,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let event = AgentOperationEvent {
            operation_id: OperationId::new(),
            controller_epoch: ControllerEpoch(3),
            kind: AgentOperationEventKind::Failed {
                error: WireError::new("input table vanished"),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentOperationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation_id, event.operation_id);
        assert_eq!(back.controller_epoch, event.controller_epoch);
        match back.kind {
            AgentOperationEventKind::Failed { error } => {
                assert_eq!(error.message, "input table vanished");
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_schedule_job_response_failure_reason() {
        let response = ScheduleJobResponse {
            job_id: JobId::new(),
            operation_id: OperationId::new(),
            controller_epoch: ControllerEpoch(0),
            result: Err(ScheduleJobFailReason::NoPendingJobs),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: ScheduleJobResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.result, Err(ScheduleJobFailReason::NoPendingJobs));
    }
}
