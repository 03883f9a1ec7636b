//! Node heartbeat wire model
//!
//! Exec nodes report their resources and job-state deltas; the owning node
//! shard replies with start/abort/interrupt commands.

use atoll_core::{DiskQuota, JobId, JobResources, NodeId, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Job state as the node reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedJobState {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// One job's status inside a node heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedJobStatus {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub state: ReportedJobState,
    pub resource_usage: JobResources,
    /// Failure detail for `Failed` / `Aborted` states
    pub error: Option<super::messages::WireError>,
}

/// Node -> scheduler heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeatRequest {
    pub node_id: NodeId,
    pub address: String,
    pub tags: BTreeSet<String>,
    pub io_weight: f64,
    pub resource_limits: JobResources,
    pub resource_usage: JobResources,
    pub disk_limits: DiskQuota,
    pub disk_usage: DiskQuota,
    pub job_states: Vec<ReportedJobStatus>,
}

/// Command to launch one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartCommand {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub resources: JobResources,
}

/// Command to interrupt one job gracefully
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInterruptCommand {
    pub job_id: JobId,
}

/// Scheduler -> node heartbeat reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeHeartbeatResponse {
    pub jobs_to_start: Vec<JobStartCommand>,
    pub jobs_to_abort: Vec<JobId>,
    pub jobs_to_interrupt: Vec<JobInterruptCommand>,
}
