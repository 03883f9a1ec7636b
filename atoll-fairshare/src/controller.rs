//! The seam between the tree and the operation's controller
//!
//! The tree never talks to a controller agent directly; it sees an async
//! handle that can answer one schedule-job request and report the cached
//! demand. The scheduler wires this handle to the agent outboxes; tests
//! script it.

use async_trait::async_trait;
use atoll_core::{ControllerEpoch, JobId, JobResources};
use atoll_proto::{JobStartSpec, ScheduleJobFailReason, ScheduleJobRequest};

/// Cached demand of one operation, cheap to read on every update pass
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OperationDemand {
    /// Combined resources of jobs not yet placed; the element's total
    /// demand is this plus its current usage
    pub resource_demand: JobResources,
    /// Jobs not yet placed
    pub pending_job_count: i64,
}

/// Async handle to the controller owning one operation
#[async_trait]
pub trait OperationControllerApi: Send + Sync {
    /// Current demand; read on every fair-share pass, so it must not block
    fn demand(&self) -> OperationDemand;

    /// Epoch stamped onto every schedule-job request
    fn controller_epoch(&self) -> ControllerEpoch;

    /// Ask for one job to run on the node described in `request`.
    ///
    /// The caller bounds this with the controller schedule-job timeout; a
    /// timeout counts as [`ScheduleJobFailReason::Timeout`].
    async fn schedule_job(
        &self,
        request: ScheduleJobRequest,
    ) -> Result<JobStartSpec, ScheduleJobFailReason>;

    /// The scheduler rejected a job the controller had produced (limits
    /// were exceeded by the time the answer came back); the controller must
    /// return it to its pending set.
    fn on_unscheduled_job_aborted(&self, job_id: JobId);
}
