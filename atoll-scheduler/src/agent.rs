//! Controller agent state on the scheduler side
//!
//! One [`ControllerAgent`] per connected agent incarnation: its outboxes
//! for the three scheduler -> agent streams, its inboxes for the three
//! agent -> scheduler streams, the lease, and the set of operations it
//! owns. The [`AgentOperationController`] adapter gives the fair-share
//! tree an async handle that round-trips schedule-job requests through
//! those queues.

use crate::cancel::CancelableContext;
use crate::operation::Operation;
use async_trait::async_trait;
use atoll_core::{AgentId, ControllerEpoch, IncarnationId, JobId, OperationId};
use atoll_fairshare::{OperationControllerApi, OperationDemand};
use atoll_proto::{
    JobAbortReason, JobStartSpec, MemoryStatistics, MessageQueueInbox, MessageQueueOutbox,
    ScheduleJobFailReason, ScheduleJobRequest, SchedulerJobEvent, SchedulerJobEventKind,
    SchedulerOperationEvent, SchedulerOperationEventKind,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::debug;

/// Agent registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Handshake done, first heartbeat still outstanding
    WaitingForInitialHeartbeat,
    Registered,
    Unregistering,
}

/// One connected controller agent incarnation
pub struct ControllerAgent {
    pub id: AgentId,
    pub incarnation: IncarnationId,
    pub tags: BTreeSet<String>,
    pub addresses: Vec<String>,
    /// Canceled when this incarnation dies; cancels every wait on its
    /// behalf
    pub cancel: CancelableContext,

    state: Mutex<AgentState>,
    operations: Mutex<HashSet<OperationId>>,
    memory_statistics: Mutex<Option<MemoryStatistics>>,
    lease_deadline: Mutex<DateTime<Utc>>,

    // Scheduler -> agent streams.
    pub operation_events_outbox: MessageQueueOutbox<SchedulerOperationEvent>,
    pub job_events_outbox: MessageQueueOutbox<SchedulerJobEvent>,
    pub schedule_job_requests_outbox: MessageQueueOutbox<ScheduleJobRequest>,

    // Agent -> scheduler streams.
    pub operation_events_inbox: MessageQueueInbox,
    pub job_events_inbox: MessageQueueInbox,
    pub schedule_job_responses_inbox: MessageQueueInbox,

    /// In-flight schedule-job requests awaiting their response
    pending_schedule_responses:
        Mutex<HashMap<JobId, oneshot::Sender<Result<JobStartSpec, ScheduleJobFailReason>>>>,
}

impl ControllerAgent {
    pub fn new(
        id: AgentId,
        incarnation: IncarnationId,
        tags: BTreeSet<String>,
        addresses: Vec<String>,
        lease_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            incarnation,
            tags,
            addresses,
            cancel: CancelableContext::new(),
            state: Mutex::new(AgentState::WaitingForInitialHeartbeat),
            operations: Mutex::new(HashSet::new()),
            memory_statistics: Mutex::new(None),
            lease_deadline: Mutex::new(lease_deadline),
            operation_events_outbox: MessageQueueOutbox::new("operation_events"),
            job_events_outbox: MessageQueueOutbox::new("job_events"),
            schedule_job_requests_outbox: MessageQueueOutbox::new("schedule_job_requests"),
            operation_events_inbox: MessageQueueInbox::new("operation_events"),
            job_events_inbox: MessageQueueInbox::new("job_events"),
            schedule_job_responses_inbox: MessageQueueInbox::new("schedule_job_responses"),
            pending_schedule_responses: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: AgentState) {
        *self.state.lock() = state;
    }

    pub fn memory_statistics(&self) -> Option<MemoryStatistics> {
        *self.memory_statistics.lock()
    }

    pub fn set_memory_statistics(&self, statistics: MemoryStatistics) {
        *self.memory_statistics.lock() = Some(statistics);
    }

    pub fn lease_deadline(&self) -> DateTime<Utc> {
        *self.lease_deadline.lock()
    }

    pub fn renew_lease(&self, deadline: DateTime<Utc>) {
        *self.lease_deadline.lock() = deadline;
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.lease_deadline()
    }

    pub fn operations(&self) -> Vec<OperationId> {
        self.operations.lock().iter().copied().collect()
    }

    pub fn owns_operation(&self, id: OperationId) -> bool {
        self.operations.lock().contains(&id)
    }

    pub fn assign_operation(&self, id: OperationId) {
        self.operations.lock().insert(id);
    }

    pub fn remove_operation(&self, id: OperationId) {
        self.operations.lock().remove(&id);
    }

    /// Enqueue an operation command for the agent
    pub fn enqueue_operation_event(
        &self,
        operation_id: OperationId,
        controller_epoch: ControllerEpoch,
        kind: SchedulerOperationEventKind,
    ) {
        self.operation_events_outbox.enqueue(SchedulerOperationEvent {
            operation_id,
            controller_epoch,
            kind,
        });
    }

    /// Enqueue a job event for the agent
    pub fn enqueue_job_event(
        &self,
        job_id: JobId,
        operation_id: OperationId,
        controller_epoch: ControllerEpoch,
        kind: SchedulerJobEventKind,
    ) {
        self.job_events_outbox.enqueue(SchedulerJobEvent {
            job_id,
            operation_id,
            controller_epoch,
            kind,
        });
    }

    /// Register interest in the response to `job_id`
    pub fn register_pending_schedule_response(
        &self,
        job_id: JobId,
    ) -> oneshot::Receiver<Result<JobStartSpec, ScheduleJobFailReason>> {
        let (tx, rx) = oneshot::channel();
        self.pending_schedule_responses.lock().insert(job_id, tx);
        rx
    }

    /// Deliver a schedule-job response to its waiter. Returns the spec
    /// when nobody is waiting anymore (the walk timed out first) and the
    /// job therefore has to be aborted back to the controller.
    pub fn complete_schedule_response(
        &self,
        job_id: JobId,
        result: Result<JobStartSpec, ScheduleJobFailReason>,
    ) -> Option<JobStartSpec> {
        let sender = self.pending_schedule_responses.lock().remove(&job_id);
        match sender {
            Some(sender) => match sender.send(result) {
                Ok(()) => None,
                Err(unsent) => unsent.ok(),
            },
            None => {
                debug!(job = %job_id, "Schedule-job response arrived with no waiter");
                result.ok()
            }
        }
    }

    /// Drop all in-flight waits; used when the agent dies
    pub fn fail_pending_schedule_responses(&self) {
        let mut pending = self.pending_schedule_responses.lock();
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ScheduleJobFailReason::OperationNotRunning));
        }
    }
}

impl std::fmt::Debug for ControllerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerAgent")
            .field("id", &self.id)
            .field("incarnation", &self.incarnation)
            .field("state", &self.state())
            .field("operations", &self.operations.lock().len())
            .finish()
    }
}

/// The fair-share tree's async handle to one operation's controller.
///
/// Holds the operation strongly (for epoch and lifetime) and the agent
/// weakly: the operation survives agent death, the handle just starts
/// refusing until a new agent is wired in.
pub struct AgentOperationController {
    operation: Arc<Operation>,
    agent: Mutex<Weak<ControllerAgent>>,
    demand: Mutex<OperationDemand>,
}

impl AgentOperationController {
    pub fn new(operation: Arc<Operation>) -> Self {
        Self {
            operation,
            agent: Mutex::new(Weak::new()),
            demand: Mutex::new(OperationDemand::default()),
        }
    }

    pub fn set_agent(&self, agent: &Arc<ControllerAgent>) {
        *self.agent.lock() = Arc::downgrade(agent);
    }

    pub fn clear_agent(&self) {
        *self.agent.lock() = Weak::new();
    }

    pub fn agent(&self) -> Option<Arc<ControllerAgent>> {
        self.agent.lock().upgrade()
    }

    /// Refresh the cached demand from an agent heartbeat
    pub fn set_demand(&self, demand: OperationDemand) {
        *self.demand.lock() = demand;
    }
}

#[async_trait]
impl OperationControllerApi for AgentOperationController {
    fn demand(&self) -> OperationDemand {
        *self.demand.lock()
    }

    fn controller_epoch(&self) -> ControllerEpoch {
        self.operation.controller_epoch()
    }

    async fn schedule_job(
        &self,
        request: ScheduleJobRequest,
    ) -> Result<JobStartSpec, ScheduleJobFailReason> {
        let Some(agent) = self.agent() else {
            return Err(ScheduleJobFailReason::OperationNotRunning);
        };
        if request.controller_epoch != self.operation.controller_epoch() {
            return Err(ScheduleJobFailReason::OperationNotRunning);
        }
        let receiver = agent.register_pending_schedule_response(request.job_id);
        agent.schedule_job_requests_outbox.enqueue(request);
        match receiver.await {
            Ok(result) => result,
            // The sender was dropped: agent death failed the wait.
            Err(_) => Err(ScheduleJobFailReason::OperationNotRunning),
        }
    }

    fn on_unscheduled_job_aborted(&self, job_id: JobId) {
        if let Some(agent) = self.agent() {
            agent.enqueue_job_event(
                job_id,
                self.operation.id,
                self.operation.controller_epoch(),
                SchedulerJobEventKind::Aborted {
                    reason: JobAbortReason::Scheduler,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> ControllerAgent {
        ControllerAgent::new(
            AgentId::new("agent-1"),
            IncarnationId::new(),
            BTreeSet::new(),
            vec!["agent-1:9013".to_string()],
            Utc::now() + chrono::Duration::seconds(10),
        )
    }

    #[test]
    fn test_lease_expiry() {
        let agent = agent();
        let now = Utc::now();
        assert!(!agent.lease_expired(now));
        assert!(agent.lease_expired(now + chrono::Duration::seconds(11)));
        agent.renew_lease(now + chrono::Duration::seconds(30));
        assert!(!agent.lease_expired(now + chrono::Duration::seconds(11)));
    }

    #[tokio::test]
    async fn test_schedule_response_roundtrip() {
        let agent = agent();
        let job_id = JobId::new();
        let receiver = agent.register_pending_schedule_response(job_id);
        let leftover =
            agent.complete_schedule_response(job_id, Err(ScheduleJobFailReason::NoPendingJobs));
        assert!(leftover.is_none());
        assert_eq!(
            receiver.await.unwrap(),
            Err(ScheduleJobFailReason::NoPendingJobs)
        );
    }

    #[test]
    fn test_unclaimed_successful_response_is_returned() {
        let agent = agent();
        let job_id = JobId::new();
        // No waiter registered: a successful spec must come back so the
        // caller can abort the job at the controller.
        let spec = JobStartSpec {
            resources: atoll_core::JobResourcesWithQuota::default(),
            interruptible: false,
            preemption_mode: atoll_proto::PreemptionMode::Normal,
        };
        let leftover = agent.complete_schedule_response(job_id, Ok(spec.clone()));
        assert_eq!(leftover, Some(spec));
    }
}
