//! In-process fixtures for integration tests
//!
//! Provides:
//! - [`InMemoryMaster`]: the master reduced to maps, with injectable
//!   transient failures and permission denials
//! - [`SimAgent`]: a scripted controller agent speaking the real
//!   handshake/heartbeat protocol against a [`Scheduler`]
//! - [`SimNode`]: a scripted exec node sending real node heartbeats

use crate::error::{SchedulerError, SchedulerResult};
use crate::master::{MasterClient, PersistedOperation, TransactionType};
use crate::operation::OperationState;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use atoll_core::{
    AgentId, ControllerEpoch, IncarnationId, JobId, JobResources, JobResourcesWithQuota, NodeId,
    OperationId, TransactionId,
};
use atoll_proto::{
    AgentHeartbeatRequest, AgentJobEvent, AgentOperationEvent, AgentOperationEventKind,
    AgentOperationInfo, HandshakeRequest, JobAbortReason, JobStartSpec, MemoryStatistics,
    MessageQueueInbox, MessageQueueOutbox, NodeHeartbeatRequest, NodeHeartbeatResponse,
    ReportedJobState, ReportedJobStatus, RevivedJob, ScheduleJobFailReason, ScheduleJobResponse,
    SchedulerJobEventKind, SchedulerOperationEventKind,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ----------------------------------------------------------------------
// In-memory master
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredOperation {
    attributes: serde_json::Value,
    flushed: bool,
}

/// The master reduced to maps
#[derive(Default)]
pub struct InMemoryMaster {
    lock_holder: Mutex<Option<IncarnationId>>,
    operations: DashMap<OperationId, StoredOperation>,
    agent_instances: DashMap<AgentId, serde_json::Value>,
    transactions: DashMap<TransactionId, TransactionType>,
    denied_permissions: Mutex<HashSet<(String, String)>>,
    /// Next N mutating calls fail transiently
    transient_failures: AtomicUsize,
}

impl InMemoryMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` mutating calls fail with a transient error
    pub fn inject_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn deny_permission(&self, user: &str, path: &str) {
        self.denied_permissions
            .lock()
            .insert((user.to_string(), path.to_string()));
    }

    pub fn operation_attributes(&self, id: OperationId) -> Option<serde_json::Value> {
        self.operations.get(&id).map(|stored| stored.attributes.clone())
    }

    pub fn is_flushed(&self, id: OperationId) -> bool {
        self.operations
            .get(&id)
            .map(|stored| stored.flushed)
            .unwrap_or(false)
    }

    pub fn has_agent_instance(&self, id: &AgentId) -> bool {
        self.agent_instances.contains_key(id)
    }

    fn check_transient(&self) -> SchedulerResult<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SchedulerError::TransientMaster(
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MasterClient for InMemoryMaster {
    async fn acquire_scheduler_lock(&self, incarnation: IncarnationId) -> SchedulerResult<()> {
        // A newer scheduler displaces the previous holder; the old one
        // discovers this through its lock ping.
        *self.lock_holder.lock() = Some(incarnation);
        Ok(())
    }

    async fn ping_scheduler_lock(&self, incarnation: IncarnationId) -> SchedulerResult<()> {
        match *self.lock_holder.lock() {
            Some(holder) if holder == incarnation => Ok(()),
            _ => Err(SchedulerError::LockLost),
        }
    }

    async fn create_operation_node(
        &self,
        id: OperationId,
        attributes: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.check_transient()?;
        self.operations.insert(
            id,
            StoredOperation {
                attributes,
                flushed: false,
            },
        );
        Ok(())
    }

    async fn update_operation_node(
        &self,
        id: OperationId,
        patch: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.check_transient()?;
        let mut stored = self
            .operations
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::Master(format!("operation node {id} missing")))?;
        if let (Some(attributes), Some(patch)) =
            (stored.attributes.as_object_mut(), patch.as_object())
        {
            for (key, value) in patch {
                attributes.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn flush_operation_node(&self, id: OperationId) -> SchedulerResult<()> {
        self.check_transient()?;
        if let Some(mut stored) = self.operations.get_mut(&id) {
            stored.flushed = true;
        }
        Ok(())
    }

    async fn list_operation_nodes(&self) -> SchedulerResult<Vec<PersistedOperation>> {
        let mut persisted = Vec::new();
        for entry in self.operations.iter() {
            let attributes = &entry.attributes;
            let state: OperationState =
                serde_json::from_value(attributes["state"].clone())
                    .unwrap_or(OperationState::Starting);
            persisted.push(PersistedOperation {
                id: *entry.key(),
                operation_type: attributes["operation_type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                user: attributes["user"].as_str().unwrap_or_default().to_string(),
                spec: attributes["spec"].clone(),
                state,
                runtime_params: serde_json::from_value(attributes["runtime_params"].clone())
                    .unwrap_or_default(),
                controller_agent_tag: attributes["controller_agent_tag"]
                    .as_str()
                    .unwrap_or("default")
                    .to_string(),
                controller_transactions: Vec::new(),
                flushed: entry.flushed,
                last_needed_resources: JobResources::zero(),
            });
        }
        Ok(persisted)
    }

    async fn start_transaction(
        &self,
        transaction_type: TransactionType,
    ) -> SchedulerResult<TransactionId> {
        self.check_transient()?;
        let id = TransactionId::new();
        self.transactions.insert(id, transaction_type);
        Ok(id)
    }

    async fn abort_transaction(&self, id: TransactionId) -> SchedulerResult<()> {
        self.transactions.remove(&id);
        Ok(())
    }

    async fn ping_transaction(&self, id: TransactionId) -> SchedulerResult<()> {
        if self.transactions.contains_key(&id) {
            Ok(())
        } else {
            Err(SchedulerError::Master(format!("transaction {id} missing")))
        }
    }

    async fn create_agent_instance_node(
        &self,
        id: &AgentId,
        attributes: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.check_transient()?;
        self.agent_instances.insert(id.clone(), attributes);
        Ok(())
    }

    async fn check_permission(
        &self,
        user: &str,
        path: &str,
        _permission: &str,
    ) -> SchedulerResult<bool> {
        Ok(!self
            .denied_permissions
            .lock()
            .contains(&(user.to_string(), path.to_string())))
    }
}

// ----------------------------------------------------------------------
// Scripted controller agent
// ----------------------------------------------------------------------

/// Controller-side state of one operation, shared between agent
/// incarnations the way the persisted controller snapshot is
#[derive(Debug, Clone)]
pub struct SimOpState {
    pub epoch: ControllerEpoch,
    pub pending: i64,
    pub job_resources: JobResources,
    pub jobs: HashMap<JobId, RevivedJob>,
    pub materialized: bool,
}

/// The "master-persisted" controller state; give the same store to two
/// agents to model an agent restart that reloads its snapshot
#[derive(Default)]
pub struct SimControllerStore {
    operations: DashMap<OperationId, SimOpState>,
}

impl SimControllerStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn operation(&self, id: OperationId) -> Option<SimOpState> {
        self.operations.get(&id).map(|state| state.clone())
    }

    pub fn set_pending(&self, id: OperationId, pending: i64) {
        if let Some(mut state) = self.operations.get_mut(&id) {
            state.pending = pending;
        }
    }

    pub fn running_job_ids(&self, id: OperationId) -> Vec<JobId> {
        self.operations
            .get(&id)
            .map(|state| state.jobs.keys().copied().collect())
            .unwrap_or_default()
    }
}

struct SimAgentLink {
    incarnation: IncarnationId,
    operation_events_out: MessageQueueOutbox<AgentOperationEvent>,
    job_events_out: MessageQueueOutbox<AgentJobEvent>,
    schedule_responses_out: MessageQueueOutbox<ScheduleJobResponse>,
    operation_events_in: MessageQueueInbox,
    job_events_in: MessageQueueInbox,
    schedule_requests_in: MessageQueueInbox,
}

/// A scripted controller agent
pub struct SimAgent {
    pub id: AgentId,
    tags: BTreeSet<String>,
    store: Arc<SimControllerStore>,
    default_pending: i64,
    default_job_resources: JobResources,
    memory: Mutex<MemoryStatistics>,
    link: Mutex<Option<SimAgentLink>>,
    /// Operations this incarnation actively controls
    controlled: Mutex<HashSet<OperationId>>,
}

impl SimAgent {
    pub fn new(
        id: impl Into<String>,
        tags: &[&str],
        store: Arc<SimControllerStore>,
        default_job_resources: JobResources,
        default_pending: i64,
    ) -> Self {
        Self {
            id: AgentId::new(id),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            store,
            default_pending,
            default_job_resources,
            memory: Mutex::new(MemoryStatistics {
                limit: 64 << 30,
                usage: 4 << 30,
            }),
            link: Mutex::new(None),
            controlled: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_memory(&self, statistics: MemoryStatistics) {
        *self.memory.lock() = statistics;
    }

    pub fn incarnation(&self) -> Option<IncarnationId> {
        self.link.lock().as_ref().map(|link| link.incarnation)
    }

    /// Handshake: a fresh incarnation with fresh queues. Operations the
    /// scheduler does not confirm are abandoned.
    pub async fn connect(&self, scheduler: &Scheduler) -> SchedulerResult<()> {
        let known: Vec<OperationId> = self
            .store
            .operations
            .iter()
            .map(|entry| *entry.key())
            .collect();
        let response = scheduler
            .process_agent_handshake(HandshakeRequest {
                agent_id: self.id.clone(),
                tags: self.tags.clone(),
                addresses: vec![format!("{}:9013", self.id)],
                known_operations: known.clone(),
            })
            .await?;

        let confirmed: HashSet<OperationId> = response.known_operations.iter().copied().collect();
        *self.controlled.lock() = confirmed;
        *self.link.lock() = Some(SimAgentLink {
            incarnation: response.incarnation_id,
            operation_events_out: MessageQueueOutbox::new("sim_operation_events"),
            job_events_out: MessageQueueOutbox::new("sim_job_events"),
            schedule_responses_out: MessageQueueOutbox::new("sim_schedule_responses"),
            operation_events_in: MessageQueueInbox::new("sim_operation_events"),
            job_events_in: MessageQueueInbox::new("sim_job_events"),
            schedule_requests_in: MessageQueueInbox::new("sim_schedule_requests"),
        });
        Ok(())
    }

    /// Enqueue a `Completed` event, as the controller does when the last
    /// job finishes and outputs are committed
    pub fn complete_operation(&self, id: OperationId) {
        let epoch = self
            .store
            .operation(id)
            .map(|state| state.epoch)
            .unwrap_or_default();
        if let Some(link) = self.link.lock().as_ref() {
            link.operation_events_out.enqueue(AgentOperationEvent {
                operation_id: id,
                controller_epoch: epoch,
                kind: AgentOperationEventKind::Completed,
            });
        }
    }

    /// One heartbeat round trip, driving the controller script
    pub async fn heartbeat(&self, scheduler: &Scheduler) -> SchedulerResult<()> {
        let request = {
            let link_guard = self.link.lock();
            let link = link_guard
                .as_ref()
                .ok_or_else(|| SchedulerError::Master("agent not connected".to_string()))?;
            let controlled = self.controlled.lock();
            let operations: Vec<AgentOperationInfo> = controlled
                .iter()
                .filter_map(|&id| self.store.operation(id).map(|state| (id, state)))
                .map(|(id, state)| AgentOperationInfo {
                    operation_id: id,
                    alerts: BTreeMap::new(),
                    suspicious_jobs: None,
                    pending_job_count: state.pending,
                    needed_resources: state.job_resources * state.pending.max(0) as f64,
                })
                .collect();
            AgentHeartbeatRequest {
                agent_id: self.id.clone(),
                incarnation_id: link.incarnation,
                operations,
                operation_events: link.operation_events_out.build_outgoing(),
                job_events: link.job_events_out.build_outgoing(),
                schedule_job_responses: link.schedule_responses_out.build_outgoing(),
                scheduler_operation_events_ack: link.operation_events_in.report_status(),
                scheduler_job_events_ack: link.job_events_in.report_status(),
                schedule_job_requests_ack: link.schedule_requests_in.report_status(),
                controller_memory: Some(*self.memory.lock()),
                exec_nodes_requested: false,
            }
        };

        let response = scheduler.process_agent_heartbeat(request).await?;

        let link_guard = self.link.lock();
        let link = link_guard
            .as_ref()
            .ok_or_else(|| SchedulerError::Master("agent not connected".to_string()))?;
        link.operation_events_out
            .handle_status(response.operation_events_ack);
        link.job_events_out.handle_status(response.job_events_ack);
        link.schedule_responses_out
            .handle_status(response.schedule_job_responses_ack);

        for id in response.operations_to_unregister {
            self.controlled.lock().remove(&id);
            self.store.operations.remove(&id);
        }

        let mut commands = Vec::new();
        link.operation_events_in
            .handle_incoming(response.scheduler_operation_events, |event| {
                commands.push(event)
            });
        for command in commands {
            self.handle_operation_command(link, command);
        }

        let mut job_events = Vec::new();
        link.job_events_in
            .handle_incoming(response.scheduler_job_events, |event| job_events.push(event));
        for event in job_events {
            self.handle_job_event(event);
        }

        let mut requests = Vec::new();
        link.schedule_requests_in
            .handle_incoming(response.schedule_job_requests, |request| {
                requests.push(request)
            });
        for request in requests {
            let result = self.answer_schedule_request(&request);
            link.schedule_responses_out.enqueue(ScheduleJobResponse {
                job_id: request.job_id,
                operation_id: request.operation_id,
                controller_epoch: request.controller_epoch,
                result,
            });
        }
        Ok(())
    }

    fn handle_operation_command(
        &self,
        link: &SimAgentLink,
        command: atoll_proto::SchedulerOperationEvent,
    ) {
        let id = command.operation_id;
        let epoch = command.controller_epoch;
        let mut reply = |kind: AgentOperationEventKind| {
            link.operation_events_out.enqueue(AgentOperationEvent {
                operation_id: id,
                controller_epoch: epoch,
                kind,
            });
        };
        match command.kind {
            SchedulerOperationEventKind::Start { .. } => {
                self.store.operations.insert(
                    id,
                    SimOpState {
                        epoch,
                        pending: self.default_pending,
                        job_resources: self.default_job_resources,
                        jobs: HashMap::new(),
                        materialized: false,
                    },
                );
                self.controlled.lock().insert(id);
                reply(AgentOperationEventKind::Initialized { result: Ok(()) });
            }
            SchedulerOperationEventKind::Prepare => {
                reply(AgentOperationEventKind::Prepared { result: Ok(()) });
            }
            SchedulerOperationEventKind::Materialize => {
                if let Some(mut state) = self.store.operations.get_mut(&id) {
                    state.epoch = epoch;
                    state.materialized = true;
                }
                reply(AgentOperationEventKind::Materialized { result: Ok(()) });
            }
            SchedulerOperationEventKind::Revive { .. } => {
                let jobs = match self.store.operations.get_mut(&id) {
                    Some(mut state) => {
                        state.epoch = epoch;
                        state.jobs.values().cloned().collect()
                    }
                    None => {
                        // Nothing persisted: revive to a clean slate.
                        self.store.operations.insert(
                            id,
                            SimOpState {
                                epoch,
                                pending: self.default_pending,
                                job_resources: self.default_job_resources,
                                jobs: HashMap::new(),
                                materialized: false,
                            },
                        );
                        Vec::new()
                    }
                };
                self.controlled.lock().insert(id);
                reply(AgentOperationEventKind::Revived { result: Ok(jobs) });
            }
            SchedulerOperationEventKind::Commit => {
                reply(AgentOperationEventKind::Committed { result: Ok(()) });
            }
            SchedulerOperationEventKind::Abort { .. } => {
                self.store.operations.remove(&id);
                self.controlled.lock().remove(&id);
            }
        }
    }

    fn handle_job_event(&self, event: atoll_proto::SchedulerJobEvent) {
        let Some(mut state) = self.store.operations.get_mut(&event.operation_id) else {
            return;
        };
        match event.kind {
            SchedulerJobEventKind::Started {
                node_id,
                resources,
                start_time,
            } => {
                state.jobs.insert(
                    event.job_id,
                    RevivedJob {
                        job_id: event.job_id,
                        node_id,
                        resource_usage: resources,
                        start_time,
                    },
                );
            }
            SchedulerJobEventKind::Completed | SchedulerJobEventKind::Failed { .. } => {
                state.jobs.remove(&event.job_id);
            }
            SchedulerJobEventKind::Aborted { reason } => {
                state.jobs.remove(&event.job_id);
                // Work lost through no fault of the job goes back to the
                // pending set.
                if matches!(
                    reason,
                    JobAbortReason::NodeLost
                        | JobAbortReason::Preempted { .. }
                        | JobAbortReason::RevivalNodeLost
                        | JobAbortReason::Scheduler
                ) {
                    state.pending += 1;
                }
            }
            SchedulerJobEventKind::Running { .. } => {}
        }
    }

    fn answer_schedule_request(
        &self,
        request: &atoll_proto::ScheduleJobRequest,
    ) -> Result<JobStartSpec, ScheduleJobFailReason> {
        let Some(mut state) = self.store.operations.get_mut(&request.operation_id) else {
            return Err(ScheduleJobFailReason::OperationNotRunning);
        };
        if state.epoch != request.controller_epoch || !state.materialized {
            return Err(ScheduleJobFailReason::OperationNotRunning);
        }
        if state.pending <= 0 {
            return Err(ScheduleJobFailReason::NoPendingJobs);
        }
        state.pending -= 1;
        Ok(JobStartSpec {
            resources: JobResourcesWithQuota::new(state.job_resources),
            interruptible: true,
            preemption_mode: atoll_proto::PreemptionMode::Normal,
        })
    }
}

// ----------------------------------------------------------------------
// Scripted exec node
// ----------------------------------------------------------------------

/// A scripted worker node
pub struct SimNode {
    pub id: NodeId,
    pub address: String,
    pub tags: BTreeSet<String>,
    pub resource_limits: JobResources,
    jobs: HashMap<JobId, (OperationId, JobResources)>,
    /// One-shot state reports for jobs that just finished
    finished: Vec<ReportedJobStatus>,
}

impl SimNode {
    pub fn new(id: u32, cores: f64, tags: &[&str]) -> Self {
        Self {
            id: NodeId(id),
            address: format!("node{id}:9012"),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            resource_limits: JobResources {
                cpu: cores,
                memory: 8 << 30,
                user_slots: 100,
                network: 0,
                gpu: 0,
            },
            jobs: HashMap::new(),
            finished: Vec::new(),
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn jobs_of(&self, operation_id: OperationId) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|(_, (op, _))| *op == operation_id)
            .map(|(&job, _)| job)
            .collect()
    }

    /// Mark a job finished; the next heartbeat reports it
    pub fn complete_job(&mut self, job_id: JobId) {
        if let Some((operation_id, resources)) = self.jobs.remove(&job_id) {
            self.finished.push(ReportedJobStatus {
                job_id,
                operation_id,
                state: ReportedJobState::Completed,
                resource_usage: resources,
                error: None,
            });
        }
    }

    /// One heartbeat round trip, applying the reply to local job state
    pub async fn heartbeat(&mut self, scheduler: &Scheduler) -> SchedulerResult<NodeHeartbeatResponse> {
        let mut job_states: Vec<ReportedJobStatus> = self
            .jobs
            .iter()
            .map(|(&job_id, &(operation_id, resources))| ReportedJobStatus {
                job_id,
                operation_id,
                state: ReportedJobState::Running,
                resource_usage: resources,
                error: None,
            })
            .collect();
        job_states.append(&mut self.finished);

        let usage = self
            .jobs
            .values()
            .fold(JobResources::zero(), |usage, &(_, resources)| {
                usage + resources
            });

        let response = scheduler
            .process_node_heartbeat(NodeHeartbeatRequest {
                node_id: self.id,
                address: self.address.clone(),
                tags: self.tags.clone(),
                io_weight: 1.0,
                resource_limits: self.resource_limits,
                resource_usage: usage,
                disk_limits: Default::default(),
                disk_usage: Default::default(),
                job_states,
            })
            .await?;

        for start in &response.jobs_to_start {
            self.jobs
                .insert(start.job_id, (start.operation_id, start.resources));
        }
        for job_id in &response.jobs_to_abort {
            self.jobs.remove(job_id);
        }
        Ok(response)
    }
}
