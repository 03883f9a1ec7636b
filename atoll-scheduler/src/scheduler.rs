//! The scheduler façade
//!
//! Wires the strategy, the node shards, the agent tracker and the master
//! into one long-lived service. All lifecycle transitions funnel through
//! `set_operation_state`, which persists the new state to the master
//! before applying it, so a crash never observes an unpersisted
//! transition.

use crate::agent::{AgentOperationController, ControllerAgent};
use crate::agent_tracker::{AgentHost, ControllerAgentTracker};
use crate::alerts::{AlertSet, SchedulerAlertType};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::master::{result_patch, state_patch, MasterClient, RetryPolicy, TransactionType};
use crate::node_shard::{shard_of, NodeShard, ShardHost};
use crate::operation::{Operation, OperationState};
use async_trait::async_trait;
use atoll_core::{
    AgentId, ControllerEpoch, ExecNodeDescriptor, IncarnationId, JobId, OperationId, TransactionId,
};
use atoll_fairshare::{FairShareStrategy, OperationControllerApi, OperationDemand, OperationPoolParams};
use atoll_proto::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, AgentJobEvent, AgentJobEventKind,
    AgentOperationEvent, AgentOperationEventKind, HandshakeRequest, HandshakeResponse,
    JobAbortReason, NodeHeartbeatRequest, NodeHeartbeatResponse, RevivedJob,
    SchedulerJobEventKind, SchedulerOperationEventKind, WireError,
};
use atoll_snapshot::Cluster;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the scheduler tracks per operation
pub(crate) struct OperationRecord {
    pub operation: Arc<Operation>,
    pub controller: Arc<AgentOperationController>,
    /// Transactions handed to `Revive`
    pub controller_transactions: Mutex<Vec<TransactionId>>,
    pub suspicious_jobs: Mutex<Option<serde_json::Value>>,
}

/// The scheduler core
pub struct Scheduler {
    config: RwLock<SchedulerConfig>,
    pub incarnation: IncarnationId,
    master: Arc<dyn MasterClient>,
    retry: RetryPolicy,
    strategy: Arc<FairShareStrategy>,
    shards: Vec<Arc<NodeShard>>,
    tracker: ControllerAgentTracker,
    operations: DashMap<OperationId, Arc<OperationRecord>>,
    alerts: AlertSet,
    cluster: Option<Arc<Cluster>>,
}

impl Scheduler {
    /// Acquire the scheduler lock under a fresh incarnation and build the
    /// service. Failing to take the lock means another scheduler is alive.
    pub async fn connect(
        master: Arc<dyn MasterClient>,
        config: SchedulerConfig,
        cluster: Option<Arc<Cluster>>,
    ) -> SchedulerResult<Arc<Self>> {
        let incarnation = IncarnationId::new();
        let retry = RetryPolicy {
            attempts: config.master_retry_attempts,
            backoff: std::time::Duration::from_millis(config.master_retry_backoff_ms),
            backoff_cap: std::time::Duration::from_millis(config.master_retry_backoff_cap_ms),
        };
        retry
            .run(|| master.acquire_scheduler_lock(incarnation))
            .await?;

        let shards = (0..config.node_shard_count.max(1))
            .map(|id| Arc::new(NodeShard::new(id)))
            .collect();
        let strategy = Arc::new(FairShareStrategy::new(config.strategy.clone()));
        info!(%incarnation, "Scheduler connected to master");
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            incarnation,
            master,
            retry,
            strategy,
            shards,
            tracker: ControllerAgentTracker::new(incarnation),
            operations: DashMap::new(),
            alerts: AlertSet::new(),
            cluster,
        }))
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: SchedulerConfig) {
        self.strategy.update_config(config.strategy.clone());
        *self.config.write() = config;
    }

    pub fn strategy(&self) -> &Arc<FairShareStrategy> {
        &self.strategy
    }

    pub fn alerts(&self) -> &AlertSet {
        &self.alerts
    }

    pub fn tracker(&self) -> &ControllerAgentTracker {
        &self.tracker
    }

    pub fn operation(&self, id: OperationId) -> Option<Arc<Operation>> {
        self.operations.get(&id).map(|record| record.operation.clone())
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.operations
            .iter()
            .map(|record| record.operation.clone())
            .collect()
    }

    pub(crate) fn record(&self, id: OperationId) -> Option<Arc<OperationRecord>> {
        self.operations.get(&id).map(|record| record.clone())
    }

    pub(crate) fn suspicious_jobs(&self, id: OperationId) -> Option<serde_json::Value> {
        self.record(id)
            .and_then(|record| record.suspicious_jobs.lock().clone())
    }

    pub async fn shard_counters(&self) -> Vec<crate::node_shard::ShardCounters> {
        let mut counters = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            counters.push(shard.counters().await);
        }
        counters
    }

    // ------------------------------------------------------------------
    // User control surface
    // ------------------------------------------------------------------

    /// Admit a new operation: validate pools and permissions, persist the
    /// operation node, register it with the strategy, and hand it to a
    /// controller agent.
    pub async fn start_operation(
        &self,
        operation_type: impl Into<String>,
        user: impl Into<String>,
        spec: serde_json::Value,
        controller_agent_tag: impl Into<String>,
        runtime_params: HashMap<String, OperationPoolParams>,
    ) -> SchedulerResult<OperationId> {
        let user = user.into();
        for params in runtime_params.values() {
            let path = format!("pools/{}", params.pool);
            let allowed = self
                .retry
                .run(|| self.master.check_permission(&user, &path, "use"))
                .await?;
            if !allowed {
                return Err(SchedulerError::PermissionDenied {
                    user,
                    path,
                    permission: "use".to_string(),
                });
            }
        }
        self.strategy.validate_operation_start(&runtime_params)?;

        let id = OperationId::new();
        let now = Utc::now();
        let operation = Arc::new(Operation::new(
            id,
            operation_type,
            user,
            spec,
            controller_agent_tag,
            runtime_params.clone(),
            now,
        ));
        let controller = Arc::new(AgentOperationController::new(operation.clone()));
        let record = Arc::new(OperationRecord {
            operation: operation.clone(),
            controller: controller.clone(),
            controller_transactions: Mutex::new(Vec::new()),
            suspicious_jobs: Mutex::new(None),
        });

        self.retry
            .run(|| {
                self.master.create_operation_node(
                    id,
                    serde_json::json!({
                        "operation_type": operation.operation_type,
                        "user": operation.user,
                        "spec": operation.spec,
                        "state": OperationState::Starting,
                        "start_time": operation.start_time,
                        "controller_agent_tag": operation.controller_agent_tag,
                        "runtime_params": runtime_params,
                    }),
                )
            })
            .await?;
        self.operations.insert(id, record.clone());

        if let Err(error) = self.strategy.register_operation(
            id,
            &runtime_params,
            controller.clone() as Arc<dyn OperationControllerApi>,
            now,
        ) {
            self.operations.remove(&id);
            let _ = self.master.flush_operation_node(id).await;
            return Err(error.into());
        }

        self.set_operation_state(&operation, OperationState::Initializing)
            .await?;
        self.try_assign_agent(&record).await?;
        info!(operation = %id, "Operation started");
        Ok(id)
    }

    /// Abort an operation. Idempotent: aborting a finished operation is a
    /// successful no-op.
    pub async fn abort_operation(&self, id: OperationId, reason: &str) -> SchedulerResult<()> {
        let record = self
            .record(id)
            .ok_or(SchedulerError::UnknownOperation(id))?;
        if record.operation.state().is_terminal() {
            return Ok(());
        }
        self.terminate_operation(
            &record,
            OperationState::Aborting,
            OperationState::Aborted,
            WireError::new(reason),
        )
        .await
    }

    /// Suspend: jobs keep running, no new jobs are scheduled
    pub async fn suspend_operation(&self, id: OperationId) -> SchedulerResult<()> {
        let record = self
            .record(id)
            .ok_or(SchedulerError::UnknownOperation(id))?;
        record.operation.set_suspended(true);
        info!(operation = %id, "Operation suspended");
        Ok(())
    }

    pub async fn resume_operation(&self, id: OperationId) -> SchedulerResult<()> {
        let record = self
            .record(id)
            .ok_or(SchedulerError::UnknownOperation(id))?;
        record.operation.set_suspended(false);
        info!(operation = %id, "Operation resumed");
        Ok(())
    }

    /// Update per-tree weight / resource limits in place
    pub async fn update_runtime_parameters(
        &self,
        id: OperationId,
        runtime_params: HashMap<String, OperationPoolParams>,
    ) -> SchedulerResult<()> {
        let record = self
            .record(id)
            .ok_or(SchedulerError::UnknownOperation(id))?;
        self.strategy.update_operation_params(id, &runtime_params)?;
        record.operation.set_runtime_params(runtime_params.clone());
        self.retry
            .run(|| {
                self.master.update_operation_node(
                    id,
                    serde_json::json!({ "runtime_params": runtime_params }),
                )
            })
            .await?;
        Ok(())
    }

    /// Apply a pool configuration, creating the pool when it does not
    /// exist. A rejected config raises the pools alert and leaves the
    /// previous configuration in place; existing operations are untouched.
    pub fn update_pool_config(
        &self,
        tree_id: &str,
        pool: &str,
        config: atoll_fairshare::PoolConfig,
    ) -> SchedulerResult<()> {
        let result = (|| {
            let tree = self.strategy.tree(tree_id)?;
            match tree.update_pool_config(pool, config.clone()) {
                Err(atoll_fairshare::StrategyError::UnknownPool { .. }) => {
                    tree.create_pool(pool, None, config)
                }
                other => other,
            }
        })();
        match result {
            Ok(()) => {
                self.alerts.clear(SchedulerAlertType::UpdatePools);
                Ok(())
            }
            Err(error) => {
                self.alerts
                    .set(SchedulerAlertType::UpdatePools, error.to_string());
                Err(error.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Node and agent RPC surface
    // ------------------------------------------------------------------

    pub async fn process_node_heartbeat(
        &self,
        request: NodeHeartbeatRequest,
    ) -> SchedulerResult<NodeHeartbeatResponse> {
        let shard = self.shards[shard_of(request.node_id, self.shards.len())].clone();
        shard
            .process_heartbeat(self, &self.strategy, request, Utc::now())
            .await
    }

    pub async fn process_agent_handshake(
        &self,
        request: HandshakeRequest,
    ) -> SchedulerResult<HandshakeResponse> {
        let now = Utc::now();
        let agent_id = request.agent_id.clone();
        let attributes = serde_json::json!({
            "connection_time": now,
            "tags": request.tags,
            "annotations": {},
        });
        self.retry
            .run(|| self.master.create_agent_instance_node(&agent_id, attributes.clone()))
            .await?;
        let config = self.config();
        self.tracker
            .process_handshake(self, &config, request, now)
            .await
    }

    pub async fn process_agent_heartbeat(
        &self,
        request: AgentHeartbeatRequest,
    ) -> SchedulerResult<AgentHeartbeatResponse> {
        let config = self.config();
        self.tracker
            .process_heartbeat(self, &config, request, Utc::now())
            .await
    }

    // ------------------------------------------------------------------
    // Background ticks; the host loops these at the configured periods
    // ------------------------------------------------------------------

    /// Periodic fair-share update over all trees
    pub async fn tick_fair_share_update(&self) {
        let nodes = self.all_exec_nodes().await;
        let result = self.strategy.update_fair_share(&nodes, Utc::now());
        for operation_id in result.activated_operations {
            let Some(record) = self.record(operation_id) else {
                continue;
            };
            if record.operation.state() == OperationState::Materializing {
                if let Err(error) = self
                    .set_operation_state(&record.operation, OperationState::Running)
                    .await
                {
                    warn!(operation = %operation_id, %error, "Failed to activate operation");
                }
            }
        }
        self.alerts.clear(SchedulerAlertType::UpdateFairShare);
    }

    /// Drop agents whose lease expired; their operations move to revival
    pub async fn tick_check_agent_leases(&self) {
        self.tracker.check_leases(self, Utc::now()).await;
    }

    /// Mark silent nodes offline and abort their jobs as lost
    pub async fn tick_sweep_offline_nodes(&self) {
        let timeout = self.config().node_offline_timeout();
        let now = Utc::now();
        for shard in &self.shards {
            shard
                .sweep_offline_nodes(self, &self.strategy, now, timeout)
                .await;
        }
    }

    /// Reload the cluster snapshot; failure keeps the previous one and
    /// raises an alert
    pub async fn tick_load_cluster_snapshot(&self) {
        let Some(cluster) = &self.cluster else {
            return;
        };
        match cluster.load_snapshot().await {
            Ok(_) => self.alerts.clear(SchedulerAlertType::SnapshotLoad),
            Err(error) => self
                .alerts
                .set(SchedulerAlertType::SnapshotLoad, error.to_string()),
        }
    }

    /// Confirm the master lock; `LockLost` is intentionally fatal, a fresh
    /// process takes over
    pub async fn tick_ping_master_lock(&self) -> SchedulerResult<()> {
        self.master.ping_scheduler_lock(self.incarnation).await
    }

    /// Retry agent assignment for operations left without one
    pub async fn tick_assign_agents(&self) {
        let records: Vec<Arc<OperationRecord>> = self
            .operations
            .iter()
            .map(|entry| entry.clone())
            .collect();
        for record in records {
            let state = record.operation.state();
            let needs_agent = record.operation.agent().is_none()
                && matches!(
                    state,
                    OperationState::Initializing | OperationState::Reviving
                );
            if needs_agent {
                if let Err(error) = self.try_assign_agent(&record).await {
                    warn!(operation = %record.operation.id, %error, "Agent assignment failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Revival
    // ------------------------------------------------------------------

    /// Reconstruct operations from the master after a scheduler restart.
    /// Terminal-but-unflushed operations are finalized without revival;
    /// everything else re-enters the Reviving flow.
    pub async fn revive_operations(&self) -> SchedulerResult<()> {
        let persisted = self
            .retry
            .run(|| self.master.list_operation_nodes())
            .await?;
        let now = Utc::now();
        for stored in persisted {
            if stored.state.is_terminal() {
                if !stored.flushed {
                    info!(operation = %stored.id, state = ?stored.state,
                        "Finalizing terminal operation left unflushed");
                    self.retry
                        .run(|| self.master.flush_operation_node(stored.id))
                        .await?;
                }
                continue;
            }
            // Draining operations have no work to revive; they just commit
            // their terminal state.
            if matches!(
                stored.state,
                OperationState::Failing | OperationState::Aborting
            ) {
                let terminal = if stored.state == OperationState::Failing {
                    OperationState::Failed
                } else {
                    OperationState::Aborted
                };
                let id = stored.id;
                self.retry
                    .run(|| {
                        self.master.update_operation_node(
                            id,
                            result_patch(terminal, Some("scheduler restarted while draining")),
                        )
                    })
                    .await?;
                self.retry
                    .run(|| self.master.flush_operation_node(id))
                    .await?;
                continue;
            }

            let operation = Arc::new(Operation::from_persisted(&stored, now));
            let controller = Arc::new(AgentOperationController::new(operation.clone()));
            controller.set_demand(OperationDemand {
                resource_demand: stored.last_needed_resources,
                pending_job_count: 0,
            });
            let record = Arc::new(OperationRecord {
                operation: operation.clone(),
                controller: controller.clone(),
                controller_transactions: Mutex::new(stored.controller_transactions.clone()),
                suspicious_jobs: Mutex::new(None),
            });
            self.operations.insert(stored.id, record.clone());

            if let Err(error) = self.strategy.register_operation(
                stored.id,
                &stored.runtime_params,
                controller.clone() as Arc<dyn OperationControllerApi>,
                now,
            ) {
                warn!(operation = %stored.id, %error, "Failed to re-register operation; failing it");
                self.fail_operation(&record, WireError::new(error.to_string()))
                    .await;
                continue;
            }
            self.set_operation_state(&operation, OperationState::Reviving)
                .await?;
            self.try_assign_agent(&record).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle internals
    // ------------------------------------------------------------------

    /// Persist a state change before applying it; nothing further is
    /// attempted until the write lands
    async fn set_operation_state(
        &self,
        operation: &Operation,
        to: OperationState,
    ) -> SchedulerResult<()> {
        operation.validate_transition(to)?;
        let id = operation.id;
        self.retry
            .run(|| self.master.update_operation_node(id, state_patch(to)))
            .await?;
        operation.apply_transition(to, Utc::now())?;
        debug!(operation = %id, state = ?to, "Operation state persisted");
        Ok(())
    }

    /// Hand the operation to an eligible agent and send the command that
    /// matches its state. Returns false when no agent qualifies yet.
    async fn try_assign_agent(&self, record: &Arc<OperationRecord>) -> SchedulerResult<bool> {
        let operation = &record.operation;
        let config = self.config();
        let Some(agent) = self
            .tracker
            .pick_agent_for_operation(&config, &operation.controller_agent_tag)
        else {
            debug!(operation = %operation.id, tag = %operation.controller_agent_tag,
                "No eligible agent for operation yet");
            return Ok(false);
        };

        agent.assign_operation(operation.id);
        operation.set_agent(Some(agent.id.clone()));
        record.controller.set_agent(&agent);
        info!(operation = %operation.id, agent = %agent.id, "Operation assigned to agent");

        let epoch = operation.controller_epoch();
        match operation.state() {
            OperationState::Reviving => {
                let transactions = record.controller_transactions.lock().clone();
                agent.enqueue_operation_event(
                    operation.id,
                    epoch,
                    SchedulerOperationEventKind::Revive {
                        controller_transactions: transactions,
                    },
                );
            }
            _ => {
                agent.enqueue_operation_event(
                    operation.id,
                    epoch,
                    SchedulerOperationEventKind::Start {
                        operation_type: operation.operation_type.clone(),
                        user: operation.user.clone(),
                        spec: operation.spec.clone(),
                    },
                );
            }
        }
        Ok(true)
    }

    /// Fail an operation: record the error, drain its jobs, commit the
    /// terminal result, flush the node
    async fn fail_operation(&self, record: &Arc<OperationRecord>, error: WireError) {
        self.terminate_operation(
            record,
            OperationState::Failing,
            OperationState::Failed,
            error,
        )
        .await
        .unwrap_or_else(|error| {
            warn!(operation = %record.operation.id, %error, "Failed to finalize operation");
        });
    }

    async fn terminate_operation(
        &self,
        record: &Arc<OperationRecord>,
        draining: OperationState,
        terminal: OperationState,
        error: WireError,
    ) -> SchedulerResult<()> {
        let operation = &record.operation;
        if operation.state().is_terminal() {
            return Ok(());
        }
        operation.set_result_error(error.clone());
        self.set_operation_state(operation, draining).await?;

        // Drain running jobs everywhere.
        for shard in &self.shards {
            shard.abort_operation_jobs(&self.strategy, operation.id).await;
        }
        // Tell the agent to drop the controller.
        if let Some(agent) = record.controller.agent() {
            agent.enqueue_operation_event(
                operation.id,
                operation.controller_epoch(),
                SchedulerOperationEventKind::Abort { error: error.clone() },
            );
            agent.remove_operation(operation.id);
        }
        let _ = self.strategy.unregister_operation(operation.id);
        operation.set_agent(None);
        record.controller.clear_agent();

        // Commit the terminal result and flush.
        let id = operation.id;
        operation.validate_transition(terminal)?;
        self.retry
            .run(|| {
                self.master
                    .update_operation_node(id, result_patch(terminal, Some(&error.message)))
            })
            .await?;
        operation.apply_transition(terminal, Utc::now())?;
        self.retry
            .run(|| self.master.flush_operation_node(id))
            .await?;
        info!(operation = %id, state = ?terminal, "Operation finished");
        Ok(())
    }

    /// Completion initiated by the controller: Completing -> Completed
    async fn complete_operation(&self, record: &Arc<OperationRecord>) -> SchedulerResult<()> {
        let operation = &record.operation;
        self.set_operation_state(operation, OperationState::Completing)
            .await?;
        // Anything still tracked shard-side is stale once the controller
        // declared completion.
        for shard in &self.shards {
            shard.abort_operation_jobs(&self.strategy, operation.id).await;
        }
        if let Some(agent) = record.controller.agent() {
            agent.remove_operation(operation.id);
        }
        let _ = self.strategy.unregister_operation(operation.id);
        operation.set_agent(None);
        record.controller.clear_agent();

        let id = operation.id;
        operation.validate_transition(OperationState::Completed)?;
        self.retry
            .run(|| {
                self.master
                    .update_operation_node(id, result_patch(OperationState::Completed, None))
            })
            .await?;
        operation.apply_transition(OperationState::Completed, Utc::now())?;
        self.retry
            .run(|| self.master.flush_operation_node(id))
            .await?;
        info!(operation = %id, "Operation completed");
        Ok(())
    }

    /// Revival completion: re-register the reported jobs into the node
    /// shards under the new epoch, abort the ones whose nodes are gone,
    /// then return the operation to Running.
    async fn finish_revival(
        &self,
        record: &Arc<OperationRecord>,
        jobs: Vec<RevivedJob>,
    ) -> SchedulerResult<()> {
        let operation = &record.operation;
        if jobs.is_empty() {
            // Nothing survived at the controller; go back through
            // materialization instead of pretending to run.
            self.set_operation_state(operation, OperationState::Pending)
                .await?;
            self.set_operation_state(operation, OperationState::Materializing)
                .await?;
            if let Some(agent) = record.controller.agent() {
                agent.enqueue_operation_event(
                    operation.id,
                    operation.controller_epoch(),
                    SchedulerOperationEventKind::Materialize,
                );
            }
            info!(operation = %operation.id, "Operation revived with a clean slate; rematerializing");
            return Ok(());
        }
        let shard_count = self.shards.len();
        let mut by_shard: HashMap<usize, Vec<RevivedJob>> = HashMap::new();
        for job in jobs {
            by_shard
                .entry(shard_of(job.node_id, shard_count))
                .or_default()
                .push(job);
        }

        let mut lost = Vec::new();
        for (shard_index, shard_jobs) in by_shard {
            let mut shard_lost = self.shards[shard_index]
                .register_revived_jobs(&self.strategy, operation.id, shard_jobs)
                .await;
            lost.append(&mut shard_lost);
        }
        if let Some(agent) = record.controller.agent() {
            for job in &lost {
                warn!(operation = %operation.id, job = %job.job_id,
                    "Revived job's node is gone; aborting it");
                agent.enqueue_job_event(
                    job.job_id,
                    operation.id,
                    operation.controller_epoch(),
                    SchedulerJobEventKind::Aborted {
                        reason: JobAbortReason::RevivalNodeLost,
                    },
                );
            }
        }

        let _ = self.strategy.mark_operation_running(operation.id)?;
        self.set_operation_state(operation, OperationState::Running)
            .await?;
        info!(operation = %operation.id, "Operation revived");
        Ok(())
    }

    async fn all_exec_nodes(&self) -> Vec<ExecNodeDescriptor> {
        let mut nodes = Vec::new();
        for shard in &self.shards {
            nodes.extend(shard.exec_node_descriptors().await);
        }
        nodes
    }
}

// ----------------------------------------------------------------------
// Shard host: job events route through the operation's agent
// ----------------------------------------------------------------------

impl ShardHost for Scheduler {
    fn operation_epoch(&self, id: OperationId) -> Option<ControllerEpoch> {
        self.record(id)
            .map(|record| record.operation.controller_epoch())
    }

    fn is_operation_reviving(&self, id: OperationId) -> bool {
        self.record(id)
            .map(|record| record.operation.state() == OperationState::Reviving)
            .unwrap_or(false)
    }

    fn enqueue_job_event(
        &self,
        operation_id: OperationId,
        job_id: JobId,
        kind: SchedulerJobEventKind,
    ) {
        let Some(record) = self.record(operation_id) else {
            debug!(operation = %operation_id, job = %job_id,
                "Job event for an unknown operation dropped");
            return;
        };
        let Some(agent) = record.controller.agent() else {
            debug!(operation = %operation_id, job = %job_id,
                "Job event dropped: operation has no agent");
            return;
        };
        agent.enqueue_job_event(
            job_id,
            operation_id,
            record.operation.controller_epoch(),
            kind,
        );
    }
}

// ----------------------------------------------------------------------
// Agent host: operation events drive the lifecycle state machine
// ----------------------------------------------------------------------

#[async_trait]
impl AgentHost for Scheduler {
    async fn on_agent_operation_event(
        &self,
        agent: &Arc<ControllerAgent>,
        event: AgentOperationEvent,
    ) {
        let Some(record) = self.record(event.operation_id) else {
            debug!(operation = %event.operation_id, "Operation event for unknown operation");
            return;
        };
        let operation = record.operation.clone();
        if event.controller_epoch != operation.controller_epoch() {
            debug!(
                operation = %operation.id,
                event_epoch = %event.controller_epoch,
                current_epoch = %operation.controller_epoch(),
                "Operation event with stale controller epoch ignored"
            );
            return;
        }

        let outcome: SchedulerResult<()> = match event.kind {
            AgentOperationEventKind::Initialized { result } => match result {
                Ok(()) => {
                    let step = self
                        .set_operation_state(&operation, OperationState::Preparing)
                        .await;
                    if step.is_ok() {
                        agent.enqueue_operation_event(
                            operation.id,
                            operation.controller_epoch(),
                            SchedulerOperationEventKind::Prepare,
                        );
                    }
                    step
                }
                Err(error) => {
                    self.fail_operation(&record, error).await;
                    Ok(())
                }
            },
            AgentOperationEventKind::Prepared { result } => match result {
                Ok(()) => {
                    let step = self
                        .set_operation_state(&operation, OperationState::Pending)
                        .await;
                    let step = match step {
                        Ok(()) => {
                            self.set_operation_state(&operation, OperationState::Materializing)
                                .await
                        }
                        err => err,
                    };
                    if step.is_ok() {
                        agent.enqueue_operation_event(
                            operation.id,
                            operation.controller_epoch(),
                            SchedulerOperationEventKind::Materialize,
                        );
                    }
                    step
                }
                Err(error) => {
                    self.fail_operation(&record, error).await;
                    Ok(())
                }
            },
            AgentOperationEventKind::Materialized { result } => match result {
                Ok(()) => {
                    match self.strategy.mark_operation_running(operation.id) {
                        Ok(true) => {
                            self.set_operation_state(&operation, OperationState::Running)
                                .await
                        }
                        // Queued for a running slot; the update pass will
                        // activate it.
                        Ok(false) => Ok(()),
                        Err(error) => Err(error.into()),
                    }
                }
                Err(error) => {
                    self.fail_operation(&record, error).await;
                    Ok(())
                }
            },
            AgentOperationEventKind::Revived { result } => match result {
                Ok(jobs) => self.finish_revival(&record, jobs).await,
                Err(error) => {
                    self.fail_operation(&record, error).await;
                    Ok(())
                }
            },
            AgentOperationEventKind::Committed { result } => match result {
                Ok(()) => Ok(()),
                Err(error) => {
                    self.fail_operation(&record, error).await;
                    Ok(())
                }
            },
            AgentOperationEventKind::Completed => self.complete_operation(&record).await,
            AgentOperationEventKind::Suspended { error } => {
                operation.set_suspended(true);
                operation.set_alert("suspended", error);
                Ok(())
            }
            AgentOperationEventKind::Aborted { error } => {
                self.terminate_operation(
                    &record,
                    OperationState::Aborting,
                    OperationState::Aborted,
                    error,
                )
                .await
            }
            AgentOperationEventKind::Failed { error } => {
                self.fail_operation(&record, error).await;
                Ok(())
            }
            AgentOperationEventKind::BannedInTentativeTree { tree_id, job_ids } => {
                let result = self
                    .strategy
                    .ban_operation_in_tentative_tree(operation.id, &tree_id)
                    .map_err(SchedulerError::from);
                for shard in &self.shards {
                    shard.abort_jobs(&self.strategy, &job_ids).await;
                }
                result
            }
        };
        if let Err(error) = outcome {
            warn!(operation = %operation.id, %error, "Operation event handling failed");
        }
    }

    async fn on_agent_job_event(&self, agent: &Arc<ControllerAgent>, event: AgentJobEvent) {
        let Some(record) = self.record(event.operation_id) else {
            return;
        };
        if event.controller_epoch != record.operation.controller_epoch() {
            debug!(
                job = %event.job_id,
                "Job event with stale controller epoch ignored"
            );
            return;
        }
        // Controller-requested job actions are routed to the owning node
        // through the shards.
        match event.kind {
            AgentJobEventKind::Interrupt => {
                // Graceful: the node winds the job down and reports the
                // terminal state on a later heartbeat.
                for shard in &self.shards {
                    shard.interrupt_jobs(&[event.job_id]).await;
                }
            }
            AgentJobEventKind::Abort { .. } | AgentJobEventKind::Fail { .. } => {
                for shard in &self.shards {
                    shard.abort_jobs(&self.strategy, &[event.job_id]).await;
                }
                agent.enqueue_job_event(
                    event.job_id,
                    event.operation_id,
                    record.operation.controller_epoch(),
                    SchedulerJobEventKind::Aborted {
                        reason: JobAbortReason::Scheduler,
                    },
                );
            }
            AgentJobEventKind::Release => {
                // Nothing scheduler-side survives a release; the job is
                // already out of the shard maps.
            }
        }
    }

    fn is_operation_known(&self, id: OperationId) -> bool {
        self.record(id)
            .map(|record| !record.operation.state().is_terminal())
            .unwrap_or(false)
    }

    fn operations_for_agent(&self, agent: &AgentId) -> Vec<OperationId> {
        self.operations
            .iter()
            .filter(|entry| entry.operation.agent().as_ref() == Some(agent))
            .map(|entry| entry.operation.id)
            .collect()
    }

    fn update_operation_demand(&self, id: OperationId, demand: OperationDemand) {
        if let Some(record) = self.record(id) {
            if record.operation.is_suspended() {
                record.controller.set_demand(OperationDemand::default());
            } else {
                record.controller.set_demand(demand);
            }
        }
    }

    fn set_operation_alert(&self, id: OperationId, key: &str, error: Option<WireError>) {
        if let Some(record) = self.record(id) {
            match error {
                Some(error) => record.operation.set_alert(key, error),
                None => record.operation.reset_alert(key),
            }
        }
    }

    fn set_operation_suspicious_jobs(&self, id: OperationId, jobs: serde_json::Value) {
        if let Some(record) = self.record(id) {
            *record.suspicious_jobs.lock() = Some(jobs);
        }
    }

    async fn exec_node_descriptors(&self) -> Vec<ExecNodeDescriptor> {
        self.all_exec_nodes().await
    }

    async fn on_agent_unregistered(&self, agent: Arc<ControllerAgent>) {
        for operation_id in agent.operations() {
            let Some(record) = self.record(operation_id) else {
                continue;
            };
            let operation = record.operation.clone();
            operation.set_agent(None);
            record.controller.clear_agent();

            let outcome = match operation.state() {
                state if state.is_terminal() => Ok(()),
                // Draining operations just finalize; there is no
                // controller left to drain through.
                OperationState::Failing => {
                    self.finalize_draining(&record, OperationState::Failed).await
                }
                OperationState::Aborting => {
                    self.finalize_draining(&record, OperationState::Aborted).await
                }
                _ => {
                    info!(operation = %operation_id, agent = %agent.id,
                        "Agent lost; operation moves to revival");
                    match self
                        .set_operation_state(&operation, OperationState::Reviving)
                        .await
                    {
                        Ok(()) => self.try_assign_agent(&record).await.map(|_| ()),
                        Err(error) => Err(error),
                    }
                }
            };
            if let Err(error) = outcome {
                warn!(operation = %operation_id, %error, "Agent-loss handling failed");
            }
        }
    }
}

impl Scheduler {
    async fn finalize_draining(
        &self,
        record: &Arc<OperationRecord>,
        terminal: OperationState,
    ) -> SchedulerResult<()> {
        let operation = &record.operation;
        let message = operation
            .result_error()
            .map(|error| error.message)
            .unwrap_or_else(|| "operation terminated".to_string());
        let id = operation.id;
        operation.validate_transition(terminal)?;
        self.retry
            .run(|| {
                self.master
                    .update_operation_node(id, result_patch(terminal, Some(&message)))
            })
            .await?;
        operation.apply_transition(terminal, Utc::now())?;
        self.retry
            .run(|| self.master.flush_operation_node(id))
            .await?;
        Ok(())
    }

    /// Start the background loops; the handles live as long as the host
    /// keeps them
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let config = self.config();

        let scheduler = self.clone();
        let period = config.strategy.fair_share_update_period();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                scheduler.tick_fair_share_update().await;
                scheduler.tick_assign_agents().await;
            }
        }));

        let scheduler = self.clone();
        let period = config.agent_heartbeat_timeout() / 2;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(std::time::Duration::from_millis(100)));
            loop {
                interval.tick().await;
                scheduler.tick_check_agent_leases().await;
                scheduler.tick_sweep_offline_nodes().await;
            }
        }));

        let scheduler = self.clone();
        let period = config.snapshot_period();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                scheduler.tick_load_cluster_snapshot().await;
            }
        }));

        handles
    }

    /// Start a transaction with the configured retry policy; the ping loop
    /// is the caller's to run
    pub async fn start_transaction(
        &self,
        transaction_type: TransactionType,
    ) -> SchedulerResult<TransactionId> {
        self.retry
            .run(|| self.master.start_transaction(transaction_type))
            .await
    }
}
