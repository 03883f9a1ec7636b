//! Controller agent tracker
//!
//! Processes agent handshakes and heartbeats, owns the agent directory and
//! leases, and picks agents for new operations. Everything that needs the
//! rest of the scheduler (operation lifecycle, shards, master) goes
//! through the [`AgentHost`] callback surface, so the tracker itself stays
//! pure agent state.

use crate::agent::{AgentState, ControllerAgent};
use crate::config::{AgentPickStrategy, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use atoll_core::{AgentId, ExecNodeDescriptor, IncarnationId, OperationId};
use atoll_fairshare::OperationDemand;
use atoll_proto::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, AgentJobEvent, AgentOperationEvent,
    HandshakeRequest, HandshakeResponse, JobAbortReason, SchedulerJobEventKind, WireError,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the tracker needs from the rest of the scheduler
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// An operation lifecycle event arrived from the agent; stale epochs
    /// are the host's to drop
    async fn on_agent_operation_event(
        &self,
        agent: &Arc<ControllerAgent>,
        event: AgentOperationEvent,
    );

    /// A job event arrived from the agent
    async fn on_agent_job_event(&self, agent: &Arc<ControllerAgent>, event: AgentJobEvent);

    fn is_operation_known(&self, id: OperationId) -> bool;

    /// Operations the scheduler believes this agent owns
    fn operations_for_agent(&self, agent: &AgentId) -> Vec<OperationId>;

    fn update_operation_demand(&self, id: OperationId, demand: OperationDemand);

    fn set_operation_alert(&self, id: OperationId, key: &str, error: Option<WireError>);

    fn set_operation_suspicious_jobs(&self, id: OperationId, jobs: serde_json::Value);

    /// Cached exec-node descriptors, for agents that requested them
    async fn exec_node_descriptors(&self) -> Vec<ExecNodeDescriptor>;

    /// The agent is gone; its operations must move to revival
    async fn on_agent_unregistered(&self, agent: Arc<ControllerAgent>);
}

/// The agent directory and its protocols
pub struct ControllerAgentTracker {
    scheduler_incarnation: IncarnationId,
    agents: DashMap<AgentId, Arc<ControllerAgent>>,
}

impl ControllerAgentTracker {
    pub fn new(scheduler_incarnation: IncarnationId) -> Self {
        Self {
            scheduler_incarnation,
            agents: DashMap::new(),
        }
    }

    pub fn agent(&self, id: &AgentId) -> Option<Arc<ControllerAgent>> {
        self.agents.get(id).map(|entry| entry.clone())
    }

    pub fn agents(&self) -> Vec<Arc<ControllerAgent>> {
        self.agents.iter().map(|entry| entry.clone()).collect()
    }

    /// Register an agent incarnation. An existing agent under the same id
    /// is displaced: its incarnation is terminated first.
    pub async fn process_handshake(
        &self,
        host: &dyn AgentHost,
        config: &SchedulerConfig,
        request: HandshakeRequest,
        now: DateTime<Utc>,
    ) -> SchedulerResult<HandshakeResponse> {
        if let Some((_, existing)) = self.agents.remove(&request.agent_id) {
            info!(
                agent = %request.agent_id,
                incarnation = %existing.incarnation,
                "Displacing previous agent incarnation on handshake"
            );
            self.terminate_agent(host, existing).await;
        }

        let incarnation = IncarnationId::new();
        let lease_deadline =
            now + ChronoDuration::milliseconds(config.agent_heartbeat_timeout_ms as i64);
        let agent = Arc::new(ControllerAgent::new(
            request.agent_id.clone(),
            incarnation,
            request.tags,
            request.addresses,
            lease_deadline,
        ));
        self.agents.insert(request.agent_id.clone(), agent);

        // Operations the scheduler believes this agent owns; the agent
        // abandons anything it knows that is missing here.
        let known_operations = host.operations_for_agent(&request.agent_id);
        info!(
            agent = %request.agent_id,
            incarnation = %incarnation,
            known_operations = known_operations.len(),
            "Agent handshake accepted"
        );
        Ok(HandshakeResponse {
            incarnation_id: incarnation,
            scheduler_incarnation_id: self.scheduler_incarnation,
            known_operations,
            config: serde_json::to_value(config).unwrap_or_default(),
        })
    }

    /// One agent heartbeat: renew the lease, drain the agent -> scheduler
    /// streams, trim the outboxes, and build the mirror-image reply.
    pub async fn process_heartbeat(
        &self,
        host: &dyn AgentHost,
        config: &SchedulerConfig,
        request: AgentHeartbeatRequest,
        now: DateTime<Utc>,
    ) -> SchedulerResult<AgentHeartbeatResponse> {
        let agent = self
            .agent(&request.agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(request.agent_id.clone()))?;
        if agent.state() == AgentState::Unregistering {
            return Err(SchedulerError::AgentNotRegistered {
                agent: agent.id.clone(),
                state: format!("{:?}", agent.state()),
            });
        }
        if request.incarnation_id != agent.incarnation {
            return Err(SchedulerError::StaleIncarnation {
                expected: agent.incarnation,
                got: request.incarnation_id,
            });
        }
        if agent.state() == AgentState::WaitingForInitialHeartbeat {
            info!(agent = %agent.id, "Agent registration confirmed by heartbeat");
            agent.set_state(AgentState::Registered);
        }
        agent.renew_lease(
            now + ChronoDuration::milliseconds(config.agent_heartbeat_timeout_ms as i64),
        );

        // Per-operation piggyback: demand, alerts, suspicious jobs.
        let mut operations_to_unregister = Vec::new();
        for info in request.operations {
            if !host.is_operation_known(info.operation_id) {
                debug!(
                    agent = %agent.id,
                    operation = %info.operation_id,
                    "Unknown operation is running at agent; unregister requested"
                );
                operations_to_unregister.push(info.operation_id);
                continue;
            }
            host.update_operation_demand(
                info.operation_id,
                OperationDemand {
                    resource_demand: info.needed_resources,
                    pending_job_count: info.pending_job_count,
                },
            );
            for (key, error) in info.alerts {
                host.set_operation_alert(info.operation_id, &key, error);
            }
            if let Some(jobs) = info.suspicious_jobs {
                host.set_operation_suspicious_jobs(info.operation_id, jobs);
            }
        }
        if let Some(memory) = request.controller_memory {
            agent.set_memory_statistics(memory);
        }

        // Drain the incoming streams, exactly once each. Schedule-job
        // responses go first: a node shard may be blocked mid-heartbeat
        // waiting on one, and the job-event handlers below need that shard's
        // lock.
        let mut responses = Vec::new();
        agent
            .schedule_job_responses_inbox
            .handle_incoming(request.schedule_job_responses, |response| {
                responses.push(response)
            });
        for response in responses {
            let job_id = response.job_id;
            let operation_id = response.operation_id;
            let controller_epoch = response.controller_epoch;
            if let Some(_spec) = agent.complete_schedule_response(job_id, response.result) {
                // The scheduling walk gave up waiting; the controller must
                // take the job back.
                debug!(job = %job_id, "Late schedule-job response; aborting the job");
                agent.enqueue_job_event(
                    job_id,
                    operation_id,
                    controller_epoch,
                    SchedulerJobEventKind::Aborted {
                        reason: JobAbortReason::Scheduler,
                    },
                );
            }
        }

        let mut job_events: Vec<AgentJobEvent> = Vec::new();
        agent
            .job_events_inbox
            .handle_incoming(request.job_events, |event| job_events.push(event));
        for event in job_events {
            host.on_agent_job_event(&agent, event).await;
        }

        let mut operation_events: Vec<AgentOperationEvent> = Vec::new();
        agent
            .operation_events_inbox
            .handle_incoming(request.operation_events, |event| {
                operation_events.push(event)
            });
        for event in operation_events {
            host.on_agent_operation_event(&agent, event).await;
        }

        // Trim the outgoing streams up to the agent's acks, then resend
        // everything still unacknowledged.
        agent
            .operation_events_outbox
            .handle_status(request.scheduler_operation_events_ack);
        agent
            .job_events_outbox
            .handle_status(request.scheduler_job_events_ack);
        agent
            .schedule_job_requests_outbox
            .handle_status(request.schedule_job_requests_ack);

        let exec_nodes = if request.exec_nodes_requested {
            Some(host.exec_node_descriptors().await)
        } else {
            None
        };

        Ok(AgentHeartbeatResponse {
            operation_events_ack: agent.operation_events_inbox.report_status(),
            job_events_ack: agent.job_events_inbox.report_status(),
            schedule_job_responses_ack: agent.schedule_job_responses_inbox.report_status(),
            scheduler_operation_events: agent.operation_events_outbox.build_outgoing(),
            scheduler_job_events: agent.job_events_outbox.build_outgoing(),
            schedule_job_requests: agent.schedule_job_requests_outbox.build_outgoing(),
            operations_to_unregister,
            exec_nodes,
        })
    }

    /// Pick an agent for an operation restricted to `controller_agent_tag`
    pub fn pick_agent_for_operation(
        &self,
        config: &SchedulerConfig,
        controller_agent_tag: &str,
    ) -> Option<Arc<ControllerAgent>> {
        let eligible: Vec<Arc<ControllerAgent>> = self
            .agents()
            .into_iter()
            .filter(|agent| agent.state() == AgentState::Registered)
            .filter(|agent| agent.tags.contains(controller_agent_tag))
            .collect();

        let memory_ok = |agent: &Arc<ControllerAgent>| match agent.memory_statistics() {
            Some(statistics) => {
                let floor = config.min_agent_available_memory.max(
                    (config.min_agent_available_memory_fraction * statistics.limit as f64) as i64,
                );
                statistics.usage + floor < statistics.limit
            }
            None => true,
        };

        match config.agent_pick_strategy {
            AgentPickStrategy::Random => {
                let candidates: Vec<_> = eligible.into_iter().filter(memory_ok).collect();
                if candidates.is_empty() {
                    None
                } else {
                    Some(candidates[fastrand::usize(..candidates.len())].clone())
                }
            }
            AgentPickStrategy::MemoryUsageBalanced => {
                let mut picked = None;
                let mut score_sum = 0.0;
                for agent in eligible {
                    let Some(statistics) = agent.memory_statistics() else {
                        warn!(
                            agent = %agent.id,
                            "Agent skipped: no memory statistics under the memory-balanced pick strategy"
                        );
                        continue;
                    };
                    if !memory_ok(&agent) {
                        continue;
                    }
                    let raw_score = statistics.free() as f64 / statistics.limit.max(1) as f64;
                    let score =
                        raw_score.powf(config.memory_balanced_pick_strategy_score_power);
                    score_sum += score;
                    if fastrand::f64() <= score / score_sum {
                        picked = Some(agent);
                    }
                }
                picked
            }
        }
    }

    /// Drop agents whose lease expired
    pub async fn check_leases(&self, host: &dyn AgentHost, now: DateTime<Utc>) {
        let expired: Vec<Arc<ControllerAgent>> = self
            .agents()
            .into_iter()
            .filter(|agent| agent.lease_expired(now))
            .collect();
        for agent in expired {
            warn!(agent = %agent.id, incarnation = %agent.incarnation, "Agent lease expired");
            self.unregister_agent(host, &agent.id).await;
        }
    }

    /// Remove an agent and hand its operations back to the host
    pub async fn unregister_agent(&self, host: &dyn AgentHost, id: &AgentId) {
        if let Some((_, agent)) = self.agents.remove(id) {
            self.terminate_agent(host, agent).await;
        }
    }

    async fn terminate_agent(&self, host: &dyn AgentHost, agent: Arc<ControllerAgent>) {
        agent.set_state(AgentState::Unregistering);
        agent.cancel.cancel();
        agent.fail_pending_schedule_responses();
        info!(agent = %agent.id, incarnation = %agent.incarnation, "Agent unregistered");
        host.on_agent_unregistered(agent).await;
    }
}
