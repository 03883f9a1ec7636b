//! Node shards
//!
//! Nodes are partitioned across shards by `node_id % shard_count`. Each
//! shard's state sits behind a single async mutex held for the whole of a
//! heartbeat, so one heartbeat's mutations commit atomically before the
//! reply and no two heartbeats of one shard interleave. Shards never touch
//! each other's maps.

use crate::error::SchedulerResult;
use atoll_core::{ControllerEpoch, ExecNodeDescriptor, JobId, JobResources, NodeId, OperationId};
use atoll_fairshare::{FairShareStrategy, NodeSchedulingContext, RunningJob};
use atoll_proto::{
    JobAbortReason, JobInterruptCommand, JobStartCommand, NodeHeartbeatRequest,
    NodeHeartbeatResponse, PreemptionMode, ReportedJobState, RevivedJob, SchedulerJobEventKind,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What the shard needs from the rest of the scheduler
pub trait ShardHost: Send + Sync {
    /// Current controller epoch of the operation; `None` for unknown
    /// operations
    fn operation_epoch(&self, id: OperationId) -> Option<ControllerEpoch>;

    /// True while the operation is being revived; its jobs reported by
    /// nodes are held instead of aborted until revival re-registers them
    fn is_operation_reviving(&self, id: OperationId) -> bool;

    /// Route a job event to the operation's agent outbox, stamped with the
    /// current epoch; silently dropped when the operation has no agent
    fn enqueue_job_event(&self, operation_id: OperationId, job_id: JobId, kind: SchedulerJobEventKind);
}

/// A running job as the shard owns it
#[derive(Debug, Clone)]
pub struct ShardJob {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub node_id: NodeId,
    pub tree_id: String,
    pub resources: JobResources,
    pub start_time: DateTime<Utc>,
    pub preemption_mode: PreemptionMode,
}

#[derive(Debug)]
struct NodeEntry {
    descriptor: ExecNodeDescriptor,
    last_heartbeat: DateTime<Utc>,
    jobs: HashSet<JobId>,
    /// Abort commands queued for the node's next heartbeat
    pending_aborts: Vec<JobId>,
    /// Graceful interrupt commands queued for the node's next heartbeat
    pending_interrupts: Vec<JobId>,
}

#[derive(Debug, Default)]
struct ShardState {
    nodes: HashMap<NodeId, NodeEntry>,
    jobs: HashMap<JobId, ShardJob>,
}

/// Counters exposed for the orchid tree
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShardCounters {
    pub node_count: usize,
    pub active_job_count: usize,
    pub scheduled_job_count: u64,
    pub preempted_job_count: u64,
    pub aborted_job_count: u64,
    pub heartbeat_count: u64,
}

/// One shard of the node fleet
pub struct NodeShard {
    id: usize,
    state: Mutex<ShardState>,
    scheduled_jobs: AtomicU64,
    preempted_jobs: AtomicU64,
    aborted_jobs: AtomicU64,
    heartbeats: AtomicU64,
}

impl NodeShard {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(ShardState::default()),
            scheduled_jobs: AtomicU64::new(0),
            preempted_jobs: AtomicU64::new(0),
            aborted_jobs: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process one node heartbeat end to end: refresh the node, reconcile
    /// its reported jobs, run the scheduling passes, and build the reply.
    pub async fn process_heartbeat(
        &self,
        host: &dyn ShardHost,
        strategy: &FairShareStrategy,
        request: NodeHeartbeatRequest,
        now: DateTime<Utc>,
    ) -> SchedulerResult<NodeHeartbeatResponse> {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;

        let descriptor = ExecNodeDescriptor {
            id: request.node_id,
            address: request.address.clone(),
            io_weight: request.io_weight,
            online: true,
            resource_usage: request.resource_usage,
            resource_limits: request.resource_limits,
            disk_limits: request.disk_limits.clone(),
            disk_usage: request.disk_usage.clone(),
            tags: request.tags.clone(),
        };

        // The tree is resolved before any mutation so a node no tree wants
        // is refused outright.
        let tree = strategy.matching_tree(&request.tags)?;

        let is_new = !state.nodes.contains_key(&request.node_id);
        let entry = state
            .nodes
            .entry(request.node_id)
            .or_insert_with(|| NodeEntry {
                descriptor: descriptor.clone(),
                last_heartbeat: now,
                jobs: HashSet::new(),
                pending_aborts: Vec::new(),
                pending_interrupts: Vec::new(),
            });
        if is_new {
            info!(node = %request.node_id, address = %request.address, "Node registered");
        }
        entry.descriptor = descriptor.clone();
        entry.last_heartbeat = now;

        let mut response = NodeHeartbeatResponse {
            jobs_to_abort: entry.pending_aborts.drain(..).collect(),
            jobs_to_interrupt: entry
                .pending_interrupts
                .drain(..)
                .map(|job_id| JobInterruptCommand { job_id })
                .collect(),
            ..NodeHeartbeatResponse::default()
        };

        // Reconcile the node's reported job-state deltas.
        for status in &request.job_states {
            if !state.jobs.contains_key(&status.job_id) {
                if status.state == ReportedJobState::Running
                    && host.is_operation_reviving(status.operation_id)
                {
                    // The job predates a restart; revival will re-register
                    // it. Aborting here would lose work.
                    debug!(
                        node = %request.node_id,
                        job = %status.job_id,
                        "Unknown job of a reviving operation; holding it"
                    );
                    continue;
                }
                debug!(
                    node = %request.node_id,
                    job = %status.job_id,
                    "Node reported an unknown job; requesting abort"
                );
                response.jobs_to_abort.push(status.job_id);
                continue;
            }
            match status.state {
                ReportedJobState::Running => {
                    if let Some(job) = state.jobs.get_mut(&status.job_id) {
                        job.resources = status.resource_usage;
                        let _ = strategy.on_job_usage_updated(
                            &job.tree_id,
                            job.operation_id,
                            job.job_id,
                            status.resource_usage,
                        );
                        host.enqueue_job_event(
                            job.operation_id,
                            job.job_id,
                            SchedulerJobEventKind::Running {
                                resource_usage: status.resource_usage,
                            },
                        );
                    }
                }
                ReportedJobState::Completed
                | ReportedJobState::Failed
                | ReportedJobState::Aborted => {
                    let Some(job) = state.jobs.remove(&status.job_id) else {
                        continue;
                    };
                    if let Some(entry) = state.nodes.get_mut(&request.node_id) {
                        entry.jobs.remove(&status.job_id);
                    }
                    let _ =
                        strategy.on_job_finished(&job.tree_id, job.operation_id, job.job_id);
                    let kind = match status.state {
                        ReportedJobState::Completed => SchedulerJobEventKind::Completed,
                        ReportedJobState::Failed => SchedulerJobEventKind::Failed {
                            error: status
                                .error
                                .clone()
                                .unwrap_or_else(|| atoll_proto::WireError::new("job failed")),
                        },
                        _ => SchedulerJobEventKind::Aborted {
                            reason: JobAbortReason::Unknown,
                        },
                    };
                    host.enqueue_job_event(job.operation_id, job.job_id, kind);
                    self.aborted_jobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Run the scheduling passes against the tree snapshot. The shard
        // lock stays held, so everything this heartbeat observes commits
        // atomically before the reply.
        let running_jobs: Vec<RunningJob> = state
            .nodes
            .get(&request.node_id)
            .map(|entry| {
                entry
                    .jobs
                    .iter()
                    .filter_map(|job_id| state.jobs.get(job_id))
                    .map(|job| RunningJob {
                        job_id: job.job_id,
                        operation_id: job.operation_id,
                        resource_usage: job.resources,
                        start_time: job.start_time,
                        preemption_mode: job.preemption_mode,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tree_config = tree.config();
        let mut ctx = NodeSchedulingContext::new(
            descriptor.clone(),
            running_jobs,
            now,
            tokio::time::Instant::now() + tree_config.schedule_jobs_timeout(),
        );
        tree.process_heartbeat(&mut ctx).await;

        // Apply preemptions.
        for preempted in &ctx.preempted_jobs {
            let Some(job) = state.jobs.remove(&preempted.job_id) else {
                continue;
            };
            if let Some(entry) = state.nodes.get_mut(&request.node_id) {
                entry.jobs.remove(&preempted.job_id);
            }
            let _ = strategy.on_job_finished(&job.tree_id, job.operation_id, job.job_id);
            host.enqueue_job_event(
                job.operation_id,
                job.job_id,
                SchedulerJobEventKind::Aborted {
                    reason: JobAbortReason::Preempted {
                        preempted_for: None,
                        reason: preempted.reason.clone(),
                    },
                },
            );
            response.jobs_to_abort.push(job.job_id);
            self.preempted_jobs.fetch_add(1, Ordering::Relaxed);
        }

        // Apply starts.
        for started in &ctx.started_jobs {
            let resources = started.spec.resources.resources;
            state.jobs.insert(
                started.job_id,
                ShardJob {
                    job_id: started.job_id,
                    operation_id: started.operation_id,
                    node_id: request.node_id,
                    tree_id: tree.id().to_string(),
                    resources,
                    start_time: now,
                    preemption_mode: started.spec.preemption_mode,
                },
            );
            if let Some(entry) = state.nodes.get_mut(&request.node_id) {
                entry.jobs.insert(started.job_id);
            }
            let _ = strategy.on_job_started(
                tree.id(),
                started.operation_id,
                started.job_id,
                resources,
            );
            host.enqueue_job_event(
                started.operation_id,
                started.job_id,
                SchedulerJobEventKind::Started {
                    node_id: request.node_id,
                    resources,
                    start_time: now,
                },
            );
            response.jobs_to_start.push(JobStartCommand {
                job_id: started.job_id,
                operation_id: started.operation_id,
                resources,
            });
            self.scheduled_jobs.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(entry) = state.nodes.get_mut(&request.node_id) {
            entry.descriptor.resource_usage = ctx.resource_usage;
        }
        metrics::counter!("atoll_node_heartbeats_total").increment(1);
        Ok(response)
    }

    /// Mark nodes silent past `offline_timeout` offline and abort their
    /// jobs as lost. Returns the ids of aborted jobs.
    pub async fn sweep_offline_nodes(
        &self,
        host: &dyn ShardHost,
        strategy: &FairShareStrategy,
        now: DateTime<Utc>,
        offline_timeout: std::time::Duration,
    ) -> Vec<JobId> {
        let mut state = self.state.lock().await;
        let timeout = ChronoDuration::from_std(offline_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let lost_nodes: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, entry)| entry.descriptor.online && entry.last_heartbeat + timeout < now)
            .map(|(&id, _)| id)
            .collect();

        let mut aborted = Vec::new();
        for node_id in lost_nodes {
            warn!(node = %node_id, "Node went offline; aborting its jobs as lost");
            let job_ids: Vec<JobId> = {
                let entry = match state.nodes.get_mut(&node_id) {
                    Some(entry) => entry,
                    None => continue,
                };
                entry.descriptor.online = false;
                entry.jobs.drain().collect()
            };
            for job_id in job_ids {
                let Some(job) = state.jobs.remove(&job_id) else {
                    continue;
                };
                let _ = strategy.on_job_finished(&job.tree_id, job.operation_id, job.job_id);
                host.enqueue_job_event(
                    job.operation_id,
                    job.job_id,
                    SchedulerJobEventKind::Aborted {
                        reason: JobAbortReason::NodeLost,
                    },
                );
                self.aborted_jobs.fetch_add(1, Ordering::Relaxed);
                aborted.push(job_id);
            }
        }
        aborted
    }

    /// Re-register the jobs of a revived operation under its new epoch.
    /// Jobs whose node is gone are returned for the caller to abort at the
    /// controller.
    pub async fn register_revived_jobs(
        &self,
        strategy: &FairShareStrategy,
        operation_id: OperationId,
        jobs: Vec<RevivedJob>,
    ) -> Vec<RevivedJob> {
        let mut state = self.state.lock().await;
        let mut lost = Vec::new();
        for revived in jobs {
            let tree_id = match state.nodes.get(&revived.node_id) {
                Some(entry) if entry.descriptor.online => {
                    match strategy.matching_tree(&entry.descriptor.tags) {
                        Ok(tree) => tree.id().to_string(),
                        Err(_) => {
                            lost.push(revived);
                            continue;
                        }
                    }
                }
                _ => {
                    lost.push(revived);
                    continue;
                }
            };
            let _ = strategy.on_job_started(
                &tree_id,
                operation_id,
                revived.job_id,
                revived.resource_usage,
            );
            state.jobs.insert(
                revived.job_id,
                ShardJob {
                    job_id: revived.job_id,
                    operation_id,
                    node_id: revived.node_id,
                    tree_id,
                    resources: revived.resource_usage,
                    start_time: revived.start_time,
                    preemption_mode: PreemptionMode::Normal,
                },
            );
            if let Some(entry) = state.nodes.get_mut(&revived.node_id) {
                entry.jobs.insert(revived.job_id);
            }
        }
        lost
    }

    /// Remove every job of an operation, queueing abort commands for the
    /// owning nodes' next heartbeats
    pub async fn abort_operation_jobs(
        &self,
        strategy: &FairShareStrategy,
        operation_id: OperationId,
    ) -> usize {
        let mut state = self.state.lock().await;
        let job_ids: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.operation_id == operation_id)
            .map(|job| job.job_id)
            .collect();
        let count = job_ids.len();
        for job_id in job_ids {
            let Some(job) = state.jobs.remove(&job_id) else {
                continue;
            };
            let _ = strategy.on_job_finished(&job.tree_id, job.operation_id, job.job_id);
            if let Some(entry) = state.nodes.get_mut(&job.node_id) {
                entry.jobs.remove(&job_id);
                entry.pending_aborts.push(job_id);
            }
            self.aborted_jobs.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Queue graceful interrupt commands for jobs still tracked here; the
    /// jobs stay registered until their node reports a terminal state
    pub async fn interrupt_jobs(&self, job_ids: &[JobId]) -> usize {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for &job_id in job_ids {
            let Some(node_id) = state.jobs.get(&job_id).map(|job| job.node_id) else {
                continue;
            };
            if let Some(entry) = state.nodes.get_mut(&node_id) {
                entry.pending_interrupts.push(job_id);
                count += 1;
            }
        }
        count
    }

    /// Remove specific jobs (e.g. the jobs of a banned tentative tree),
    /// queueing abort commands for their nodes
    pub async fn abort_jobs(&self, strategy: &FairShareStrategy, job_ids: &[JobId]) -> usize {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for &job_id in job_ids {
            let Some(job) = state.jobs.remove(&job_id) else {
                continue;
            };
            let _ = strategy.on_job_finished(&job.tree_id, job.operation_id, job.job_id);
            if let Some(entry) = state.nodes.get_mut(&job.node_id) {
                entry.jobs.remove(&job_id);
                entry.pending_aborts.push(job_id);
            }
            self.aborted_jobs.fetch_add(1, Ordering::Relaxed);
            count += 1;
        }
        count
    }

    /// Read-only query: which operation owns this job
    pub async fn find_operation_of_job(&self, job_id: JobId) -> Option<OperationId> {
        self.state
            .lock()
            .await
            .jobs
            .get(&job_id)
            .map(|job| job.operation_id)
    }

    /// Jobs of one operation currently tracked by this shard
    pub async fn jobs_of_operation(&self, operation_id: OperationId) -> Vec<ShardJob> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| job.operation_id == operation_id)
            .cloned()
            .collect()
    }

    /// Descriptors of this shard's nodes, for the strategy update and for
    /// agents that requested the exec-node list
    pub async fn exec_node_descriptors(&self) -> Vec<ExecNodeDescriptor> {
        self.state
            .lock()
            .await
            .nodes
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub async fn counters(&self) -> ShardCounters {
        let state = self.state.lock().await;
        ShardCounters {
            node_count: state.nodes.len(),
            active_job_count: state.jobs.len(),
            scheduled_job_count: self.scheduled_jobs.load(Ordering::Relaxed),
            preempted_job_count: self.preempted_jobs.load(Ordering::Relaxed),
            aborted_job_count: self.aborted_jobs.load(Ordering::Relaxed),
            heartbeat_count: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

/// The shard an id hashes to
pub fn shard_of(node_id: NodeId, shard_count: usize) -> usize {
    (node_id.0 as usize) % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_of_is_modulo() {
        assert_eq!(shard_of(NodeId(0), 4), 0);
        assert_eq!(shard_of(NodeId(5), 4), 1);
        assert_eq!(shard_of(NodeId(7), 1), 0);
        // A zero shard count is clamped rather than dividing by zero.
        assert_eq!(shard_of(NodeId(7), 0), 0);
    }
}
