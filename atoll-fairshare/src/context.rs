//! Per-heartbeat scheduling context
//!
//! One context lives for one node heartbeat. It carries the node's free
//! resources, the jobs already running there, and the per-element dynamic
//! attribute scratchpad the walk mutates, so a single pass does
//! O(depth x jobs-launched) work without touching the shared tree.

use atoll_core::{ExecNodeDescriptor, JobId, JobResources, OperationId};
use atoll_proto::{JobStartSpec, PreemptionMode, ScheduleJobFailReason};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A job running on the node, as reported by its heartbeat
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub resource_usage: JobResources,
    pub start_time: DateTime<Utc>,
    pub preemption_mode: PreemptionMode,
}

/// A job the pass decided to start
#[derive(Debug, Clone)]
pub struct StartedJob {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub spec: JobStartSpec,
}

/// A job the pass decided to kill
#[derive(Debug, Clone)]
pub struct PreemptedJob {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub reason: String,
}

/// Walk-local scratchpad for one element
#[derive(Debug, Clone, Default)]
pub struct DynamicAttributes {
    pub active: bool,
    pub satisfaction_ratio: f64,
    /// Usage added by jobs started during this walk
    pub usage_delta: JobResources,
    /// Usage of preemptable jobs, treated as free during the preemptive walk
    pub usage_discount: JobResources,
}

/// Statistics of one scheduling pass
#[derive(Debug, Clone, Default)]
pub struct SchedulingStatistics {
    pub non_preemptive_schedule_job_attempts: usize,
    pub preemptive_schedule_job_attempts: usize,
    pub controller_schedule_job_calls: usize,
    pub scheduled_during_preemption: usize,
    pub preemptable_job_count: usize,
    /// Controller refusals by reason
    pub schedule_job_failures: HashMap<ScheduleJobFailReason, usize>,
}

/// Everything one heartbeat's scheduling pass reads and writes
pub struct NodeSchedulingContext {
    pub node: ExecNodeDescriptor,
    pub running_jobs: Vec<RunningJob>,
    pub now: DateTime<Utc>,
    /// Whole-pass budget
    pub deadline: tokio::time::Instant,

    /// Usage on the node including jobs started by this pass
    pub resource_usage: JobResources,
    pub resource_limits: JobResources,
    /// Resources of preemptable jobs, granted back during the preemptive
    /// pass
    pub usage_discount: JobResources,

    pub started_jobs: Vec<StartedJob>,
    pub preempted_jobs: Vec<PreemptedJob>,
    /// Operations the walk deactivated this heartbeat, with the reason
    pub deactivated_operations: HashMap<OperationId, ScheduleJobFailReason>,

    pub statistics: SchedulingStatistics,

    /// Indexed by snapshot element index; resized by the preschedule walk
    pub dynamic_attributes: Vec<DynamicAttributes>,
}

impl NodeSchedulingContext {
    pub fn new(
        node: ExecNodeDescriptor,
        running_jobs: Vec<RunningJob>,
        now: DateTime<Utc>,
        deadline: tokio::time::Instant,
    ) -> Self {
        let resource_usage = node.resource_usage;
        let resource_limits = node.resource_limits;
        Self {
            node,
            running_jobs,
            now,
            deadline,
            resource_usage,
            resource_limits,
            usage_discount: JobResources::zero(),
            started_jobs: Vec::new(),
            preempted_jobs: Vec::new(),
            deactivated_operations: HashMap::new(),
            statistics: SchedulingStatistics::default(),
            dynamic_attributes: Vec::new(),
        }
    }

    /// Free resources under the current discount
    pub fn free_resources(&self) -> JobResources {
        (self.resource_limits + self.usage_discount - self.resource_usage).clamp_non_negative()
    }

    /// True if anything at all could still be placed here
    pub fn has_free_resources(&self) -> bool {
        let free = self.free_resources();
        free.cpu > 0.0 && free.memory > 0 && free.user_slots > 0
    }

    pub fn record_schedule_job_failure(&mut self, reason: ScheduleJobFailReason) {
        *self.statistics.schedule_job_failures.entry(reason).or_insert(0) += 1;
    }

    /// Reset the per-element scratchpad for a fresh walk over `element_count`
    /// elements
    pub fn reset_dynamic_attributes(&mut self, element_count: usize) {
        self.dynamic_attributes.clear();
        self.dynamic_attributes
            .resize_with(element_count, DynamicAttributes::default);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_core::NodeId;
    use std::collections::BTreeSet;

    fn node(cpu_limit: f64, cpu_usage: f64) -> ExecNodeDescriptor {
        ExecNodeDescriptor {
            id: NodeId(1),
            address: "n1:9012".to_string(),
            io_weight: 1.0,
            online: true,
            resource_usage: JobResources {
                cpu: cpu_usage,
                memory: 0,
                user_slots: 0,
                network: 0,
                gpu: 0,
            },
            resource_limits: JobResources {
                cpu: cpu_limit,
                memory: 1 << 30,
                user_slots: 10,
                network: 0,
                gpu: 0,
            },
            disk_limits: Default::default(),
            disk_usage: Default::default(),
            tags: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_free_resources_apply_discount() {
        let mut ctx = NodeSchedulingContext::new(
            node(8.0, 8.0),
            Vec::new(),
            Utc::now(),
            tokio::time::Instant::now() + std::time::Duration::from_secs(1),
        );
        assert!(!ctx.has_free_resources());

        ctx.usage_discount.cpu = 2.0;
        assert!((ctx.free_resources().cpu - 2.0).abs() < 1e-9);
        assert!(ctx.has_free_resources());
    }
}
