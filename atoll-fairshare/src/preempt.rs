//! The preemption pass
//!
//! Jobs of operations running above `fair_share * preemption_tolerance` are
//! preemptable. Their resources are granted back to the node as a discount,
//! the scheduling walk is rerun for starving operations only, and if a job
//! actually started, preemptable jobs are killed oldest-first until the
//! node's limits hold again. Jobs are also preempted to restore any
//! operation or pool whose usage exceeds its hard resource limit.

use crate::context::{NodeSchedulingContext, PreemptedJob, RunningJob};
use crate::element::RATIO_PRECISION;
use crate::schedule::{preschedule, run_schedule_loop};
use crate::tree::{SnapshotElementKind, TreeSnapshot};
use atoll_core::{JobResources, OperationId};
use atoll_proto::PreemptionMode;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub(crate) fn has_starving_operations(snapshot: &TreeSnapshot) -> bool {
    snapshot.elements.iter().any(|element| element.starving)
}

fn has_limit_violations(snapshot: &TreeSnapshot) -> bool {
    snapshot.elements.iter().any(|element| {
        element
            .resource_limits
            .map_or(false, |limits| !limits.dominates(&element.resource_usage))
    })
}

/// True when the preemptive stage has anything to do on this snapshot
pub(crate) fn needs_preemptive_pass(snapshot: &TreeSnapshot) -> bool {
    has_starving_operations(snapshot) || has_limit_violations(snapshot)
}

/// The preemptive scheduling stage for one heartbeat
pub(crate) async fn schedule_jobs_with_preemption(
    snapshot: &TreeSnapshot,
    ctx: &mut NodeSchedulingContext,
) {
    let config = &snapshot.config;
    let aggressive_mode = snapshot
        .elements
        .iter()
        .any(|element| element.aggressively_starving);

    // Analyze this node's running jobs for preemptability.
    let mut preemptable: Vec<RunningJob> = Vec::new();
    for job in &ctx.running_jobs {
        if job.preemption_mode == PreemptionMode::None {
            continue;
        }
        let Some(&op_index) = snapshot.operations.get(&job.operation_id) else {
            debug!(job = %job.job_id, operation = %job.operation_id,
                "Dangling running job during preemption analysis");
            continue;
        };
        let element = &snapshot.elements[op_index];
        if element.starving {
            continue;
        }
        let fair = element.attributes.fair_share_ratio;
        let usage = element.attributes.usage_ratio;
        let over_tolerance = usage > fair * config.preemption_tolerance + RATIO_PRECISION;
        let over_fair = aggressive_mode
            && job.preemption_mode == PreemptionMode::Aggressive
            && usage > fair + RATIO_PRECISION;
        if over_tolerance || over_fair {
            preemptable.push(job.clone());
        }
    }
    ctx.statistics.preemptable_job_count = preemptable.len();

    let started_before = ctx.started_jobs.len();
    if has_starving_operations(snapshot) && !preemptable.is_empty() {
        // Grant the preemptable resources back: to the node, and along each
        // owning operation's ancestry so starving siblings see them free.
        for job in &preemptable {
            ctx.usage_discount += job.resource_usage;
            let mut index = snapshot.operations.get(&job.operation_id).copied();
            while let Some(i) = index {
                ctx.dynamic_attributes[i].usage_discount += job.resource_usage;
                index = snapshot.elements[i].parent;
            }
        }

        preschedule(snapshot, ctx, true);
        run_schedule_loop(snapshot, ctx, true).await;

        // Reset discounts before deciding what actually dies.
        ctx.usage_discount = JobResources::zero();
        for dynamic in &mut ctx.dynamic_attributes {
            dynamic.usage_discount = JobResources::zero();
        }
    }
    ctx.statistics.scheduled_during_preemption = ctx.started_jobs.len() - started_before;

    let beneficiary = ctx.started_jobs.get(started_before).cloned();

    // Kill oldest-first until the node's limits hold again.
    preemptable.sort_by_key(|job| job.start_time);
    let mut killed: HashSet<_> = HashSet::new();
    let mut position = 0;
    while position < preemptable.len() {
        if ctx.resource_limits.dominates(&ctx.resource_usage) {
            break;
        }
        let job = &preemptable[position];
        position += 1;
        if let Some(started) = &beneficiary {
            // A job never makes room for another job of its own operation.
            if started.operation_id == job.operation_id {
                continue;
            }
        }
        let reason = match &beneficiary {
            Some(started) => format!(
                "Preempted to start job {} of operation {}",
                started.job_id, started.operation_id
            ),
            None => "Node resource limits violated".to_string(),
        };
        kill(ctx, &mut killed, job, reason);
    }

    // Enforce hard resource limits of operations and pools, reduced by what
    // this pass already killed.
    let mut preempted_usage: HashMap<OperationId, JobResources> = HashMap::new();
    for job in preemptable.iter().filter(|job| killed.contains(&job.job_id)) {
        *preempted_usage
            .entry(job.operation_id)
            .or_insert_with(JobResources::zero) += job.resource_usage;
    }
    for job in &preemptable {
        if killed.contains(&job.job_id) {
            continue;
        }
        let Some(&op_index) = snapshot.operations.get(&job.operation_id) else {
            continue;
        };
        let mut violated: Option<String> = None;
        let mut index = Some(op_index);
        while let Some(i) = index {
            if let Some(limits) = &snapshot.elements[i].resource_limits {
                let removed = preempted_usage
                    .get(&job.operation_id)
                    .copied()
                    .unwrap_or_else(JobResources::zero);
                let usage = (snapshot.elements[i].resource_usage - removed).clamp_non_negative();
                if !limits.dominates(&usage) {
                    violated = Some(match &snapshot.elements[i].kind {
                        SnapshotElementKind::Operation { operation_id, .. } => format!(
                            "Preempted due to violation of resource limits of operation {operation_id}"
                        ),
                        SnapshotElementKind::Pool { name } => {
                            format!("Preempted due to violation of limits on pool {name}")
                        }
                        SnapshotElementKind::Root => {
                            "Preempted due to violation of tree resource limits".to_string()
                        }
                    });
                    break;
                }
            }
            index = snapshot.elements[i].parent;
        }
        if let Some(reason) = violated {
            *preempted_usage
                .entry(job.operation_id)
                .or_insert_with(JobResources::zero) += job.resource_usage;
            kill(ctx, &mut killed, job, reason);
        }
    }
}

fn kill(
    ctx: &mut NodeSchedulingContext,
    killed: &mut HashSet<atoll_core::JobId>,
    job: &RunningJob,
    reason: String,
) {
    if !killed.insert(job.job_id) {
        return;
    }
    ctx.resource_usage = (ctx.resource_usage - job.resource_usage).clamp_non_negative();
    metrics::counter!("atoll_preempted_jobs_total").increment(1);
    ctx.preempted_jobs.push(PreemptedJob {
        job_id: job.job_id,
        operation_id: job.operation_id,
        reason,
    });
}
