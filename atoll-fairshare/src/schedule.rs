//! The job-scheduling pass
//!
//! Runs on every node heartbeat against the current tree snapshot. The
//! preschedule walk marks active elements and seeds their satisfaction; the
//! schedule loop then repeatedly descends to the least satisfied active
//! leaf, asks its controller for one job, and either starts it or
//! deactivates the leaf and backtracks.

use crate::config::SchedulingMode;
use crate::context::NodeSchedulingContext;
use crate::element::RATIO_PRECISION;
use crate::tree::{SnapshotElementKind, TreeSnapshot};
use atoll_core::{JobId, JobResourcesWithQuota};
use atoll_proto::{ScheduleJobFailReason, ScheduleJobRequest};
use tracing::trace;

/// Walk outcome of one leaf attempt
enum LeafAttempt {
    Started,
    Deactivated,
}

/// Non-preemptive scheduling pass
pub(crate) async fn schedule_jobs(snapshot: &TreeSnapshot, ctx: &mut NodeSchedulingContext) {
    ctx.reset_dynamic_attributes(snapshot.elements.len());
    preschedule(snapshot, ctx, false);
    run_schedule_loop(snapshot, ctx, false).await;
}

/// Mark active elements bottom-up and seed satisfaction ratios.
///
/// An operation is active when it still has pending jobs, passes this
/// node's tag filter, sits under its caps, was not already deactivated this
/// heartbeat, and (in a starving-only pass) is starving. A composite is
/// active when its own filter passes and any child is active.
pub(crate) fn preschedule(
    snapshot: &TreeSnapshot,
    ctx: &mut NodeSchedulingContext,
    starving_only: bool,
) {
    // Children have larger DFS indices than their parents, so a reverse
    // index scan is a postorder pass.
    for index in (0..snapshot.elements.len()).rev() {
        let element = &snapshot.elements[index];
        // Giving this element a job must not push it past its max share or
        // hard limits.
        let under_cap = adjusted_usage_ratio(snapshot, ctx, index)
            < element.attributes.best_allocation_ratio + RATIO_PRECISION;
        let active = match &element.kind {
            SnapshotElementKind::Operation { operation_id, .. } => {
                let mut active = element.pending_job_count > 0
                    && under_cap
                    && !ctx.deactivated_operations.contains_key(operation_id)
                    && element.tag_filter.can_schedule(&ctx.node.tags);
                if starving_only {
                    active = active
                        && element.starving
                        && current_satisfaction(snapshot, ctx, index)
                            < snapshot.config.preemption_satisfaction_threshold;
                }
                if let Some(limits) = &element.resource_limits {
                    let usage = element.resource_usage
                        + ctx.dynamic_attributes[index].usage_delta;
                    active = active && limits.dominates(&usage) && *limits != usage;
                }
                active
            }
            _ => {
                under_cap
                    && element.tag_filter.can_schedule(&ctx.node.tags)
                    && element
                        .children
                        .iter()
                        .any(|&child| ctx.dynamic_attributes[child].active)
            }
        };
        ctx.dynamic_attributes[index].active = active;
        ctx.dynamic_attributes[index].satisfaction_ratio =
            current_satisfaction(snapshot, ctx, index);
    }
}

/// Usage ratio under the walk-local deltas and discounts
fn adjusted_usage_ratio(snapshot: &TreeSnapshot, ctx: &NodeSchedulingContext, index: usize) -> f64 {
    let element = &snapshot.elements[index];
    let dynamic = &ctx.dynamic_attributes[index];
    let adjusted_usage = (element.resource_usage + dynamic.usage_delta
        - dynamic.usage_discount)
        .clamp_non_negative();
    adjusted_usage.dominant_ratio(&snapshot.total_resource_limits)
}

/// Satisfaction under the walk-local usage deltas and discounts
pub(crate) fn current_satisfaction(
    snapshot: &TreeSnapshot,
    ctx: &NodeSchedulingContext,
    index: usize,
) -> f64 {
    let element = &snapshot.elements[index];
    let dynamic = &ctx.dynamic_attributes[index];
    let adjusted_usage = (element.resource_usage + dynamic.usage_delta
        - dynamic.usage_discount)
        .clamp_non_negative();
    let usage_ratio = adjusted_usage.dominant_ratio(&snapshot.total_resource_limits);
    if element.attributes.fair_share_ratio > RATIO_PRECISION {
        usage_ratio / element.attributes.fair_share_ratio
    } else {
        f64::INFINITY
    }
}

/// Active child the walk descends into: FIFO pools take the first active
/// child in FIFO order, fair-share pools the least satisfied one (ties go
/// to the earlier sibling).
fn best_active_child(
    snapshot: &TreeSnapshot,
    ctx: &NodeSchedulingContext,
    index: usize,
) -> Option<usize> {
    let element = &snapshot.elements[index];
    match element.mode {
        SchedulingMode::Fifo => element
            .children
            .iter()
            .copied()
            .find(|&child| ctx.dynamic_attributes[child].active),
        SchedulingMode::FairShare => {
            let mut best: Option<usize> = None;
            for &child in &element.children {
                if !ctx.dynamic_attributes[child].active {
                    continue;
                }
                match best {
                    None => best = Some(child),
                    Some(current)
                        if ctx.dynamic_attributes[child].satisfaction_ratio
                            < ctx.dynamic_attributes[current].satisfaction_ratio =>
                    {
                        best = Some(child)
                    }
                    _ => {}
                }
            }
            best
        }
    }
}

/// The main loop: descend, attempt, apply or deactivate, repeat
pub(crate) async fn run_schedule_loop(
    snapshot: &TreeSnapshot,
    ctx: &mut NodeSchedulingContext,
    preemptive: bool,
) {
    loop {
        if !ctx.has_free_resources() {
            break;
        }
        if tokio::time::Instant::now() >= ctx.deadline {
            break;
        }
        if !ctx.dynamic_attributes[snapshot.root].active {
            break;
        }

        // Descend to the best leaf.
        let mut current = snapshot.root;
        while !matches!(
            snapshot.elements[current].kind,
            SnapshotElementKind::Operation { .. }
        ) {
            match best_active_child(snapshot, ctx, current) {
                Some(child) => current = child,
                None => {
                    // Stale active flag; fix it and retry from the top.
                    deactivate(snapshot, ctx, current);
                    current = snapshot.root;
                    if !ctx.dynamic_attributes[snapshot.root].active {
                        return;
                    }
                }
            }
        }

        if preemptive {
            ctx.statistics.preemptive_schedule_job_attempts += 1;
        } else {
            ctx.statistics.non_preemptive_schedule_job_attempts += 1;
        }

        match try_schedule_on_leaf(snapshot, ctx, current).await {
            LeafAttempt::Started => {
                // Usage deltas changed along the leaf's ancestry; refresh
                // the satisfaction the next descent reads.
                let mut index = Some(current);
                while let Some(i) = index {
                    ctx.dynamic_attributes[i].satisfaction_ratio =
                        current_satisfaction(snapshot, ctx, i);
                    index = snapshot.elements[i].parent;
                }
                // A starving operation scheduled via preemption stops at
                // its satisfaction threshold.
                if preemptive
                    && ctx.dynamic_attributes[current].satisfaction_ratio
                        >= snapshot.config.preemption_satisfaction_threshold
                {
                    deactivate(snapshot, ctx, current);
                }
            }
            LeafAttempt::Deactivated => {
                deactivate(snapshot, ctx, current);
            }
        }
    }
}

/// Deactivate an element and every ancestor left without active children
fn deactivate(snapshot: &TreeSnapshot, ctx: &mut NodeSchedulingContext, index: usize) {
    ctx.dynamic_attributes[index].active = false;
    let mut parent = snapshot.elements[index].parent;
    while let Some(i) = parent {
        let any_active = snapshot.elements[i]
            .children
            .iter()
            .any(|&child| ctx.dynamic_attributes[child].active);
        if any_active {
            break;
        }
        ctx.dynamic_attributes[i].active = false;
        parent = snapshot.elements[i].parent;
    }
}

/// Ask the leaf's controller for one job and apply the answer
async fn try_schedule_on_leaf(
    snapshot: &TreeSnapshot,
    ctx: &mut NodeSchedulingContext,
    leaf: usize,
) -> LeafAttempt {
    let element = &snapshot.elements[leaf];
    let SnapshotElementKind::Operation {
        operation_id,
        controller,
    } = &element.kind
    else {
        return LeafAttempt::Deactivated;
    };
    let operation_id = *operation_id;

    let free = ctx.free_resources();
    let free_disk = {
        let mut disk = ctx.node.disk_limits.clone();
        disk.subtract(&ctx.node.disk_usage);
        disk
    };
    let request = ScheduleJobRequest {
        job_id: JobId::new(),
        operation_id,
        controller_epoch: controller.controller_epoch(),
        tree_id: snapshot.tree_id.clone(),
        node_id: ctx.node.id,
        node_address: ctx.node.address.clone(),
        resource_limit: JobResourcesWithQuota::with_disk_quota(free, free_disk),
    };
    let job_id = request.job_id;
    ctx.statistics.controller_schedule_job_calls += 1;

    let timeout = snapshot.config.controller_schedule_job_timeout();
    let outcome = match tokio::time::timeout(timeout, controller.schedule_job(request)).await {
        Ok(result) => result,
        Err(_) => Err(ScheduleJobFailReason::Timeout),
    };

    let spec = match outcome {
        Ok(spec) => spec,
        Err(reason) => {
            trace!(
                operation = %operation_id,
                ?reason,
                "Operation deactivated for this heartbeat"
            );
            ctx.record_schedule_job_failure(reason);
            ctx.deactivated_operations.insert(operation_id, reason);
            return LeafAttempt::Deactivated;
        }
    };

    // The controller answered with a job; re-validate against the node and
    // the element caps, which may have tightened while we waited.
    let job_resources = spec.resources.resources;
    let fits_node = ctx.free_resources().dominates(&job_resources)
        && {
            let mut free_disk = ctx.node.disk_limits.clone();
            free_disk.subtract(&ctx.node.disk_usage);
            free_disk.dominates(&spec.resources.disk_quota)
        };
    let fits_limits = fits_node && {
        let mut index = Some(leaf);
        let mut ok = true;
        while let Some(i) = index {
            if let Some(limits) = &snapshot.elements[i].resource_limits {
                let would_be = snapshot.elements[i].resource_usage
                    + ctx.dynamic_attributes[i].usage_delta
                    + job_resources;
                if !limits.dominates(&would_be) {
                    ok = false;
                    break;
                }
            }
            index = snapshot.elements[i].parent;
        }
        ok
    };
    if !fits_limits {
        controller.on_unscheduled_job_aborted(job_id);
        ctx.record_schedule_job_failure(ScheduleJobFailReason::ResourceOvercommit);
        ctx.deactivated_operations
            .insert(operation_id, ScheduleJobFailReason::ResourceOvercommit);
        return LeafAttempt::Deactivated;
    }

    ctx.resource_usage += job_resources;
    let mut index = Some(leaf);
    while let Some(i) = index {
        ctx.dynamic_attributes[i].usage_delta += job_resources;
        index = snapshot.elements[i].parent;
    }
    ctx.started_jobs.push(crate::context::StartedJob {
        job_id,
        operation_id,
        spec,
    });
    metrics::counter!("atoll_scheduled_jobs_total", "tree" => snapshot.tree_id.clone())
        .increment(1);
    LeafAttempt::Started
}
