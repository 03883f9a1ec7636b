//! The fair-share update pass
//!
//! Runs once per `fair_share_update_period`:
//! 1. reset demand-derived attributes,
//! 2. postorder: aggregate usage, demand and pending job counts,
//! 3. preorder: apportion each composite's fair share among its children
//!    (water filling for fair-share pools, sequential fill for FIFO pools),
//! 4. derive satisfaction and starvation flags.

use crate::config::{FairShareTreeConfig, FifoSortParameter, SchedulingMode};
use crate::element::{ElementIndex, ElementKind, RATIO_PRECISION};
use crate::tree::TreeState;
use atoll_core::JobResources;
use chrono::{DateTime, Utc};

/// Fraction of the tree an element can hold given per-component limits:
/// the tightest component of `limits / total`.
fn limits_ratio(limits: &JobResources, total: &JobResources) -> f64 {
    let mut ratio = f64::INFINITY;
    let mut consider = |limit: f64, total: f64| {
        if total > 0.0 {
            ratio = ratio.min(limit / total);
        }
    };
    consider(limits.cpu, total.cpu);
    consider(limits.memory as f64, total.memory as f64);
    consider(limits.user_slots as f64, total.user_slots as f64);
    consider(limits.network as f64, total.network as f64);
    consider(limits.gpu as f64, total.gpu as f64);
    if ratio.is_finite() {
        ratio.max(0.0)
    } else {
        1.0
    }
}

/// Postorder walk of the live elements
fn postorder(state: &TreeState) -> Vec<ElementIndex> {
    let mut order = Vec::new();
    let mut stack = vec![(state.root, false)];
    while let Some((index, visited)) = stack.pop() {
        if visited {
            order.push(index);
            continue;
        }
        stack.push((index, true));
        for &child in &state.element(index).children {
            stack.push((child, false));
        }
    }
    order
}

pub(crate) fn run_update(
    state: &mut TreeState,
    config: &FairShareTreeConfig,
    total_resource_limits: JobResources,
    now: DateTime<Utc>,
) {
    let order = postorder(state);

    // Postorder: demand and usage flow upward from the operations.
    for &index in &order {
        let mut usage = JobResources::zero();
        let mut demand = JobResources::zero();
        let mut pending = 0;

        match &state.element(index).kind {
            ElementKind::Operation(op) => {
                for job_usage in op.running_jobs.values() {
                    usage += *job_usage;
                }
                if op.running {
                    let reported = op.controller.demand();
                    demand = usage + reported.resource_demand;
                    pending = reported.pending_job_count;
                }
            }
            _ => {
                for &child in &state.element(index).children.clone() {
                    let child_element = state.element(child);
                    usage += child_element.resource_usage;
                    demand += child_element.resource_demand;
                    pending += child_element.pending_job_count;
                }
            }
        }

        let element = state.element_mut(index);
        element.resource_usage = usage;
        element.resource_demand = demand;
        element.pending_job_count = pending;
        element.attributes.usage_ratio = usage.dominant_ratio(&total_resource_limits);
        element.attributes.demand_ratio = demand.dominant_ratio(&total_resource_limits);

        let min_share_ratio = element
            .min_share_resources()
            .dominant_ratio(&total_resource_limits);
        element.attributes.adjusted_min_share_ratio =
            min_share_ratio.min(element.attributes.demand_ratio);

        let mut cap = element
            .attributes
            .demand_ratio
            .min(element.max_share_ratio());
        if let Some(limits) = element.resource_limits() {
            cap = cap.min(limits_ratio(&limits, &total_resource_limits));
        }
        element.attributes.best_allocation_ratio = cap;
    }

    // Preorder: apportion shares downward. Postorder reversed visits every
    // parent before its children.
    let root = state.root;
    let root_share = state.element(root).attributes.best_allocation_ratio;
    state.element_mut(root).attributes.fair_share_ratio = root_share;
    for &index in order.iter().rev() {
        let children = state.element(index).children.clone();
        if children.is_empty() {
            continue;
        }
        let parent_share = state.element(index).attributes.fair_share_ratio;
        let mode = match &state.element(index).kind {
            ElementKind::Pool { config, .. } => config.mode,
            _ => SchedulingMode::FairShare,
        };
        match mode {
            SchedulingMode::FairShare => apportion_fair_share(state, &children, parent_share),
            SchedulingMode::Fifo => {
                let fifo_parameters = match &state.element(index).kind {
                    ElementKind::Pool { config, .. } => config.fifo_sort_parameters.clone(),
                    _ => vec![FifoSortParameter::StartTime],
                };
                apportion_fifo(state, index, &children, parent_share, &fifo_parameters);
            }
        }
    }

    // Satisfaction and starvation.
    for &index in &order {
        let element = state.element_mut(index);
        let attributes = &mut element.attributes;
        attributes.satisfaction_ratio = if attributes.fair_share_ratio > RATIO_PRECISION {
            attributes.usage_ratio / attributes.fair_share_ratio
        } else {
            f64::INFINITY
        };

        if !element.is_operation() {
            continue;
        }
        let fair = element.attributes.fair_share_ratio;
        let usage = element.attributes.usage_ratio;
        let wants_more = element.attributes.demand_ratio > usage + RATIO_PRECISION;

        let below = wants_more && usage < fair * config.fair_share_starvation_tolerance;
        if below {
            let since = *element.below_fair_share_since.get_or_insert(now);
            let starved_for = now - since;
            element.starving = starved_for
                >= chrono::Duration::milliseconds(config.fair_share_preemption_timeout_ms as i64);
            element.aggressively_starving = config.enable_aggressive_starvation
                && usage < fair * config.aggressive_starvation_tolerance
                && starved_for
                    >= chrono::Duration::milliseconds(
                        config.aggressive_preemption_timeout_ms as i64,
                    );
        } else {
            element.below_fair_share_since = None;
            element.starving = false;
            element.aggressively_starving = false;
        }
    }
}

/// Weight-proportional water filling.
///
/// Children first receive their adjusted min share (scaled down
/// proportionally when the floors alone exceed the parent share), then the
/// remainder is poured by weight in rounds; a child saturates at its best
/// allocation ratio and drops out of later rounds.
fn apportion_fair_share(state: &mut TreeState, children: &[ElementIndex], parent_share: f64) {
    let count = children.len();
    let mut caps = Vec::with_capacity(count);
    let mut floors = Vec::with_capacity(count);
    let mut weights = Vec::with_capacity(count);
    for &child in children {
        let element = state.element(child);
        let cap = element
            .attributes
            .best_allocation_ratio
            .min(parent_share)
            .max(0.0);
        caps.push(cap);
        floors.push(element.attributes.adjusted_min_share_ratio.min(cap));
        weights.push(element.weight().max(RATIO_PRECISION));
    }

    let floor_sum: f64 = floors.iter().sum();
    let scale = if floor_sum > parent_share && floor_sum > RATIO_PRECISION {
        parent_share / floor_sum
    } else {
        1.0
    };
    let mut shares: Vec<f64> = floors.iter().map(|floor| floor * scale).collect();
    let mut remaining = parent_share - shares.iter().sum::<f64>();

    while remaining > RATIO_PRECISION {
        let active: Vec<usize> = (0..count)
            .filter(|&i| shares[i] + RATIO_PRECISION < caps[i])
            .collect();
        if active.is_empty() {
            break;
        }
        let total_weight: f64 = active.iter().map(|&i| weights[i]).sum();
        let mut consumed = 0.0;
        for &i in &active {
            let offer = remaining * weights[i] / total_weight;
            let take = offer.min(caps[i] - shares[i]);
            shares[i] += take;
            consumed += take;
        }
        remaining -= consumed;
        if consumed <= RATIO_PRECISION {
            break;
        }
    }

    for (position, &child) in children.iter().enumerate() {
        let element = state.element_mut(child);
        element.attributes.fair_share_ratio = shares[position];
        element.attributes.guaranteed_resources_ratio = floors[position] * scale;
    }
}

/// FIFO apportionment: order the children by the pool's FIFO sort
/// parameters and give the first unsatisfied child everything it can take,
/// then the next, until the share runs out. The child order is persisted so
/// the scheduling walk sees the same sequence.
fn apportion_fifo(
    state: &mut TreeState,
    pool: ElementIndex,
    children: &[ElementIndex],
    parent_share: f64,
    fifo_parameters: &[FifoSortParameter],
) {
    let mut ordered: Vec<ElementIndex> = children.to_vec();
    // Stable sort: insertion order breaks remaining ties.
    ordered.sort_by(|&a, &b| {
        let ea = state.element(a);
        let eb = state.element(b);
        for parameter in fifo_parameters {
            let ordering = match parameter {
                FifoSortParameter::StartTime => {
                    let sa = ea.operation().map(|op| op.start_time);
                    let sb = eb.operation().map(|op| op.start_time);
                    sa.cmp(&sb)
                }
                FifoSortParameter::Weight => eb
                    .weight()
                    .partial_cmp(&ea.weight())
                    .unwrap_or(std::cmp::Ordering::Equal),
                FifoSortParameter::PendingJobCount => {
                    ea.pending_job_count.cmp(&eb.pending_job_count)
                }
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });

    let mut remaining = parent_share;
    for &child in &ordered {
        let element = state.element_mut(child);
        let share = element.attributes.best_allocation_ratio.min(remaining).max(0.0);
        element.attributes.fair_share_ratio = share;
        element.attributes.guaranteed_resources_ratio = 0.0;
        remaining -= share;
    }

    state.element_mut(pool).children = ordered;
}
