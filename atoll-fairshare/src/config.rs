//! Tree and strategy configuration
//!
//! Plain-data config structs with serde derives and defaults on every
//! field, so a partial config deserializes into something runnable.

use atoll_core::{JobResources, SchedulingTagFilter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a pool divides resources among its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    #[default]
    FairShare,
    Fifo,
}

/// Ordering keys for FIFO pools, applied lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FifoSortParameter {
    StartTime,
    Weight,
    PendingJobCount,
}

/// Static configuration of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Relative weight against siblings
    pub weight: f64,
    /// Resources guaranteed to this pool's subtree
    pub min_share_resources: JobResources,
    /// Upper bound on the subtree's share of the tree, in [0, 1]
    pub max_share_ratio: f64,
    /// Hard cap on the subtree's usage; preemption enforces it. Build
    /// from [`JobResources::infinite`] so unnamed components stay
    /// unconstrained.
    pub resource_limits: Option<JobResources>,
    /// Total operations admitted into the subtree
    pub max_operation_count: Option<usize>,
    /// Concurrently running operations in the subtree
    pub max_running_operation_count: Option<usize>,
    pub mode: SchedulingMode,
    pub fifo_sort_parameters: Vec<FifoSortParameter>,
    /// Restricts the pool's subtree to matching nodes
    pub scheduling_tag_filter: SchedulingTagFilter,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            min_share_resources: JobResources::zero(),
            max_share_ratio: 1.0,
            resource_limits: None,
            max_operation_count: None,
            max_running_operation_count: None,
            mode: SchedulingMode::FairShare,
            fifo_sort_parameters: vec![FifoSortParameter::StartTime],
            scheduling_tag_filter: SchedulingTagFilter::empty(),
        }
    }
}

/// Per-tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairShareTreeConfig {
    /// Selects the nodes this tree schedules onto; trees of one strategy
    /// must select disjoint node sets
    pub nodes_filter: SchedulingTagFilter,

    /// An operation whose usage stays below
    /// `fair_share * fair_share_starvation_tolerance` for longer than the
    /// preemption timeout is starving
    pub fair_share_starvation_tolerance: f64,
    pub fair_share_preemption_timeout_ms: u64,

    /// Jobs of operations above `fair_share * preemption_tolerance` are
    /// preemptable
    pub preemption_tolerance: f64,

    /// The preemptive pass schedules for a starving operation only while
    /// its satisfaction stays below this threshold, so preemption never
    /// pushes it past its fair share
    pub preemption_satisfaction_threshold: f64,

    /// Aggressive starvation tier; disabled by default
    pub enable_aggressive_starvation: bool,
    pub aggressive_starvation_tolerance: f64,
    pub aggressive_preemption_timeout_ms: u64,

    /// Minimum delay between preemptive scheduling passes on one node
    pub preemptive_scheduling_backoff_ms: u64,

    /// Budget for one whole scheduling pass on one heartbeat
    pub schedule_jobs_timeout_ms: u64,
    /// Budget for a single controller schedule-job call
    pub controller_schedule_job_timeout_ms: u64,

    /// Pool every ephemeral pool is parented under; the root when absent
    pub default_parent_pool: Option<String>,
    /// Operation count limits applied to pools that do not set their own
    pub default_max_operation_count: usize,
    pub default_max_running_operation_count: usize,
}

impl Default for FairShareTreeConfig {
    fn default() -> Self {
        Self {
            nodes_filter: SchedulingTagFilter::empty(),
            fair_share_starvation_tolerance: 0.8,
            fair_share_preemption_timeout_ms: 30_000,
            preemption_tolerance: 1.05,
            preemption_satisfaction_threshold: 1.0,
            enable_aggressive_starvation: false,
            aggressive_starvation_tolerance: 0.35,
            aggressive_preemption_timeout_ms: 10_000,
            preemptive_scheduling_backoff_ms: 1_000,
            schedule_jobs_timeout_ms: 10_000,
            controller_schedule_job_timeout_ms: 5_000,
            default_parent_pool: None,
            default_max_operation_count: 50_000,
            default_max_running_operation_count: 1_000,
        }
    }
}

impl FairShareTreeConfig {
    pub fn fair_share_preemption_timeout(&self) -> Duration {
        Duration::from_millis(self.fair_share_preemption_timeout_ms)
    }

    pub fn aggressive_preemption_timeout(&self) -> Duration {
        Duration::from_millis(self.aggressive_preemption_timeout_ms)
    }

    pub fn preemptive_scheduling_backoff(&self) -> Duration {
        Duration::from_millis(self.preemptive_scheduling_backoff_ms)
    }

    pub fn schedule_jobs_timeout(&self) -> Duration {
        Duration::from_millis(self.schedule_jobs_timeout_ms)
    }

    pub fn controller_schedule_job_timeout(&self) -> Duration {
        Duration::from_millis(self.controller_schedule_job_timeout_ms)
    }
}

/// Strategy-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Period of the fair-share update pass
    pub fair_share_update_period_ms: u64,
    /// Tree used for operations that do not name one
    pub default_tree: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fair_share_update_period_ms: 1_000,
            default_tree: None,
        }
    }
}

impl StrategyConfig {
    pub fn fair_share_update_period(&self) -> Duration {
        Duration::from_millis(self.fair_share_update_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: FairShareTreeConfig =
            serde_json::from_str("{\"preemption_tolerance\": 1.2}").unwrap();
        assert!((config.preemption_tolerance - 1.2).abs() < 1e-9);
        assert_eq!(config.preemptive_scheduling_backoff_ms, 1_000);
        assert!(config.nodes_filter.is_empty());
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.weight, 1.0);
        assert_eq!(config.max_share_ratio, 1.0);
        assert_eq!(config.mode, SchedulingMode::FairShare);
        assert!(config.scheduling_tag_filter.is_empty());
    }
}
