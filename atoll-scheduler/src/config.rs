//! Scheduler configuration

use atoll_fairshare::StrategyConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an operation's controller agent is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPickStrategy {
    /// Uniformly among agents with enough free memory
    #[default]
    Random,
    /// Weight by (free / total)^power
    MemoryUsageBalanced,
}

/// Top-level scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Nodes are partitioned as `node_id % node_shard_count`
    pub node_shard_count: usize,

    /// A node missing heartbeats this long goes offline and its jobs are
    /// aborted as lost
    pub node_offline_timeout_ms: u64,

    /// Agent lease length; renewed by every agent heartbeat
    pub agent_heartbeat_timeout_ms: u64,

    pub agent_pick_strategy: AgentPickStrategy,
    /// Absolute floor of free agent memory for assignment eligibility
    pub min_agent_available_memory: i64,
    /// Fractional floor of free agent memory, against its limit
    pub min_agent_available_memory_fraction: f64,
    /// Exponent of the memory-balanced pick score
    pub memory_balanced_pick_strategy_score_power: f64,

    /// Period of the cluster snapshot load
    pub snapshot_period_ms: u64,

    /// Master retry policy
    pub master_retry_attempts: usize,
    pub master_retry_backoff_ms: u64,
    pub master_retry_backoff_cap_ms: u64,

    pub strategy: StrategyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_shard_count: 4,
            node_offline_timeout_ms: 15_000,
            agent_heartbeat_timeout_ms: 10_000,
            agent_pick_strategy: AgentPickStrategy::Random,
            min_agent_available_memory: 1 << 30,
            min_agent_available_memory_fraction: 0.05,
            memory_balanced_pick_strategy_score_power: 1.0,
            snapshot_period_ms: 5_000,
            master_retry_attempts: 5,
            master_retry_backoff_ms: 100,
            master_retry_backoff_cap_ms: 5_000,
            strategy: StrategyConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn node_offline_timeout(&self) -> Duration {
        Duration::from_millis(self.node_offline_timeout_ms)
    }

    pub fn agent_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_heartbeat_timeout_ms)
    }

    pub fn snapshot_period(&self) -> Duration {
        Duration::from_millis(self.snapshot_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.node_shard_count, 4);
        assert_eq!(config.agent_pick_strategy, AgentPickStrategy::Random);
    }
}
