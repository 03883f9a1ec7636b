//! Read-only orchid tree
//!
//! A YSON-shaped `serde_json::Value` exposing per-operation state,
//! per-pool share and usage, node-shard counters, the agent directory and
//! the scheduler alerts. Strictly a view: nothing here mutates state.

use crate::scheduler::Scheduler;
use serde_json::json;

/// Build the full orchid tree
pub async fn build_orchid(scheduler: &Scheduler) -> serde_json::Value {
    let mut operations = serde_json::Map::new();
    for operation in scheduler.operations() {
        let events: Vec<serde_json::Value> = operation
            .events()
            .iter()
            .map(|event| {
                json!({
                    "state": event.state,
                    "timestamp": event.timestamp,
                })
            })
            .collect();
        operations.insert(
            operation.id.to_string(),
            json!({
                "operation_type": operation.operation_type,
                "user": operation.user,
                "state": operation.state(),
                "suspended": operation.is_suspended(),
                "controller_epoch": operation.controller_epoch(),
                "agent": operation.agent().map(|agent| agent.to_string()),
                "alerts": operation.alerts(),
                "result_error": operation.result_error().map(|error| error.message),
                "events": events,
                "suspicious_jobs": scheduler.suspicious_jobs(operation.id),
            }),
        );
    }

    let mut agents = serde_json::Map::new();
    for agent in scheduler.tracker().agents() {
        agents.insert(
            agent.id.to_string(),
            json!({
                "incarnation": agent.incarnation,
                "state": format!("{:?}", agent.state()),
                "tags": agent.tags,
                "addresses": agent.addresses,
                "operation_count": agent.operations().len(),
                "memory_statistics": agent.memory_statistics(),
            }),
        );
    }

    let alerts: serde_json::Map<String, serde_json::Value> = scheduler
        .alerts()
        .snapshot()
        .into_iter()
        .map(|(key, error)| (format!("{key:?}"), json!(error)))
        .collect();

    json!({
        "scheduler": {
            "incarnation": scheduler.incarnation,
            "alerts": alerts,
        },
        "operations": operations,
        "scheduling_info_per_pool_tree": scheduler.strategy().build_orchid(),
        "node_shards": scheduler.shard_counters().await,
        "controller_agents": agents,
    })
}
