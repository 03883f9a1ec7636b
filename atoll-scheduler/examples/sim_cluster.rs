//! A self-contained simulated cluster: one scheduler, one controller
//! agent, three worker nodes, one map operation run to completion.
//!
//! ```sh
//! cargo run --example sim_cluster
//! ```

use atoll_core::JobResources;
use atoll_fairshare::{FairShareTree, FairShareTreeConfig, OperationPoolParams};
use atoll_scheduler::testing::{InMemoryMaster, SimAgent, SimControllerStore, SimNode};
use atoll_scheduler::{OperationState, Scheduler, SchedulerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let master = Arc::new(InMemoryMaster::new());
    let scheduler = Scheduler::connect(master.clone(), SchedulerConfig::default(), None).await?;
    scheduler.strategy().add_tree(Arc::new(FairShareTree::new(
        "default",
        FairShareTreeConfig::default(),
    )))?;

    // One controller agent producing 1-CPU jobs.
    let store = SimControllerStore::new();
    let job = JobResources {
        cpu: 1.0,
        memory: 512 << 20,
        user_slots: 1,
        network: 0,
        gpu: 0,
    };
    let agent = Arc::new(SimAgent::new("agent-1", &["default"], store.clone(), job, 12));
    agent.connect(&scheduler).await?;
    agent.heartbeat(&scheduler).await?;

    let agent_pump = {
        let agent = agent.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            loop {
                let _ = agent.heartbeat(&scheduler).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let mut params = HashMap::new();
    params.insert(
        "default".to_string(),
        OperationPoolParams {
            pool: "demo".to_string(),
            weight: 1.0,
            resource_limits: None,
            tentative: false,
        },
    );
    let operation = scheduler
        .start_operation(
            "map",
            "demo-user",
            serde_json::json!({ "input": "//tmp/input", "output": "//tmp/output" }),
            "default",
            params,
        )
        .await?;
    println!("started operation {operation}");

    // Drive the operation to Running through the agent protocol.
    while scheduler.operation(operation).map(|op| op.state()) != Some(OperationState::Running) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("operation is running");

    // Three four-core nodes heartbeat until the cluster is saturated.
    let mut nodes: Vec<SimNode> = (0..3)
        .map(|id| SimNode::new(id, 4.0, &["default"]))
        .collect();
    scheduler.tick_fair_share_update().await;
    for node in &mut nodes {
        node.heartbeat(&scheduler).await?;
        println!("node {} runs {} jobs", node.id, node.job_count());
    }

    // Complete every job and let the controller commit.
    for node in &mut nodes {
        for job_id in node.job_ids() {
            node.complete_job(job_id);
        }
        node.heartbeat(&scheduler).await?;
    }
    while !store.running_job_ids(operation).is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    agent.complete_operation(operation);
    while scheduler.operation(operation).map(|op| op.state()) != Some(OperationState::Completed) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("operation completed and flushed: {}", master.is_flushed(operation));

    let orchid = atoll_scheduler::orchid::build_orchid(&scheduler).await;
    println!("{}", serde_json::to_string_pretty(&orchid)?);

    agent_pump.abort();
    Ok(())
}
