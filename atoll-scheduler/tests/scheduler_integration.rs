//! End-to-end scheduler scenarios
//!
//! Real protocol round trips against scripted agents and nodes: operation
//! lifecycle, agent failure and revival, scheduler restart, node loss,
//! idempotent aborts, incarnation fencing.

use atoll_core::{JobId, JobResources, OperationId};
use atoll_fairshare::{FairShareTree, FairShareTreeConfig, OperationPoolParams};
use atoll_proto::QueueSegment;
use atoll_scheduler::testing::{InMemoryMaster, SimAgent, SimControllerStore, SimNode};
use atoll_scheduler::{OperationState, Scheduler, SchedulerConfig, SchedulerError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn cpu(cores: f64) -> JobResources {
    JobResources {
        cpu: cores,
        memory: 0,
        user_slots: 0,
        network: 0,
        gpu: 0,
    }
}

fn pool_params(pool: &str) -> HashMap<String, OperationPoolParams> {
    let mut params = HashMap::new();
    params.insert(
        "default".to_string(),
        OperationPoolParams {
            pool: pool.to_string(),
            weight: 1.0,
            resource_limits: None,
            tentative: false,
        },
    );
    params
}

async fn new_scheduler(
    master: Arc<InMemoryMaster>,
    agent_heartbeat_timeout_ms: u64,
    node_offline_timeout_ms: u64,
) -> Arc<Scheduler> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let config = SchedulerConfig {
        node_shard_count: 2,
        agent_heartbeat_timeout_ms,
        node_offline_timeout_ms,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::connect(master, config, None).await.unwrap();
    scheduler
        .strategy()
        .add_tree(Arc::new(FairShareTree::new(
            "default",
            FairShareTreeConfig::default(),
        )))
        .unwrap();
    scheduler
}

/// Keep an agent heartbeating in the background
fn pump(agent: Arc<SimAgent>, scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let _ = agent.heartbeat(&scheduler).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

async fn wait_for_state(scheduler: &Scheduler, id: OperationId, state: OperationState) {
    for _ in 0..500 {
        if scheduler.operation(id).map(|op| op.state()) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "operation never reached {state:?}; stuck in {:?}",
        scheduler.operation(id).map(|op| op.state())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operation_lifecycle_end_to_end() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 4));
    agent.connect(&scheduler).await.unwrap();
    assert!(master.has_agent_instance(&agent.id));
    agent.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation(
            "map",
            "alice",
            serde_json::json!({ "input": "//tmp/in" }),
            "default",
            pool_params("main"),
        )
        .await
        .unwrap();

    let pump_handle = pump(agent.clone(), scheduler.clone());
    wait_for_state(&scheduler, id, OperationState::Running).await;

    // A four-core node takes all four pending jobs in one heartbeat.
    scheduler.tick_fair_share_update().await;
    let mut node = SimNode::new(0, 4.0, &["default"]);
    node.heartbeat(&scheduler).await.unwrap();
    assert_eq!(node.job_count(), 4);

    // The node reports completions; the controller sees its jobs drain.
    for job_id in node.job_ids() {
        node.complete_job(job_id);
    }
    node.heartbeat(&scheduler).await.unwrap();
    for _ in 0..100 {
        if store.running_job_ids(id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.running_job_ids(id).is_empty());

    // Controller declares completion; the operation commits and flushes.
    agent.complete_operation(id);
    wait_for_state(&scheduler, id, OperationState::Completed).await;
    assert!(master.is_flushed(id));
    let attributes = master.operation_attributes(id).unwrap();
    assert_eq!(attributes["state"], serde_json::json!("completed"));

    pump_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operation_survives_agent_restart() {
    let master = Arc::new(InMemoryMaster::new());
    // Short agent lease so the failure is detected quickly.
    let scheduler = new_scheduler(master.clone(), 300, 60_000).await;
    let store = SimControllerStore::new();
    let g1 = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 3));
    g1.connect(&scheduler).await.unwrap();
    g1.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation("sort", "bob", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    let g1_pump = pump(g1.clone(), scheduler.clone());
    wait_for_state(&scheduler, id, OperationState::Running).await;

    scheduler.tick_fair_share_update().await;
    let mut node = SimNode::new(0, 10.0, &["default"]);
    node.heartbeat(&scheduler).await.unwrap();
    assert_eq!(node.job_count(), 3);
    let mut jobs_before: Vec<JobId> = node.job_ids();
    jobs_before.sort();

    // Make sure the started-job events reached the controller's persisted
    // state before G1 dies.
    g1.heartbeat(&scheduler).await.unwrap();
    assert_eq!(store.running_job_ids(id).len(), 3);

    // G1 falls silent; G2 shares the persisted controller state.
    g1_pump.abort();
    let g2 = Arc::new(SimAgent::new("g2", &["default"], store.clone(), cpu(1.0), 0));
    g2.connect(&scheduler).await.unwrap();
    g2.heartbeat(&scheduler).await.unwrap();
    let g2_pump = pump(g2.clone(), scheduler.clone());

    tokio::time::sleep(Duration::from_millis(400)).await;
    scheduler.tick_check_agent_leases().await;

    let operation = scheduler.operation(id).unwrap();
    assert_eq!(operation.agent(), Some(g2.id.clone()));

    wait_for_state(&scheduler, id, OperationState::Running).await;
    // The controller epoch advanced exactly once, fencing G1's stream.
    assert_eq!(operation.controller_epoch().0, 1);

    // The node kept its jobs: the next heartbeat aborts nothing and the
    // job ids are unchanged.
    let response = node.heartbeat(&scheduler).await.unwrap();
    assert!(response.jobs_to_abort.is_empty());
    let mut jobs_after: Vec<JobId> = node.job_ids();
    jobs_after.sort();
    assert_eq!(jobs_before, jobs_after);

    g2_pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operation_survives_scheduler_restart() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler1 = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let g1 = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 2));
    g1.connect(&scheduler1).await.unwrap();
    g1.heartbeat(&scheduler1).await.unwrap();

    let id = scheduler1
        .start_operation("merge", "carol", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    let g1_pump = pump(g1.clone(), scheduler1.clone());
    wait_for_state(&scheduler1, id, OperationState::Running).await;

    scheduler1.tick_fair_share_update().await;
    let mut node = SimNode::new(0, 4.0, &["default"]);
    node.heartbeat(&scheduler1).await.unwrap();
    assert_eq!(node.job_count(), 2);
    let mut jobs_before = node.job_ids();
    jobs_before.sort();
    g1.heartbeat(&scheduler1).await.unwrap();
    assert_eq!(store.running_job_ids(id).len(), 2);
    g1_pump.abort();

    // A fresh scheduler takes over the same master state.
    let scheduler2 = new_scheduler(master.clone(), 60_000, 60_000).await;
    scheduler2.revive_operations().await.unwrap();
    assert_eq!(
        scheduler2.operation(id).unwrap().state(),
        OperationState::Reviving
    );

    // The node reconnects first; its unknown-but-reviving jobs are held,
    // not aborted.
    let response = node.heartbeat(&scheduler2).await.unwrap();
    assert!(response.jobs_to_abort.is_empty());
    assert_eq!(node.job_count(), 2);

    // The agent reconnects and the operation revives with its job set.
    g1.connect(&scheduler2).await.unwrap();
    g1.heartbeat(&scheduler2).await.unwrap();
    scheduler2.tick_assign_agents().await;
    let g1_pump = pump(g1.clone(), scheduler2.clone());
    wait_for_state(&scheduler2, id, OperationState::Running).await;

    let response = node.heartbeat(&scheduler2).await.unwrap();
    assert!(response.jobs_to_abort.is_empty());
    let mut jobs_after = node.job_ids();
    jobs_after.sort();
    assert_eq!(jobs_before, jobs_after);

    // The displaced scheduler observes its lock loss.
    assert!(matches!(
        scheduler1.tick_ping_master_lock().await,
        Err(SchedulerError::LockLost)
    ));

    g1_pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_node_aborts_jobs_back_to_controller() {
    let master = Arc::new(InMemoryMaster::new());
    // Short node-offline timeout.
    let scheduler = new_scheduler(master.clone(), 60_000, 100).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 2));
    agent.connect(&scheduler).await.unwrap();
    agent.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation("map", "dave", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    let pump_handle = pump(agent.clone(), scheduler.clone());
    wait_for_state(&scheduler, id, OperationState::Running).await;

    scheduler.tick_fair_share_update().await;
    let mut node = SimNode::new(0, 2.0, &["default"]);
    node.heartbeat(&scheduler).await.unwrap();
    assert_eq!(node.job_count(), 2);

    // The node goes dark past the offline timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.tick_sweep_offline_nodes().await;

    // The controller sees its jobs surface as aborted and requeues them.
    for _ in 0..100 {
        if store.running_job_ids(id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.running_job_ids(id).is_empty());
    let state = store.operation(id).unwrap();
    assert_eq!(state.pending, 2);
    assert_eq!(
        scheduler.operation(id).unwrap().state(),
        OperationState::Running
    );

    pump_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_is_idempotent() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 1));
    agent.connect(&scheduler).await.unwrap();
    agent.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation("map", "erin", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();

    scheduler.abort_operation(id, "user request").await.unwrap();
    assert_eq!(
        scheduler.operation(id).unwrap().state(),
        OperationState::Aborted
    );
    assert!(master.is_flushed(id));

    // The second abort is a successful no-op.
    scheduler.abort_operation(id, "again").await.unwrap();
    assert_eq!(
        scheduler.operation(id).unwrap().state(),
        OperationState::Aborted
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_incarnation_is_fenced() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 0));
    agent.connect(&scheduler).await.unwrap();
    let old_incarnation = agent.incarnation().unwrap();

    // The agent restarts: a new handshake displaces the old incarnation.
    agent.connect(&scheduler).await.unwrap();
    let new_incarnation = agent.incarnation().unwrap();
    assert_ne!(old_incarnation, new_incarnation);

    // A heartbeat still stamped with the old incarnation is rejected.
    let request = atoll_proto::AgentHeartbeatRequest {
        agent_id: agent.id.clone(),
        incarnation_id: old_incarnation,
        operations: Vec::new(),
        operation_events: QueueSegment::empty(),
        job_events: QueueSegment::empty(),
        schedule_job_responses: QueueSegment::empty(),
        scheduler_operation_events_ack: 0,
        scheduler_job_events_ack: 0,
        schedule_job_requests_ack: 0,
        controller_memory: None,
        exec_nodes_requested: false,
    };
    let result = scheduler.process_agent_heartbeat(request).await;
    assert!(matches!(
        result,
        Err(SchedulerError::StaleIncarnation { .. })
    ));

    // The new incarnation heartbeats fine.
    agent.heartbeat(&scheduler).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permission_denied_rejects_start() {
    let master = Arc::new(InMemoryMaster::new());
    master.deny_permission("mallory", "pools/secret");
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;

    let result = scheduler
        .start_operation(
            "map",
            "mallory",
            serde_json::json!({}),
            "default",
            pool_params("secret"),
        )
        .await;
    assert!(matches!(
        result,
        Err(SchedulerError::PermissionDenied { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_master_errors_are_retried() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 1));
    agent.connect(&scheduler).await.unwrap();
    agent.heartbeat(&scheduler).await.unwrap();

    master.inject_transient_failures(2);
    let id = scheduler
        .start_operation("map", "frank", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    assert!(scheduler.operation(id).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_suspend_blocks_scheduling_until_resume() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 2));
    agent.connect(&scheduler).await.unwrap();
    agent.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation("map", "grace", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    let pump_handle = pump(agent.clone(), scheduler.clone());
    wait_for_state(&scheduler, id, OperationState::Running).await;

    scheduler.suspend_operation(id).await.unwrap();
    // Demand reported after suspension is zeroed, so the tree sees no
    // pending jobs.
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.tick_fair_share_update().await;
    let mut node = SimNode::new(0, 2.0, &["default"]);
    node.heartbeat(&scheduler).await.unwrap();
    assert_eq!(node.job_count(), 0);

    scheduler.resume_operation(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.tick_fair_share_update().await;
    node.heartbeat(&scheduler).await.unwrap();
    assert_eq!(node.job_count(), 2);

    pump_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_pool_config_raises_alert_and_keeps_old_config() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;

    let good = atoll_fairshare::PoolConfig {
        weight: 2.0,
        ..atoll_fairshare::PoolConfig::default()
    };
    scheduler.update_pool_config("default", "prod", good).unwrap();

    let bad = atoll_fairshare::PoolConfig {
        weight: -1.0,
        ..atoll_fairshare::PoolConfig::default()
    };
    assert!(scheduler.update_pool_config("default", "prod", bad).is_err());
    assert!(scheduler
        .alerts()
        .is_set(atoll_scheduler::SchedulerAlertType::UpdatePools));

    // The previous configuration stayed in effect.
    let tree = scheduler.strategy().tree("default").unwrap();
    tree.update_fair_share(JobResources::zero(), chrono::Utc::now());
    let snapshot = tree.snapshot();
    assert!(snapshot.pools.contains_key("prod"));

    // A parsing config heals the alert.
    let fixed = atoll_fairshare::PoolConfig::default();
    scheduler.update_pool_config("default", "prod", fixed).unwrap();
    assert!(!scheduler
        .alerts()
        .is_set(atoll_scheduler::SchedulerAlertType::UpdatePools));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orchid_exposes_operations_pools_and_agents() {
    let master = Arc::new(InMemoryMaster::new());
    let scheduler = new_scheduler(master.clone(), 60_000, 60_000).await;
    let store = SimControllerStore::new();
    let agent = Arc::new(SimAgent::new("g1", &["default"], store.clone(), cpu(1.0), 1));
    agent.connect(&scheduler).await.unwrap();
    agent.heartbeat(&scheduler).await.unwrap();

    let id = scheduler
        .start_operation("map", "heidi", serde_json::json!({}), "default", pool_params("main"))
        .await
        .unwrap();
    let pump_handle = pump(agent.clone(), scheduler.clone());
    wait_for_state(&scheduler, id, OperationState::Running).await;
    scheduler.tick_fair_share_update().await;

    let orchid = atoll_scheduler::orchid::build_orchid(&scheduler).await;
    assert!(orchid["operations"][id.to_string()]["state"] == serde_json::json!("running"));
    assert!(orchid["scheduling_info_per_pool_tree"]["default"]["pools"]
        .as_object()
        .unwrap()
        .contains_key("main"));
    assert!(orchid["controller_agents"]["g1"]["operation_count"] == serde_json::json!(1));

    pump_handle.abort();
}
