//! Strategy-level behavior: tree routing, multi-tree registration,
//! min-share guarantees, tag-filtered pools and hard-limit preemption.

use atoll_core::{ExecNodeDescriptor, JobId, JobResources, NodeId, OperationId, SchedulingTagFilter};
use atoll_fairshare::testing::ScriptedController;
use atoll_fairshare::{
    FairShareStrategy, FairShareTree, FairShareTreeConfig, NodeSchedulingContext,
    OperationPoolParams, PoolConfig, RunningJob, StrategyConfig, StrategyError,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn cpu(cores: f64) -> JobResources {
    JobResources {
        cpu: cores,
        memory: 0,
        user_slots: 0,
        network: 0,
        gpu: 0,
    }
}

fn node(id: u32, cores: f64, tags: &[&str]) -> ExecNodeDescriptor {
    ExecNodeDescriptor {
        id: NodeId(id),
        address: format!("node{id}:9012"),
        io_weight: 1.0,
        online: true,
        resource_usage: JobResources::zero(),
        resource_limits: JobResources {
            cpu: cores,
            memory: 8 << 30,
            user_slots: 100,
            network: 0,
            gpu: 0,
        },
        disk_limits: Default::default(),
        disk_usage: Default::default(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
}

fn tree_with_filter(id: &str, filter: &str) -> Arc<FairShareTree> {
    Arc::new(FairShareTree::new(
        id,
        FairShareTreeConfig {
            nodes_filter: SchedulingTagFilter::parse(filter).unwrap(),
            ..FairShareTreeConfig::default()
        },
    ))
}

fn params(pool: &str) -> OperationPoolParams {
    OperationPoolParams {
        pool: pool.to_string(),
        weight: 1.0,
        resource_limits: None,
        tentative: false,
    }
}

fn tags(list: &[&str]) -> std::collections::BTreeSet<String> {
    list.iter().map(|tag| tag.to_string()).collect()
}

#[test]
fn test_heartbeats_route_to_the_single_matching_tree() {
    let strategy = FairShareStrategy::new(StrategyConfig::default());
    strategy.add_tree(tree_with_filter("ssd", "ssd")).unwrap();
    strategy.add_tree(tree_with_filter("hdd", "hdd & !ssd")).unwrap();

    assert_eq!(strategy.matching_tree(&tags(&["ssd"])).unwrap().id(), "ssd");
    assert_eq!(strategy.matching_tree(&tags(&["hdd"])).unwrap().id(), "hdd");

    assert!(matches!(
        strategy.matching_tree(&tags(&["gpu"])),
        Err(StrategyError::NoTreeForNode { .. })
    ));
    // A node carrying both tags matches both trees, which is refused.
    assert!(matches!(
        strategy.matching_tree(&tags(&["ssd", "hdd"])),
        Err(StrategyError::MultipleTreesForNode { .. })
    ));
}

#[test]
fn test_operation_registers_in_every_named_tree() {
    let strategy = FairShareStrategy::new(StrategyConfig::default());
    strategy.add_tree(tree_with_filter("ssd", "ssd")).unwrap();
    strategy.add_tree(tree_with_filter("hdd", "hdd & !ssd")).unwrap();

    let op = OperationId::new();
    let controller = Arc::new(ScriptedController::new(cpu(1.0), 10));
    let mut assignments = HashMap::new();
    assignments.insert("ssd".to_string(), params("main"));
    assignments.insert("hdd".to_string(), params("main"));
    strategy
        .register_operation(op, &assignments, controller, t0())
        .unwrap();

    assert_eq!(strategy.tree("ssd").unwrap().operation_count(), 1);
    assert_eq!(strategy.tree("hdd").unwrap().operation_count(), 1);

    strategy.unregister_operation(op).unwrap();
    assert_eq!(strategy.tree("ssd").unwrap().operation_count(), 0);
    assert_eq!(strategy.tree("hdd").unwrap().operation_count(), 0);
}

#[test]
fn test_registration_rolls_back_on_partial_failure() {
    let strategy = FairShareStrategy::new(StrategyConfig::default());
    strategy.add_tree(tree_with_filter("ssd", "ssd")).unwrap();

    let op = OperationId::new();
    let controller = Arc::new(ScriptedController::new(cpu(1.0), 10));
    let mut assignments = HashMap::new();
    assignments.insert("ssd".to_string(), params("main"));
    assignments.insert("missing".to_string(), params("main"));

    assert!(strategy
        .register_operation(op, &assignments, controller, t0())
        .is_err());
    // The successful registration was rolled back with the failure.
    assert_eq!(strategy.tree("ssd").unwrap().operation_count(), 0);
}

#[test]
fn test_ban_in_tentative_tree_drops_only_that_tree() {
    let strategy = FairShareStrategy::new(StrategyConfig::default());
    strategy.add_tree(tree_with_filter("ssd", "ssd")).unwrap();
    strategy.add_tree(tree_with_filter("hdd", "hdd & !ssd")).unwrap();

    let op = OperationId::new();
    let controller = Arc::new(ScriptedController::new(cpu(1.0), 10));
    let mut assignments = HashMap::new();
    assignments.insert("ssd".to_string(), params("main"));
    assignments.insert(
        "hdd".to_string(),
        OperationPoolParams {
            tentative: true,
            ..params("main")
        },
    );
    strategy
        .register_operation(op, &assignments, controller, t0())
        .unwrap();

    strategy.ban_operation_in_tentative_tree(op, "hdd").unwrap();
    assert_eq!(strategy.tree("hdd").unwrap().operation_count(), 0);
    assert_eq!(strategy.tree("ssd").unwrap().operation_count(), 1);
    assert_eq!(strategy.operation_trees(op), vec!["ssd".to_string()]);
}

#[test]
fn test_tree_removal_requires_no_operations() {
    let strategy = FairShareStrategy::new(StrategyConfig::default());
    strategy.add_tree(tree_with_filter("ssd", "ssd")).unwrap();

    let op = OperationId::new();
    let mut assignments = HashMap::new();
    assignments.insert("ssd".to_string(), params("main"));
    strategy
        .register_operation(
            op,
            &assignments,
            Arc::new(ScriptedController::new(cpu(1.0), 1)),
            t0(),
        )
        .unwrap();

    assert!(matches!(
        strategy.remove_tree("ssd"),
        Err(StrategyError::PoolNotEmpty { .. })
    ));
    strategy.unregister_operation(op).unwrap();
    strategy.remove_tree("ssd").unwrap();
}

#[tokio::test]
async fn test_min_share_is_honored_before_weight() {
    let tree = FairShareTree::new("default", FairShareTreeConfig::default());
    tree.create_pool(
        "guaranteed",
        None,
        PoolConfig {
            min_share_resources: JobResources {
                cpu: 8.0,
                memory: 0,
                user_slots: 0,
                network: 0,
                gpu: 0,
            },
            weight: 1.0,
            ..PoolConfig::default()
        },
    )
    .unwrap();
    tree.create_pool(
        "besteffort",
        None,
        PoolConfig {
            weight: 10.0,
            ..PoolConfig::default()
        },
    )
    .unwrap();

    for pool in ["guaranteed", "besteffort"] {
        let op = OperationId::new();
        tree.register_operation(
            op,
            params(pool),
            Arc::new(ScriptedController::new(cpu(1.0), 100)),
            t0(),
        )
        .unwrap();
        tree.mark_operation_running(op).unwrap();
    }
    tree.update_fair_share(
        JobResources {
            cpu: 10.0,
            memory: 64 << 30,
            user_slots: 1000,
            network: 0,
            gpu: 0,
        },
        t0(),
    );

    let snapshot = tree.snapshot();
    let guaranteed = snapshot.elements[snapshot.pools["guaranteed"]]
        .attributes
        .fair_share_ratio;
    let besteffort = snapshot.elements[snapshot.pools["besteffort"]]
        .attributes
        .fair_share_ratio;
    // Despite the 10x weight against it, the min share holds.
    assert!(guaranteed >= 0.8 - 1e-9, "guaranteed pool got {guaranteed}");
    assert!(besteffort <= 0.2 + 1e-9, "best-effort pool got {besteffort}");
    assert!((guaranteed + besteffort - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_pool_tag_filter_restricts_nodes() {
    let tree = FairShareTree::new("default", FairShareTreeConfig::default());
    tree.create_pool(
        "gpu-only",
        None,
        PoolConfig {
            scheduling_tag_filter: SchedulingTagFilter::parse("gpu").unwrap(),
            ..PoolConfig::default()
        },
    )
    .unwrap();
    let op = OperationId::new();
    let controller = Arc::new(ScriptedController::new(cpu(1.0), 10));
    tree.register_operation(op, params("gpu-only"), controller.clone(), t0())
        .unwrap();
    tree.mark_operation_running(op).unwrap();
    tree.update_fair_share(
        JobResources {
            cpu: 10.0,
            memory: 64 << 30,
            user_slots: 1000,
            network: 0,
            gpu: 0,
        },
        t0(),
    );

    // A plain node is filtered out without a single controller call.
    let mut ctx = NodeSchedulingContext::new(
        node(1, 4.0, &["prod"]),
        Vec::new(),
        t0(),
        tokio::time::Instant::now() + Duration::from_secs(5),
    );
    tree.process_heartbeat(&mut ctx).await;
    assert!(ctx.started_jobs.is_empty());
    assert_eq!(controller.schedule_calls(), 0);

    // A GPU node passes the pool filter.
    let mut ctx = NodeSchedulingContext::new(
        node(2, 4.0, &["prod", "gpu"]),
        Vec::new(),
        t0(),
        tokio::time::Instant::now() + Duration::from_secs(5),
    );
    tree.process_heartbeat(&mut ctx).await;
    assert_eq!(ctx.started_jobs.len(), 4);
}

#[tokio::test]
async fn test_hard_resource_limit_is_restored_by_preemption() {
    let config = FairShareTreeConfig {
        preemptive_scheduling_backoff_ms: 0,
        ..FairShareTreeConfig::default()
    };
    let tree = FairShareTree::new("default", config);
    let op = OperationId::new();
    let controller = Arc::new(ScriptedController::new(cpu(1.0), 0));
    tree.register_operation(
        op,
        OperationPoolParams {
            resource_limits: Some(JobResources {
                cpu: 3.0,
                ..JobResources::infinite()
            }),
            ..params("main")
        },
        controller,
        t0(),
    )
    .unwrap();
    tree.mark_operation_running(op).unwrap();

    // Five running jobs of strictly increasing age, two over the limit.
    let mut running = Vec::new();
    for i in 0..5 {
        let job_id = JobId::new();
        tree.on_job_started(op, job_id, cpu(1.0)).unwrap();
        running.push(RunningJob {
            job_id,
            operation_id: op,
            resource_usage: cpu(1.0),
            start_time: t0() + ChronoDuration::seconds(i),
            preemption_mode: atoll_proto::PreemptionMode::Normal,
        });
    }
    tree.update_fair_share(
        JobResources {
            cpu: 10.0,
            memory: 64 << 30,
            user_slots: 1000,
            network: 0,
            gpu: 0,
        },
        t0() + ChronoDuration::seconds(60),
    );

    let oldest: Vec<JobId> = running.iter().take(2).map(|job| job.job_id).collect();
    let mut descriptor = node(1, 10.0, &[]);
    descriptor.resource_usage = cpu(5.0);
    let mut ctx = NodeSchedulingContext::new(
        descriptor,
        running,
        t0() + ChronoDuration::seconds(60),
        tokio::time::Instant::now() + Duration::from_secs(5),
    );
    tree.process_heartbeat(&mut ctx).await;

    // Exactly enough of the oldest jobs die to get back under the limit.
    assert_eq!(ctx.preempted_jobs.len(), 2);
    let killed: Vec<JobId> = ctx.preempted_jobs.iter().map(|job| job.job_id).collect();
    assert_eq!(killed, oldest);
    assert!(ctx.preempted_jobs[0].reason.contains("resource limits"));
}
