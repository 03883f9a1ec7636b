//! One fair-share pool tree
//!
//! The mutable tree lives behind locks and is touched only by the control
//! side (registration, config, job accounting, the periodic update pass).
//! Every update publishes an immutable [`TreeSnapshot`]; heartbeats schedule
//! against the snapshot and never read the mutable tree.

use crate::config::{FairShareTreeConfig, PoolConfig, SchedulingMode};
use crate::context::NodeSchedulingContext;
use crate::controller::OperationControllerApi;
use crate::element::{
    Element, ElementIndex, ElementKind, OperationElement, OperationPoolParams,
    SchedulableAttributes,
};
use crate::error::{StrategyError, StrategyResult};
use crate::{preempt, schedule, update};
use atoll_core::{FilterRegistry, JobId, JobResources, NodeId, OperationId, SchedulingTagFilter};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Mutable tree state: an arena of elements plus the id indexes
pub(crate) struct TreeState {
    pub elements: Vec<Option<Element>>,
    free_indices: Vec<ElementIndex>,
    pub root: ElementIndex,
    pub pools: HashMap<String, ElementIndex>,
    pub operations: HashMap<OperationId, ElementIndex>,
    /// Operations admitted but waiting for a running slot
    queued_activations: Vec<OperationId>,
}

impl TreeState {
    fn new() -> Self {
        let mut state = Self {
            elements: Vec::new(),
            free_indices: Vec::new(),
            root: 0,
            pools: HashMap::new(),
            operations: HashMap::new(),
            queued_activations: Vec::new(),
        };
        state.root = state.alloc(Element::new(None, ElementKind::Root));
        state
    }

    fn alloc(&mut self, element: Element) -> ElementIndex {
        if let Some(index) = self.free_indices.pop() {
            self.elements[index] = Some(element);
            index
        } else {
            self.elements.push(Some(element));
            self.elements.len() - 1
        }
    }

    fn release(&mut self, index: ElementIndex) {
        self.elements[index] = None;
        self.free_indices.push(index);
    }

    pub fn element(&self, index: ElementIndex) -> &Element {
        self.elements[index].as_ref().expect("live element slot")
    }

    pub fn element_mut(&mut self, index: ElementIndex) -> &mut Element {
        self.elements[index].as_mut().expect("live element slot")
    }

    /// Indices from `index` to the root, inclusive
    pub fn ancestry(&self, index: ElementIndex) -> Vec<ElementIndex> {
        let mut chain = vec![index];
        let mut current = index;
        while let Some(parent) = self.element(current).parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    fn attach(&mut self, parent: ElementIndex, child: ElementIndex) {
        self.element_mut(parent).children.push(child);
    }

    fn detach(&mut self, parent: ElementIndex, child: ElementIndex) {
        self.element_mut(parent).children.retain(|&c| c != child);
    }
}

/// Immutable copy of one element inside a [`TreeSnapshot`]
pub struct SnapshotElement {
    pub parent: Option<usize>,
    /// For FIFO pools the order is the pool's FIFO order
    pub children: Vec<usize>,
    pub kind: SnapshotElementKind,
    pub attributes: SchedulableAttributes,
    pub resource_usage: JobResources,
    pub resource_demand: JobResources,
    pub pending_job_count: i64,
    pub resource_limits: Option<JobResources>,
    pub mode: SchedulingMode,
    pub tag_filter: SchedulingTagFilter,
    pub starving: bool,
    pub aggressively_starving: bool,
}

pub enum SnapshotElementKind {
    Root,
    Pool { name: String },
    Operation {
        operation_id: OperationId,
        controller: Arc<dyn OperationControllerApi>,
    },
}

impl SnapshotElement {
    pub fn operation_id(&self) -> Option<OperationId> {
        match &self.kind {
            SnapshotElementKind::Operation { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }
}

/// Published view of the tree at one fair-share update
pub struct TreeSnapshot {
    pub tree_id: String,
    pub config: FairShareTreeConfig,
    pub total_resource_limits: JobResources,
    pub elements: Vec<SnapshotElement>,
    pub root: usize,
    pub operations: HashMap<OperationId, usize>,
    pub pools: HashMap<String, usize>,
}

impl TreeSnapshot {
    fn empty(tree_id: &str, config: FairShareTreeConfig) -> Self {
        Self {
            tree_id: tree_id.to_string(),
            config,
            total_resource_limits: JobResources::zero(),
            elements: vec![SnapshotElement {
                parent: None,
                children: Vec::new(),
                kind: SnapshotElementKind::Root,
                attributes: SchedulableAttributes::default(),
                resource_usage: JobResources::zero(),
                resource_demand: JobResources::zero(),
                pending_job_count: 0,
                resource_limits: None,
                mode: SchedulingMode::FairShare,
                tag_filter: SchedulingTagFilter::empty(),
                starving: false,
                aggressively_starving: false,
            }],
            root: 0,
            operations: HashMap::new(),
            pools: HashMap::new(),
        }
    }
}

/// Result of one fair-share update pass
#[derive(Debug, Default)]
pub struct TreeUpdateResult {
    /// Operations that received a running slot during this update
    pub activated_operations: Vec<OperationId>,
}

/// A fair-share tree over one disjoint set of nodes
pub struct FairShareTree {
    id: String,
    config: RwLock<FairShareTreeConfig>,
    state: Mutex<TreeState>,
    snapshot: RwLock<Arc<TreeSnapshot>>,
    filter_registry: FilterRegistry,
    last_preemptive_pass: Mutex<HashMap<NodeId, DateTime<Utc>>>,
}

impl FairShareTree {
    pub fn new(id: impl Into<String>, config: FairShareTreeConfig) -> Self {
        let id = id.into();
        let snapshot = Arc::new(TreeSnapshot::empty(&id, config.clone()));
        Self {
            id,
            config: RwLock::new(config),
            state: Mutex::new(TreeState::new()),
            snapshot: RwLock::new(snapshot),
            filter_registry: FilterRegistry::new(),
            last_preemptive_pass: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> FairShareTreeConfig {
        self.config.read().clone()
    }

    /// Filter selecting this tree's nodes
    pub fn nodes_filter(&self) -> SchedulingTagFilter {
        self.config.read().nodes_filter.clone()
    }

    /// Replace the tree configuration; the next update pass applies it
    pub fn update_config(&self, config: FairShareTreeConfig) {
        *self.config.write() = config;
    }

    /// Create a pool under `parent` (the root when `None`)
    pub fn create_pool(
        &self,
        name: &str,
        parent: Option<&str>,
        config: PoolConfig,
    ) -> StrategyResult<()> {
        validate_pool_config(name, &config)?;
        let mut state = self.state.lock();
        if state.pools.contains_key(name) {
            return Err(StrategyError::PoolConfiguration {
                pool: name.to_string(),
                reason: "pool already exists".to_string(),
            });
        }
        let parent_index = match parent {
            None => state.root,
            Some(parent_name) => {
                *state
                    .pools
                    .get(parent_name)
                    .ok_or_else(|| StrategyError::UnknownPool {
                        tree: self.id.clone(),
                        pool: parent_name.to_string(),
                    })?
            }
        };
        self.filter_registry.register(&config.scheduling_tag_filter);
        let index = state.alloc(Element::new(
            Some(parent_index),
            ElementKind::Pool {
                name: name.to_string(),
                config,
                ephemeral: false,
            },
        ));
        state.attach(parent_index, index);
        state.pools.insert(name.to_string(), index);
        info!(tree = %self.id, pool = %name, "Pool created");
        Ok(())
    }

    /// Replace a pool's configuration in place
    pub fn update_pool_config(&self, name: &str, config: PoolConfig) -> StrategyResult<()> {
        validate_pool_config(name, &config)?;
        let mut state = self.state.lock();
        let index = *state
            .pools
            .get(name)
            .ok_or_else(|| StrategyError::UnknownPool {
                tree: self.id.clone(),
                pool: name.to_string(),
            })?;
        let element = state.element_mut(index);
        if let ElementKind::Pool {
            config: existing, ..
        } = &mut element.kind
        {
            self.filter_registry.unregister(&existing.scheduling_tag_filter);
            self.filter_registry.register(&config.scheduling_tag_filter);
            *existing = config;
        }
        Ok(())
    }

    /// Remove an empty pool
    pub fn remove_pool(&self, name: &str) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = *state
            .pools
            .get(name)
            .ok_or_else(|| StrategyError::UnknownPool {
                tree: self.id.clone(),
                pool: name.to_string(),
            })?;
        let child_count = state.element(index).children.len();
        if child_count > 0 {
            return Err(StrategyError::PoolNotEmpty {
                pool: name.to_string(),
                count: child_count,
            });
        }
        if let ElementKind::Pool { config, .. } = &state.element(index).kind {
            self.filter_registry.unregister(&config.scheduling_tag_filter);
        }
        let parent = state.element(index).parent.unwrap_or(state.root);
        state.detach(parent, index);
        state.pools.remove(name);
        state.release(index);
        info!(tree = %self.id, pool = %name, "Pool removed");
        Ok(())
    }

    /// Check that `pool` (or its ancestors) can admit one more operation,
    /// without registering anything. A missing pool admits: it would be
    /// created as ephemeral.
    pub fn validate_operation_admission(&self, pool: &str) -> StrategyResult<()> {
        let config = self.config();
        let state = self.state.lock();
        let Some(&pool_index) = state.pools.get(pool) else {
            return Ok(());
        };
        for &ancestor in &state.ancestry(pool_index) {
            let element = state.element(ancestor);
            if let ElementKind::Pool { name, config: pool_config, .. } = &element.kind {
                let limit = pool_config
                    .max_operation_count
                    .unwrap_or(config.default_max_operation_count);
                if element.operation_count >= limit {
                    return Err(StrategyError::OperationCountLimitExceeded {
                        pool: name.clone(),
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Admit an operation into its pool.
    ///
    /// The pool is auto-created as ephemeral when missing. Fails with
    /// `OperationCountLimitExceeded` when any pool on the ancestor chain is
    /// at its operation count limit.
    pub fn register_operation(
        &self,
        operation_id: OperationId,
        params: OperationPoolParams,
        controller: Arc<dyn OperationControllerApi>,
        start_time: DateTime<Utc>,
    ) -> StrategyResult<()> {
        let config = self.config();
        let mut state = self.state.lock();
        if state.operations.contains_key(&operation_id) {
            return Err(StrategyError::OperationAlreadyRegistered(
                operation_id.to_string(),
            ));
        }

        let mut created_ephemeral = false;
        let pool_index = match state.pools.get(params.pool.as_str()) {
            Some(&index) => index,
            None => {
                created_ephemeral = true;
                // Ephemeral pool on behalf of the user, parented under the
                // configured default pool.
                let parent_index = config
                    .default_parent_pool
                    .as_deref()
                    .and_then(|parent| state.pools.get(parent).copied())
                    .unwrap_or(state.root);
                let index = state.alloc(Element::new(
                    Some(parent_index),
                    ElementKind::Pool {
                        name: params.pool.clone(),
                        config: PoolConfig::default(),
                        ephemeral: true,
                    },
                ));
                state.attach(parent_index, index);
                state.pools.insert(params.pool.clone(), index);
                debug!(tree = %self.id, pool = %params.pool, "Ephemeral pool created");
                index
            }
        };

        // Walk the chain before mutating anything.
        for &ancestor in &state.ancestry(pool_index) {
            let element = state.element(ancestor);
            if let ElementKind::Pool { name, config: pool_config, .. } = &element.kind {
                let limit = pool_config
                    .max_operation_count
                    .unwrap_or(config.default_max_operation_count);
                if element.operation_count >= limit {
                    let error = StrategyError::OperationCountLimitExceeded {
                        pool: name.clone(),
                        limit,
                    };
                    if created_ephemeral {
                        let parent = state.element(pool_index).parent.unwrap_or(state.root);
                        state.detach(parent, pool_index);
                        state.pools.remove(&params.pool);
                        state.release(pool_index);
                    }
                    return Err(error);
                }
            }
        }

        let index = state.alloc(Element::new(
            Some(pool_index),
            ElementKind::Operation(OperationElement {
                operation_id,
                controller,
                params,
                start_time,
                running_jobs: HashMap::new(),
                running: false,
            }),
        ));
        state.attach(pool_index, index);
        state.operations.insert(operation_id, index);
        for ancestor in state.ancestry(pool_index) {
            state.element_mut(ancestor).operation_count += 1;
        }
        info!(tree = %self.id, operation = %operation_id, "Operation registered in tree");
        Ok(())
    }

    /// Give the operation a running slot, or queue it when its pool chain
    /// is at the running-operation limit. Returns true when it started
    /// running immediately.
    pub fn mark_operation_running(&self, operation_id: OperationId) -> StrategyResult<bool> {
        let config = self.config();
        let mut state = self.state.lock();
        let index = *state
            .operations
            .get(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        // Re-marking a running operation (e.g. after revival) must not
        // consume another slot.
        if state
            .element(index)
            .operation()
            .map(|op| op.running)
            .unwrap_or(false)
        {
            return Ok(true);
        }
        let pool_index = state.element(index).parent.unwrap_or(state.root);

        for &ancestor in &state.ancestry(pool_index) {
            let element = state.element(ancestor);
            if let ElementKind::Pool { config: pool_config, .. } = &element.kind {
                let limit = pool_config
                    .max_running_operation_count
                    .unwrap_or(config.default_max_running_operation_count);
                if element.running_operation_count >= limit {
                    state.queued_activations.push(operation_id);
                    debug!(
                        tree = %self.id,
                        operation = %operation_id,
                        "Operation queued for a running slot"
                    );
                    return Ok(false);
                }
            }
        }

        Self::activate(&mut state, index);
        Ok(true)
    }

    fn activate(state: &mut TreeState, index: ElementIndex) {
        if let Some(op) = state.element_mut(index).operation_mut() {
            op.running = true;
        }
        let chain = state.ancestry(index);
        for ancestor in chain.into_iter().skip(1) {
            state.element_mut(ancestor).running_operation_count += 1;
        }
    }

    /// Remove an operation; its ephemeral pool disappears with its last
    /// member. Idempotent by way of `UnknownOperation`.
    pub fn unregister_operation(&self, operation_id: OperationId) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = state
            .operations
            .remove(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        let was_running = state
            .element(index)
            .operation()
            .map(|op| op.running)
            .unwrap_or(false);
        let pool_index = state.element(index).parent.unwrap_or(state.root);

        state.detach(pool_index, index);
        state.release(index);
        for ancestor in state.ancestry(pool_index) {
            let element = state.element_mut(ancestor);
            element.operation_count = element.operation_count.saturating_sub(1);
            if was_running {
                element.running_operation_count =
                    element.running_operation_count.saturating_sub(1);
            }
        }
        state
            .queued_activations
            .retain(|&queued| queued != operation_id);

        // Collapse a now-empty ephemeral pool.
        let ephemeral_and_empty = matches!(
            &state.element(pool_index).kind,
            ElementKind::Pool { ephemeral: true, .. }
        ) && state.element(pool_index).children.is_empty();
        if ephemeral_and_empty {
            let name = state
                .element(pool_index)
                .pool_name()
                .map(str::to_string)
                .unwrap_or_default();
            let parent = state.element(pool_index).parent.unwrap_or(state.root);
            state.detach(parent, pool_index);
            state.pools.remove(&name);
            state.release(pool_index);
            debug!(tree = %self.id, pool = %name, "Ephemeral pool removed");
        }
        info!(tree = %self.id, operation = %operation_id, "Operation unregistered from tree");
        Ok(())
    }

    /// Replace an operation's runtime parameters in place. Weight and
    /// resource limits apply on the next update pass; moving between pools
    /// is not supported in place.
    pub fn update_operation_params(
        &self,
        operation_id: OperationId,
        params: OperationPoolParams,
    ) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = *state
            .operations
            .get(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        let element = state.element_mut(index);
        if let Some(op) = element.operation_mut() {
            if op.params.pool != params.pool {
                return Err(StrategyError::PoolConfiguration {
                    pool: params.pool,
                    reason: "moving an operation between pools requires a restart".to_string(),
                });
            }
            op.params = params;
        }
        Ok(())
    }

    pub fn has_operation(&self, operation_id: OperationId) -> bool {
        self.state.lock().operations.contains_key(&operation_id)
    }

    pub fn operation_count(&self) -> usize {
        self.state.lock().operations.len()
    }

    /// Account a started job into the operation's usage
    pub fn on_job_started(
        &self,
        operation_id: OperationId,
        job_id: JobId,
        resources: JobResources,
    ) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = *state
            .operations
            .get(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        if let Some(op) = state.element_mut(index).operation_mut() {
            op.running_jobs.insert(job_id, resources);
        }
        Ok(())
    }

    /// Refresh a running job's usage
    pub fn on_job_usage_updated(
        &self,
        operation_id: OperationId,
        job_id: JobId,
        resources: JobResources,
    ) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = *state
            .operations
            .get(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        if let Some(op) = state.element_mut(index).operation_mut() {
            if let Some(usage) = op.running_jobs.get_mut(&job_id) {
                *usage = resources;
            }
        }
        Ok(())
    }

    /// Drop a finished job from the operation's usage
    pub fn on_job_finished(&self, operation_id: OperationId, job_id: JobId) -> StrategyResult<()> {
        let mut state = self.state.lock();
        let index = *state
            .operations
            .get(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        if let Some(op) = state.element_mut(index).operation_mut() {
            op.running_jobs.remove(&job_id);
        }
        Ok(())
    }

    /// Run the fair-share update pass and publish a fresh snapshot.
    ///
    /// `total_resource_limits` is the sum of limits over this tree's nodes.
    pub fn update_fair_share(
        &self,
        total_resource_limits: JobResources,
        now: DateTime<Utc>,
    ) -> TreeUpdateResult {
        let config = self.config();
        let mut state = self.state.lock();

        update::run_update(&mut state, &config, total_resource_limits, now);

        // Activation queue: running slots may have freed since the last
        // pass.
        let mut activated = Vec::new();
        let queued = std::mem::take(&mut state.queued_activations);
        for operation_id in queued {
            let Some(&index) = state.operations.get(&operation_id) else {
                continue;
            };
            let pool_index = state.element(index).parent.unwrap_or(state.root);
            let mut fits = true;
            for &ancestor in &state.ancestry(pool_index) {
                if let ElementKind::Pool { config: pool_config, .. } =
                    &state.element(ancestor).kind
                {
                    let limit = pool_config
                        .max_running_operation_count
                        .unwrap_or(config.default_max_running_operation_count);
                    if state.element(ancestor).running_operation_count >= limit {
                        fits = false;
                        break;
                    }
                }
            }
            if fits {
                Self::activate(&mut state, index);
                activated.push(operation_id);
            } else {
                state.queued_activations.push(operation_id);
            }
        }

        let snapshot = Arc::new(build_snapshot(
            &state,
            &self.id,
            config,
            total_resource_limits,
        ));
        metrics::gauge!("atoll_tree_element_count", "tree" => self.id.clone())
            .set(snapshot.elements.len() as f64);
        *self.snapshot.write() = snapshot;

        TreeUpdateResult {
            activated_operations: activated,
        }
    }

    /// The last published snapshot
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.snapshot.read().clone()
    }

    /// Run the scheduling passes for one node heartbeat: first without
    /// preemption, then (under backoff) with it.
    pub async fn process_heartbeat(&self, ctx: &mut NodeSchedulingContext) {
        let snapshot = self.snapshot();
        schedule::schedule_jobs(&snapshot, ctx).await;

        if !preempt::needs_preemptive_pass(&snapshot) {
            return;
        }
        let preemption_due = {
            let backoff = chrono::Duration::milliseconds(
                snapshot.config.preemptive_scheduling_backoff_ms as i64,
            );
            let mut last = self.last_preemptive_pass.lock();
            match last.get(&ctx.node.id) {
                Some(&at) if ctx.now - at < backoff => false,
                _ => {
                    last.insert(ctx.node.id, ctx.now);
                    true
                }
            }
        };
        if preemption_due {
            preempt::schedule_jobs_with_preemption(&snapshot, ctx).await;
        }
    }

    /// Pool and operation attributes for the orchid tree
    pub fn build_info(&self) -> serde_json::Value {
        let snapshot = self.snapshot();
        let mut pools = serde_json::Map::new();
        let mut operations = serde_json::Map::new();
        for element in &snapshot.elements {
            let attributes = serde_json::json!({
                "fair_share_ratio": element.attributes.fair_share_ratio,
                "usage_ratio": element.attributes.usage_ratio,
                "demand_ratio": element.attributes.demand_ratio,
                "adjusted_min_share_ratio": element.attributes.adjusted_min_share_ratio,
                "satisfaction_ratio": element.attributes.satisfaction_ratio,
                "resource_usage": element.resource_usage,
                "resource_demand": element.resource_demand,
                "pending_job_count": element.pending_job_count,
                "starving": element.starving,
            });
            match &element.kind {
                SnapshotElementKind::Root => {
                    pools.insert("<root>".to_string(), attributes);
                }
                SnapshotElementKind::Pool { name } => {
                    pools.insert(name.clone(), attributes);
                }
                SnapshotElementKind::Operation { operation_id, .. } => {
                    operations.insert(operation_id.to_string(), attributes);
                }
            }
        }
        serde_json::json!({
            "tree_id": self.id,
            "total_resource_limits": snapshot.total_resource_limits,
            "pools": serde_json::Value::Object(pools),
            "operations": serde_json::Value::Object(operations),
        })
    }
}

fn validate_pool_config(name: &str, config: &PoolConfig) -> StrategyResult<()> {
    if !(config.weight > 0.0) {
        return Err(StrategyError::PoolConfiguration {
            pool: name.to_string(),
            reason: format!("weight must be positive, got {}", config.weight),
        });
    }
    if !(0.0..=1.0).contains(&config.max_share_ratio) {
        return Err(StrategyError::PoolConfiguration {
            pool: name.to_string(),
            reason: format!(
                "max_share_ratio must lie in [0, 1], got {}",
                config.max_share_ratio
            ),
        });
    }
    Ok(())
}

/// Deep-copy the live elements into a compact immutable snapshot
fn build_snapshot(
    state: &TreeState,
    tree_id: &str,
    config: FairShareTreeConfig,
    total_resource_limits: JobResources,
) -> TreeSnapshot {
    let mut elements = Vec::new();
    let mut operations = HashMap::new();
    let mut pools = HashMap::new();
    let mut index_map: HashMap<ElementIndex, usize> = HashMap::new();

    // Parents precede children, so a preorder DFS keeps every parent link
    // resolvable while we build.
    let mut stack = vec![state.root];
    let mut order = Vec::new();
    while let Some(index) = stack.pop() {
        order.push(index);
        for &child in state.element(index).children.iter().rev() {
            stack.push(child);
        }
    }

    for index in order {
        let element = state.element(index);
        let snapshot_index = elements.len();
        index_map.insert(index, snapshot_index);
        let kind = match &element.kind {
            ElementKind::Root => SnapshotElementKind::Root,
            ElementKind::Pool { name, .. } => {
                pools.insert(name.clone(), snapshot_index);
                SnapshotElementKind::Pool { name: name.clone() }
            }
            ElementKind::Operation(op) => {
                operations.insert(op.operation_id, snapshot_index);
                SnapshotElementKind::Operation {
                    operation_id: op.operation_id,
                    controller: op.controller.clone(),
                }
            }
        };
        let mode = match &element.kind {
            ElementKind::Pool { config, .. } => config.mode,
            _ => SchedulingMode::FairShare,
        };
        elements.push(SnapshotElement {
            parent: element.parent.map(|parent| index_map[&parent]),
            children: Vec::new(),
            kind,
            attributes: element.attributes,
            resource_usage: element.resource_usage,
            resource_demand: element.resource_demand,
            pending_job_count: element.pending_job_count,
            resource_limits: element.resource_limits(),
            mode,
            tag_filter: element.tag_filter(),
            starving: element.starving,
            aggressively_starving: element.aggressively_starving,
        });
    }

    // Wire children through the index map, preserving the (possibly FIFO)
    // order the update pass left behind.
    for (&old_index, &new_index) in &index_map {
        let children: Vec<usize> = state
            .element(old_index)
            .children
            .iter()
            .map(|child| index_map[child])
            .collect();
        elements[new_index].children = children;
    }

    TreeSnapshot {
        tree_id: tree_id.to_string(),
        config,
        total_resource_limits,
        elements,
        root: index_map[&state.root],
        operations,
        pools,
    }
}
