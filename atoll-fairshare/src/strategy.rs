//! Multi-tree strategy façade
//!
//! Owns every fair-share tree, routes node heartbeats to the single tree
//! matching the node's tags, validates operation starts, and fans the
//! periodic update pass out to all trees.

use crate::config::StrategyConfig;
use crate::context::NodeSchedulingContext;
use crate::controller::OperationControllerApi;
use crate::element::OperationPoolParams;
use crate::error::{StrategyError, StrategyResult};
use crate::tree::FairShareTree;
use atoll_core::{ExecNodeDescriptor, JobId, JobResources, OperationId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Outcome of one strategy-wide fair-share update
#[derive(Debug, Default)]
pub struct StrategyUpdateResult {
    /// Operations that received a running slot in some tree
    pub activated_operations: Vec<OperationId>,
}

/// The façade over all fair-share trees
pub struct FairShareStrategy {
    config: RwLock<StrategyConfig>,
    trees: RwLock<HashMap<String, Arc<FairShareTree>>>,
    operation_trees: RwLock<HashMap<OperationId, Vec<String>>>,
}

impl FairShareStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config: RwLock::new(config),
            trees: RwLock::new(HashMap::new()),
            operation_trees: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> StrategyConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: StrategyConfig) {
        *self.config.write() = config;
    }

    /// Attach a tree; its id must be fresh
    pub fn add_tree(&self, tree: Arc<FairShareTree>) -> StrategyResult<()> {
        let mut trees = self.trees.write();
        if trees.contains_key(tree.id()) {
            return Err(StrategyError::PoolConfiguration {
                pool: tree.id().to_string(),
                reason: "tree already exists".to_string(),
            });
        }
        info!(tree = tree.id(), "Fair-share tree attached");
        trees.insert(tree.id().to_string(), tree);
        Ok(())
    }

    /// Detach a tree that holds no operations
    pub fn remove_tree(&self, id: &str) -> StrategyResult<()> {
        let mut trees = self.trees.write();
        let tree = trees
            .get(id)
            .ok_or_else(|| StrategyError::UnknownTree(id.to_string()))?;
        let count = tree.operation_count();
        if count > 0 {
            return Err(StrategyError::PoolNotEmpty {
                pool: id.to_string(),
                count,
            });
        }
        trees.remove(id);
        info!(tree = id, "Fair-share tree detached");
        Ok(())
    }

    pub fn tree(&self, id: &str) -> StrategyResult<Arc<FairShareTree>> {
        self.trees
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StrategyError::UnknownTree(id.to_string()))
    }

    pub fn trees(&self) -> Vec<Arc<FairShareTree>> {
        self.trees.read().values().cloned().collect()
    }

    /// Validate that an operation with these pool assignments could start
    /// right now: all named trees exist and no pool on any chain is at its
    /// operation count limit.
    pub fn validate_operation_start(
        &self,
        params: &HashMap<String, OperationPoolParams>,
    ) -> StrategyResult<()> {
        if params.is_empty() {
            return Err(StrategyError::NoTreesSpecified);
        }
        for (tree_id, pool_params) in params {
            let tree = self.tree(tree_id)?;
            tree.validate_operation_admission(&pool_params.pool)?;
        }
        Ok(())
    }

    /// Register an operation into every tree its parameters name.
    ///
    /// All-or-nothing: a failure in any tree rolls back the registrations
    /// already made.
    pub fn register_operation(
        &self,
        operation_id: OperationId,
        params: &HashMap<String, OperationPoolParams>,
        controller: Arc<dyn OperationControllerApi>,
        start_time: DateTime<Utc>,
    ) -> StrategyResult<()> {
        if params.is_empty() {
            return Err(StrategyError::NoTreesSpecified);
        }
        let mut registered: Vec<String> = Vec::new();
        for (tree_id, pool_params) in params {
            let tree = match self.tree(tree_id) {
                Ok(tree) => tree,
                Err(error) => {
                    self.rollback(operation_id, &registered);
                    return Err(error);
                }
            };
            if let Err(error) = tree.register_operation(
                operation_id,
                pool_params.clone(),
                controller.clone(),
                start_time,
            ) {
                self.rollback(operation_id, &registered);
                return Err(error);
            }
            registered.push(tree_id.clone());
        }
        self.operation_trees
            .write()
            .insert(operation_id, registered);
        Ok(())
    }

    fn rollback(&self, operation_id: OperationId, registered: &[String]) {
        for tree_id in registered {
            if let Ok(tree) = self.tree(tree_id) {
                let _ = tree.unregister_operation(operation_id);
            }
        }
    }

    /// Remove an operation from every tree it participates in
    pub fn unregister_operation(&self, operation_id: OperationId) -> StrategyResult<()> {
        let tree_ids = self
            .operation_trees
            .write()
            .remove(&operation_id)
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        for tree_id in tree_ids {
            if let Ok(tree) = self.tree(&tree_id) {
                let _ = tree.unregister_operation(operation_id);
            }
        }
        Ok(())
    }

    /// Grant running slots in every tree; returns true when at least one
    /// tree activated the operation immediately
    pub fn mark_operation_running(&self, operation_id: OperationId) -> StrategyResult<bool> {
        let tree_ids = self
            .operation_trees
            .read()
            .get(&operation_id)
            .cloned()
            .ok_or_else(|| StrategyError::UnknownOperation(operation_id.to_string()))?;
        let mut any_active = false;
        for tree_id in tree_ids {
            let tree = self.tree(&tree_id)?;
            any_active |= tree.mark_operation_running(operation_id)?;
        }
        Ok(any_active)
    }

    /// Replace runtime parameters in every tree the operation names
    pub fn update_operation_params(
        &self,
        operation_id: OperationId,
        params: &HashMap<String, OperationPoolParams>,
    ) -> StrategyResult<()> {
        for (tree_id, pool_params) in params {
            self.tree(tree_id)?
                .update_operation_params(operation_id, pool_params.clone())?;
        }
        Ok(())
    }

    /// Drop a tentative tree assignment after the controller banned it
    pub fn ban_operation_in_tentative_tree(
        &self,
        operation_id: OperationId,
        tree_id: &str,
    ) -> StrategyResult<()> {
        let tree = self.tree(tree_id)?;
        tree.unregister_operation(operation_id)?;
        let mut map = self.operation_trees.write();
        if let Some(tree_ids) = map.get_mut(&operation_id) {
            tree_ids.retain(|id| id != tree_id);
        }
        Ok(())
    }

    /// Trees an operation is registered in
    pub fn operation_trees(&self, operation_id: OperationId) -> Vec<String> {
        self.operation_trees
            .read()
            .get(&operation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The single tree whose nodes filter matches these tags
    pub fn matching_tree(&self, tags: &BTreeSet<String>) -> StrategyResult<Arc<FairShareTree>> {
        let trees = self.trees.read();
        let matching: Vec<&Arc<FairShareTree>> = trees
            .values()
            .filter(|tree| tree.nodes_filter().can_schedule(tags))
            .collect();
        match matching.len() {
            0 => Err(StrategyError::NoTreeForNode {
                tags: tags.iter().cloned().collect(),
            }),
            1 => Ok(matching[0].clone()),
            _ => {
                let mut names: Vec<String> =
                    matching.iter().map(|tree| tree.id().to_string()).collect();
                names.sort();
                Err(StrategyError::MultipleTreesForNode {
                    tags: tags.iter().cloned().collect(),
                    trees: names,
                })
            }
        }
    }

    /// Fan the fair-share update out to every tree.
    ///
    /// Each tree's total resource limits are the sum over the online nodes
    /// its filter selects.
    pub fn update_fair_share(
        &self,
        nodes: &[ExecNodeDescriptor],
        now: DateTime<Utc>,
    ) -> StrategyUpdateResult {
        let mut result = StrategyUpdateResult::default();
        for tree in self.trees() {
            let filter = tree.nodes_filter();
            let mut total = JobResources::zero();
            for node in nodes {
                if node.online && node.can_schedule(&filter) {
                    total += node.resource_limits;
                }
            }
            let tree_result = tree.update_fair_share(total, now);
            result
                .activated_operations
                .extend(tree_result.activated_operations);
        }
        result
    }

    /// Route one node heartbeat into the matching tree's scheduling passes
    pub async fn process_node_heartbeat(
        &self,
        ctx: &mut NodeSchedulingContext,
    ) -> StrategyResult<()> {
        let tree = self.matching_tree(&ctx.node.tags)?;
        tree.process_heartbeat(ctx).await;
        Ok(())
    }

    /// Job accounting, routed by the tree that scheduled the job
    pub fn on_job_started(
        &self,
        tree_id: &str,
        operation_id: OperationId,
        job_id: JobId,
        resources: JobResources,
    ) -> StrategyResult<()> {
        self.tree(tree_id)?
            .on_job_started(operation_id, job_id, resources)
    }

    pub fn on_job_usage_updated(
        &self,
        tree_id: &str,
        operation_id: OperationId,
        job_id: JobId,
        resources: JobResources,
    ) -> StrategyResult<()> {
        self.tree(tree_id)?
            .on_job_usage_updated(operation_id, job_id, resources)
    }

    pub fn on_job_finished(
        &self,
        tree_id: &str,
        operation_id: OperationId,
        job_id: JobId,
    ) -> StrategyResult<()> {
        self.tree(tree_id)?.on_job_finished(operation_id, job_id)
    }

    /// Per-tree pool and operation attributes for the orchid surface
    pub fn build_orchid(&self) -> serde_json::Value {
        let mut trees = serde_json::Map::new();
        for tree in self.trees() {
            trees.insert(tree.id().to_string(), tree.build_info());
        }
        serde_json::Value::Object(trees)
    }
}
