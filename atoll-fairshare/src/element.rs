//! Tree elements
//!
//! Elements live in an arena indexed by `usize`; parents, children and every
//! other cross-reference are arena indices. Ownership stays with the tree,
//! so no reference cycles exist anywhere in the hierarchy.

use crate::config::PoolConfig;
use crate::controller::OperationControllerApi;
use atoll_core::{JobId, JobResources, OperationId, SchedulingTagFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Arena index of an element
pub type ElementIndex = usize;

/// Ratio denominators guard against division by a vanishing fair share
pub const RATIO_PRECISION: f64 = 1e-9;

/// Attributes produced by the fair-share update pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulableAttributes {
    /// Demand as a fraction of total tree resources (dominant component)
    pub demand_ratio: f64,
    /// Usage as a fraction of total tree resources (dominant component)
    pub usage_ratio: f64,
    /// Target fraction of the tree this element should receive
    pub fair_share_ratio: f64,
    /// Min-share guarantee after clamping to demand and parent share
    pub adjusted_min_share_ratio: f64,
    /// Share the element is guaranteed by min-share plus weight
    pub guaranteed_resources_ratio: f64,
    /// Upper bound on the share this element can actually consume
    pub best_allocation_ratio: f64,
    /// `usage_ratio / max(fair_share_ratio, epsilon)`; the scheduling walk
    /// descends toward the minimum
    pub satisfaction_ratio: f64,
}

/// Per-tree runtime parameters of one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPoolParams {
    pub pool: String,
    pub weight: f64,
    pub resource_limits: Option<JobResources>,
    /// Tentative assignments are dropped when the controller bans the tree
    pub tentative: bool,
}

impl Default for OperationPoolParams {
    fn default() -> Self {
        Self {
            pool: String::new(),
            weight: 1.0,
            resource_limits: None,
            tentative: false,
        }
    }
}

/// Leaf payload: one operation's scheduling state inside one tree
pub struct OperationElement {
    pub operation_id: OperationId,
    pub controller: Arc<dyn OperationControllerApi>,
    pub params: OperationPoolParams,
    pub start_time: DateTime<Utc>,
    /// Jobs of this operation currently running in this tree
    pub running_jobs: HashMap<JobId, JobResources>,
    /// Set once the operation is materialized and may receive jobs
    pub running: bool,
}

impl std::fmt::Debug for OperationElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationElement")
            .field("operation_id", &self.operation_id)
            .field("start_time", &self.start_time)
            .field("running", &self.running)
            .field("running_jobs", &self.running_jobs.len())
            .finish()
    }
}

/// What kind of element this arena slot holds
#[derive(Debug)]
pub enum ElementKind {
    Root,
    Pool {
        name: String,
        config: PoolConfig,
        /// Auto-created on behalf of a user; auto-destroyed when empty
        ephemeral: bool,
    },
    Operation(OperationElement),
}

/// One node of the fair-share tree
#[derive(Debug)]
pub struct Element {
    pub parent: Option<ElementIndex>,
    /// Ordered by insertion; empty for operations
    pub children: Vec<ElementIndex>,
    pub kind: ElementKind,

    // Demand-derived, refreshed by every update pass.
    pub resource_usage: JobResources,
    pub resource_demand: JobResources,
    pub pending_job_count: i64,

    pub attributes: SchedulableAttributes,

    // Subtree operation counters, maintained on registration.
    pub operation_count: usize,
    pub running_operation_count: usize,

    // Starvation tracking; meaningful for operations only.
    pub below_fair_share_since: Option<DateTime<Utc>>,
    pub starving: bool,
    pub aggressively_starving: bool,
}

impl Element {
    pub fn new(parent: Option<ElementIndex>, kind: ElementKind) -> Self {
        Self {
            parent,
            children: Vec::new(),
            kind,
            resource_usage: JobResources::zero(),
            resource_demand: JobResources::zero(),
            pending_job_count: 0,
            attributes: SchedulableAttributes::default(),
            operation_count: 0,
            running_operation_count: 0,
            below_fair_share_since: None,
            starving: false,
            aggressively_starving: false,
        }
    }

    pub fn is_operation(&self) -> bool {
        matches!(self.kind, ElementKind::Operation(_))
    }

    pub fn operation(&self) -> Option<&OperationElement> {
        match &self.kind {
            ElementKind::Operation(op) => Some(op),
            _ => None,
        }
    }

    pub fn operation_mut(&mut self) -> Option<&mut OperationElement> {
        match &mut self.kind {
            ElementKind::Operation(op) => Some(op),
            _ => None,
        }
    }

    /// Relative weight against siblings
    pub fn weight(&self) -> f64 {
        match &self.kind {
            ElementKind::Root => 1.0,
            ElementKind::Pool { config, .. } => config.weight,
            ElementKind::Operation(op) => op.params.weight,
        }
    }

    /// Min-share resources configured on this element
    pub fn min_share_resources(&self) -> JobResources {
        match &self.kind {
            ElementKind::Pool { config, .. } => config.min_share_resources,
            _ => JobResources::zero(),
        }
    }

    /// Upper bound on the share of the tree, in [0, 1]
    pub fn max_share_ratio(&self) -> f64 {
        match &self.kind {
            ElementKind::Pool { config, .. } => config.max_share_ratio,
            _ => 1.0,
        }
    }

    /// Hard resource cap, if configured
    pub fn resource_limits(&self) -> Option<JobResources> {
        match &self.kind {
            ElementKind::Root => None,
            ElementKind::Pool { config, .. } => config.resource_limits,
            ElementKind::Operation(op) => op.params.resource_limits,
        }
    }

    /// Tag filter restricting this element to node subsets
    pub fn tag_filter(&self) -> SchedulingTagFilter {
        match &self.kind {
            ElementKind::Pool { config, .. } => config.scheduling_tag_filter.clone(),
            _ => SchedulingTagFilter::empty(),
        }
    }

    pub fn pool_name(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Pool { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_defaults() {
        let element = Element::new(None, ElementKind::Root);
        assert!(element.children.is_empty());
        assert_eq!(element.weight(), 1.0);
        assert!(element.resource_limits().is_none());
        assert!(element.tag_filter().is_empty());
    }

    #[test]
    fn test_pool_accessors() {
        let config = PoolConfig {
            weight: 3.0,
            max_share_ratio: 0.5,
            ..PoolConfig::default()
        };
        let element = Element::new(
            Some(0),
            ElementKind::Pool {
                name: "research".to_string(),
                config,
                ephemeral: false,
            },
        );
        assert_eq!(element.weight(), 3.0);
        assert_eq!(element.max_share_ratio(), 0.5);
        assert_eq!(element.pool_name(), Some("research"));
    }
}
