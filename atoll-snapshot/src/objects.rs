//! Snapshot object model
//!
//! Plain-data records as the master hands them out, before cross-linking.
//! Object ids are strings unique within their type; cross-references are
//! held by id and validated during snapshot load.

use atoll_core::{DiskQuota, JobResources};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pool of internet addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPool {
    pub id: String,
}

/// A routable address belonging to an address pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternetAddress {
    pub id: String,
    pub pool_id: String,
    pub network_module_id: String,
    /// Pod currently holding the address, if any
    pub assigned_pod_id: Option<String>,
}

/// A worker node as persisted by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub address: String,
    /// Scheduling tags
    pub tags: BTreeSet<String>,
    /// Topology key -> value, e.g. `rack -> r17`, `dc -> vla`
    pub topology: BTreeMap<String, String>,
    pub schedulable: bool,
}

/// Resource-quota holder; accounts form their own hierarchy orthogonal to
/// scheduling pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Cleared during load if the parent does not exist
    pub parent_id: Option<String>,
}

/// Group of nodes selected by a tag filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSegment {
    pub id: String,
    /// Scheduling-tag filter source selecting this segment's nodes
    pub node_filter: String,
}

/// Upper bound on same-set pods within one topology zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiaffinityConstraint {
    /// Topology key the constraint ranges over (`node`, `rack`, ...)
    pub key: String,
    pub max_pods: usize,
}

/// A set of pods sharing account, segment and antiaffinity constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSet {
    pub id: String,
    pub account_id: String,
    pub node_segment_id: String,
    pub antiaffinity_constraints: Vec<AntiaffinityConstraint>,
}

/// Pod lifecycle state as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodState {
    Pending,
    Assigned,
    Running,
    Finished,
}

/// One unit of placed work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub pod_set_id: String,
    /// Node the pod is placed on; cleared during load if the node is gone
    pub node_id: Option<String>,
    /// Account override; the pod set's account applies when absent
    pub account_id: Option<String>,
    pub state: PodState,
    pub resource_requests: JobResources,
    pub disk_requests: DiskQuota,
}

impl Pod {
    /// The account this pod's usage is charged to
    pub fn effective_account_id<'a>(&'a self, pod_set: &'a PodSet) -> &'a str {
        self.account_id.as_deref().unwrap_or(&pod_set.account_id)
    }
}

/// Kind of a node-attached resource record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Network,
    Gpu,
    Disk { medium: String },
}

/// Capacity record attached to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub node_id: String,
    pub kind: ResourceKind,
    pub total_capacity: i64,
    pub allocated_capacity: i64,
}

/// A topology zone: every node sharing one `key = value` topology label.
///
/// Zones carry per-pod-set pod counters so antiaffinity vacancies can be
/// answered in O(1) during placement checks.
#[derive(Debug, Clone, Default)]
pub struct TopologyZone {
    pub key: String,
    pub value: String,
    pub node_ids: BTreeSet<String>,
    /// pod-set id -> pods of that set currently inside this zone
    pub pod_set_counts: BTreeMap<String, usize>,
}

impl TopologyZone {
    /// Remaining vacancies in this zone for a pod of `pod_set` under
    /// `constraint`
    pub fn vacancies(&self, pod_set_id: &str, constraint: &AntiaffinityConstraint) -> usize {
        let occupied = self.pod_set_counts.get(pod_set_id).copied().unwrap_or(0);
        constraint.max_pods.saturating_sub(occupied)
    }
}
