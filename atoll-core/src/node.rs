//! Exec-node descriptors

use crate::ids::NodeId;
use crate::resources::{DiskQuota, JobResources};
use crate::tags::SchedulingTagFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An immutable snapshot of an exec node, taken at heartbeat time.
///
/// Descriptors are what the fair-share trees and controller agents see;
/// the mutable node state stays inside the owning node shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecNodeDescriptor {
    pub id: NodeId,
    pub address: String,
    /// Relative disk throughput weight; zero means the node takes no data jobs
    pub io_weight: f64,
    pub online: bool,
    pub resource_usage: JobResources,
    pub resource_limits: JobResources,
    pub disk_limits: DiskQuota,
    pub disk_usage: DiskQuota,
    pub tags: BTreeSet<String>,
}

impl ExecNodeDescriptor {
    /// True if this node passes the given scheduling filter
    pub fn can_schedule(&self, filter: &SchedulingTagFilter) -> bool {
        filter.can_schedule(&self.tags)
    }

    /// Resources still free on the node
    pub fn free_resources(&self) -> JobResources {
        (self.resource_limits - self.resource_usage).clamp_non_negative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(tags: &[&str]) -> ExecNodeDescriptor {
        ExecNodeDescriptor {
            id: NodeId(7),
            address: "node7.cluster:9012".to_string(),
            io_weight: 1.0,
            online: true,
            resource_usage: JobResources {
                cpu: 3.0,
                memory: 1024,
                user_slots: 2,
                network: 0,
                gpu: 0,
            },
            resource_limits: JobResources {
                cpu: 8.0,
                memory: 4096,
                user_slots: 10,
                network: 100,
                gpu: 0,
            },
            disk_limits: DiskQuota::of("ssd", 1 << 30),
            disk_usage: DiskQuota::new(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    #[test]
    fn test_can_schedule() {
        let node = descriptor(&["prod", "ssd"]);
        assert!(node.can_schedule(&SchedulingTagFilter::empty()));
        assert!(node.can_schedule(&SchedulingTagFilter::parse("prod & ssd").unwrap()));
        assert!(!node.can_schedule(&SchedulingTagFilter::parse("gpu").unwrap()));
    }

    #[test]
    fn test_free_resources() {
        let node = descriptor(&[]);
        let free = node.free_resources();
        assert_eq!(free.cpu, 5.0);
        assert_eq!(free.memory, 3072);
        assert_eq!(free.user_slots, 8);
    }
}
