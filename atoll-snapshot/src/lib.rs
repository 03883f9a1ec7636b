//! Read-consistent cluster snapshot
//!
//! Each scheduling pass works against a point-in-time graph of every
//! scheduling-relevant object: address pools, internet addresses, nodes,
//! accounts, node segments, pod sets, pods and resources, cross-linked and
//! indexed at a single read timestamp.
//!
//! Loading is all-or-nothing: any error keeps the previous snapshot in
//! place. Dangling references drop the link (or the object, when it cannot
//! exist without the target) with a warning; they never fail the load.

pub mod cluster;
pub mod error;
pub mod objects;
pub mod reader;

pub use cluster::{Cluster, ClusterSnapshot};
pub use error::{SnapshotError, SnapshotResult};
pub use objects::{
    Account, AddressPool, AntiaffinityConstraint, InternetAddress, NodeRecord, NodeSegment, Pod,
    PodSet, PodState, ResourceKind, ResourceRecord, TopologyZone,
};
pub use reader::ClusterReader;
