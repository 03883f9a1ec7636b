//! Master read abstraction

use crate::error::SnapshotResult;
use crate::objects::{
    Account, AddressPool, InternetAddress, NodeRecord, NodeSegment, Pod, PodSet, ResourceRecord,
};
use async_trait::async_trait;

/// Read access to the master at a consistent timestamp.
///
/// `start_transaction` pins the read timestamp; every `read_*` call made
/// until the next `start_transaction` must observe the state as of that
/// timestamp.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Open a read transaction, returning its timestamp
    async fn start_transaction(&self) -> SnapshotResult<u64>;

    async fn read_address_pools(&self) -> SnapshotResult<Vec<AddressPool>>;
    async fn read_internet_addresses(&self) -> SnapshotResult<Vec<InternetAddress>>;
    async fn read_nodes(&self) -> SnapshotResult<Vec<NodeRecord>>;
    async fn read_accounts(&self) -> SnapshotResult<Vec<Account>>;
    async fn read_node_segments(&self) -> SnapshotResult<Vec<NodeSegment>>;
    async fn read_pod_sets(&self) -> SnapshotResult<Vec<PodSet>>;
    async fn read_pods(&self) -> SnapshotResult<Vec<Pod>>;
    async fn read_resources(&self) -> SnapshotResult<Vec<ResourceRecord>>;
}
