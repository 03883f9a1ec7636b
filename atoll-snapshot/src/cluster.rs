//! Snapshot loading and derived indexes

use crate::error::{SnapshotError, SnapshotResult};
use crate::objects::{
    Account, AddressPool, AntiaffinityConstraint, InternetAddress, NodeRecord, NodeSegment, Pod,
    PodSet, ResourceRecord, TopologyZone,
};
use crate::reader::ClusterReader;
use atoll_core::SchedulingTagFilter;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-network-module address accounting, derived from internet addresses
#[derive(Debug, Clone, Default)]
pub struct NetworkModule {
    pub internet_address_count: usize,
    pub allocated_internet_address_count: usize,
}

/// An immutable, cross-linked, indexed view of the cluster at one read
/// timestamp. Freely shared across threads behind an `Arc`.
#[derive(Debug)]
pub struct ClusterSnapshot {
    timestamp: u64,
    address_pools: HashMap<String, AddressPool>,
    internet_addresses: HashMap<String, InternetAddress>,
    nodes: HashMap<String, NodeRecord>,
    accounts: HashMap<String, Account>,
    node_segments: HashMap<String, NodeSegment>,
    pod_sets: HashMap<String, PodSet>,
    pods: HashMap<String, Pod>,
    resources: HashMap<String, ResourceRecord>,

    node_pods: HashMap<String, Vec<String>>,
    pod_set_pods: HashMap<String, Vec<String>>,
    account_pods: HashMap<String, Vec<String>>,
    segment_nodes: HashMap<String, Vec<String>>,
    node_resources: HashMap<String, Vec<String>>,
    topology_zones: HashMap<(String, String), TopologyZone>,
    network_modules: HashMap<String, NetworkModule>,
}

impl ClusterSnapshot {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn pod(&self, id: &str) -> Option<&Pod> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pod_set(&self, id: &str) -> Option<&PodSet> {
        self.pod_sets.get(id)
    }

    pub fn node_segment(&self, id: &str) -> Option<&NodeSegment> {
        self.node_segments.get(id)
    }

    pub fn address_pool(&self, id: &str) -> Option<&AddressPool> {
        self.address_pools.get(id)
    }

    pub fn internet_address(&self, id: &str) -> Option<&InternetAddress> {
        self.internet_addresses.get(id)
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    /// Pods placed on a node
    pub fn pods_of_node(&self, node_id: &str) -> &[String] {
        self.node_pods
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pods of a pod set
    pub fn pods_of_pod_set(&self, pod_set_id: &str) -> &[String] {
        self.pod_set_pods
            .get(pod_set_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pods charged to an account (effective account, not ancestors)
    pub fn pods_of_account(&self, account_id: &str) -> &[String] {
        self.account_pods
            .get(account_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes selected by a segment's filter
    pub fn nodes_of_segment(&self, segment_id: &str) -> &[String] {
        self.segment_nodes
            .get(segment_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resource records attached to a node
    pub fn resources_of_node(&self, node_id: &str) -> &[String] {
        self.node_resources
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn topology_zone(&self, key: &str, value: &str) -> Option<&TopologyZone> {
        self.topology_zones
            .get(&(key.to_string(), value.to_string()))
    }

    pub fn network_module(&self, id: &str) -> Option<&NetworkModule> {
        self.network_modules.get(id)
    }

    /// The account chain from `id` up to the root, following parents
    pub fn account_ancestry(&self, id: &str) -> Vec<&Account> {
        let mut chain = Vec::new();
        let mut current = self.accounts.get(id);
        while let Some(account) = current {
            chain.push(account);
            current = account
                .parent_id
                .as_deref()
                .and_then(|parent| self.accounts.get(parent));
        }
        chain
    }

    /// True if placing one more pod of `pod_set_id` on `node_id` satisfies
    /// every antiaffinity constraint of the set
    pub fn has_antiaffinity_vacancy(&self, node_id: &str, pod_set_id: &str) -> bool {
        let Some(node) = self.nodes.get(node_id) else {
            return false;
        };
        let Some(pod_set) = self.pod_sets.get(pod_set_id) else {
            return false;
        };
        pod_set.antiaffinity_constraints.iter().all(|constraint| {
            match node.topology.get(&constraint.key) {
                Some(value) => self
                    .topology_zones
                    .get(&(constraint.key.clone(), value.clone()))
                    .map(|zone| zone.vacancies(pod_set_id, constraint) > 0)
                    .unwrap_or(constraint.max_pods > 0),
                // Node does not participate in this topology key; the
                // constraint cannot bind there.
                None => true,
            }
        })
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Owns the current snapshot and replaces it atomically on load
pub struct Cluster {
    reader: Arc<dyn ClusterReader>,
    current: RwLock<Option<Arc<ClusterSnapshot>>>,
}

impl Cluster {
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self {
            reader,
            current: RwLock::new(None),
        }
    }

    /// The last successfully loaded snapshot
    pub fn snapshot(&self) -> Option<Arc<ClusterSnapshot>> {
        self.current.read().clone()
    }

    /// Load a fresh snapshot.
    ///
    /// Atomic: on any failure the previous snapshot stays current and the
    /// error is returned. Timestamps must strictly increase across loads.
    pub async fn load_snapshot(&self) -> SnapshotResult<Arc<ClusterSnapshot>> {
        let previous_timestamp = self
            .current
            .read()
            .as_ref()
            .map(|snapshot| snapshot.timestamp)
            .unwrap_or(0);

        let snapshot = self.do_load(previous_timestamp).await.map_err(|error| {
            warn!(%error, "Cluster snapshot load failed; keeping previous snapshot");
            error
        })?;

        let snapshot = Arc::new(snapshot);
        *self.current.write() = Some(snapshot.clone());
        info!(
            timestamp = snapshot.timestamp,
            node_count = snapshot.node_count(),
            pod_count = snapshot.pod_count(),
            "Finished loading cluster snapshot"
        );
        Ok(snapshot)
    }

    async fn do_load(&self, previous_timestamp: u64) -> SnapshotResult<ClusterSnapshot> {
        let timestamp = self.reader.start_transaction().await?;
        if timestamp <= previous_timestamp {
            return Err(SnapshotError::NonMonotonicTimestamp {
                current: previous_timestamp,
                loaded: timestamp,
            });
        }

        // Load phases in dependency order; each phase cross-links against
        // the previous ones.
        let address_pools = register("address pool", self.reader.read_address_pools().await?, |p| {
            p.id.clone()
        })?;

        let mut internet_addresses = register(
            "internet address",
            self.reader.read_internet_addresses().await?,
            |a| a.id.clone(),
        )?;
        internet_addresses.retain(|id, address| {
            if address_pools.contains_key(&address.pool_id) {
                true
            } else {
                warn!(
                    internet_address = %id,
                    pool = %address.pool_id,
                    "Internet address refers to an unknown address pool; dropping it"
                );
                false
            }
        });

        let nodes = register("node", self.reader.read_nodes().await?, |n| n.id.clone())?;

        let mut accounts =
            register("account", self.reader.read_accounts().await?, |a| a.id.clone())?;
        link_accounts(&mut accounts);

        let node_segments = register(
            "node segment",
            self.reader.read_node_segments().await?,
            |s| s.id.clone(),
        )?;

        let mut pod_sets =
            register("pod set", self.reader.read_pod_sets().await?, |s| s.id.clone())?;
        pod_sets.retain(|id, pod_set| {
            if !accounts.contains_key(&pod_set.account_id) {
                warn!(
                    pod_set = %id,
                    account = %pod_set.account_id,
                    "Pod set refers to an unknown account; dropping it"
                );
                return false;
            }
            if !node_segments.contains_key(&pod_set.node_segment_id) {
                warn!(
                    pod_set = %id,
                    segment = %pod_set.node_segment_id,
                    "Pod set refers to an unknown node segment; dropping it"
                );
                return false;
            }
            true
        });

        let mut pods = register("pod", self.reader.read_pods().await?, |p| p.id.clone())?;
        pods.retain(|id, pod| {
            if !pod_sets.contains_key(&pod.pod_set_id) {
                warn!(
                    pod = %id,
                    pod_set = %pod.pod_set_id,
                    "Pod refers to an unknown pod set; dropping it"
                );
                return false;
            }
            if let Some(node_id) = &pod.node_id {
                if !nodes.contains_key(node_id) {
                    warn!(
                        pod = %id,
                        node = %node_id,
                        "Pod is placed on an unknown node; clearing the placement"
                    );
                    pod.node_id = None;
                }
            }
            if let Some(account_id) = &pod.account_id {
                if !accounts.contains_key(account_id) {
                    warn!(
                        pod = %id,
                        account = %account_id,
                        "Pod overrides an unknown account; falling back to the pod set account"
                    );
                    pod.account_id = None;
                }
            }
            true
        });

        let mut resources =
            register("resource", self.reader.read_resources().await?, |r| r.id.clone())?;
        resources.retain(|id, resource| {
            if nodes.contains_key(&resource.node_id) {
                true
            } else {
                warn!(
                    resource = %id,
                    node = %resource.node_id,
                    "Resource refers to an unknown node; dropping it"
                );
                false
            }
        });

        // Derived indexes.
        let mut node_pods: HashMap<String, Vec<String>> = HashMap::new();
        let mut pod_set_pods: HashMap<String, Vec<String>> = HashMap::new();
        let mut account_pods: HashMap<String, Vec<String>> = HashMap::new();
        for pod in pods.values() {
            if let Some(node_id) = &pod.node_id {
                node_pods
                    .entry(node_id.clone())
                    .or_default()
                    .push(pod.id.clone());
            }
            pod_set_pods
                .entry(pod.pod_set_id.clone())
                .or_default()
                .push(pod.id.clone());
            let pod_set = &pod_sets[&pod.pod_set_id];
            account_pods
                .entry(pod.effective_account_id(pod_set).to_string())
                .or_default()
                .push(pod.id.clone());
        }

        let mut node_resources: HashMap<String, Vec<String>> = HashMap::new();
        for resource in resources.values() {
            node_resources
                .entry(resource.node_id.clone())
                .or_default()
                .push(resource.id.clone());
        }

        let mut segment_nodes: HashMap<String, Vec<String>> = HashMap::new();
        for segment in node_segments.values() {
            let filter = match SchedulingTagFilter::parse(&segment.node_filter) {
                Ok(filter) => filter,
                Err(error) => {
                    warn!(
                        segment = %segment.id,
                        %error,
                        "Node segment carries an unparsable filter; treating it as empty"
                    );
                    SchedulingTagFilter::empty()
                }
            };
            let mut selected: Vec<String> = nodes
                .values()
                .filter(|node| filter.can_schedule(&node.tags))
                .map(|node| node.id.clone())
                .collect();
            selected.sort();
            segment_nodes.insert(segment.id.clone(), selected);
        }

        let mut topology_zones: HashMap<(String, String), TopologyZone> = HashMap::new();
        for node in nodes.values() {
            for (key, value) in &node.topology {
                let zone = topology_zones
                    .entry((key.clone(), value.clone()))
                    .or_insert_with(|| TopologyZone {
                        key: key.clone(),
                        value: value.clone(),
                        ..TopologyZone::default()
                    });
                zone.node_ids.insert(node.id.clone());
            }
        }
        // Antiaffinity vacancies: count placed pods per (zone, pod set).
        for pod in pods.values() {
            let Some(node_id) = &pod.node_id else {
                continue;
            };
            let node = &nodes[node_id];
            for (key, value) in &node.topology {
                if let Some(zone) = topology_zones.get_mut(&(key.clone(), value.clone())) {
                    *zone
                        .pod_set_counts
                        .entry(pod.pod_set_id.clone())
                        .or_insert(0) += 1;
                }
            }
        }

        let mut network_modules: HashMap<String, NetworkModule> = HashMap::new();
        for address in internet_addresses.values() {
            let module = network_modules
                .entry(address.network_module_id.clone())
                .or_default();
            module.internet_address_count += 1;
            if address.assigned_pod_id.is_some() {
                module.allocated_internet_address_count += 1;
            }
        }

        Ok(ClusterSnapshot {
            timestamp,
            address_pools,
            internet_addresses,
            nodes,
            accounts,
            node_segments,
            pod_sets,
            pods,
            resources,
            node_pods,
            pod_set_pods,
            account_pods,
            segment_nodes,
            node_resources,
            topology_zones,
            network_modules,
        })
    }
}

/// Build an id-keyed map, rejecting duplicate ids
fn register<T>(
    kind: &'static str,
    objects: Vec<T>,
    id_of: impl Fn(&T) -> String,
) -> SnapshotResult<HashMap<String, T>> {
    let mut map = HashMap::with_capacity(objects.len());
    for object in objects {
        let id = id_of(&object);
        if map.insert(id.clone(), object).is_some() {
            return Err(SnapshotError::DuplicateId { kind, id });
        }
    }
    Ok(map)
}

/// Clear dangling parent links and break cycles in the account hierarchy.
///
/// The hierarchy must be a proper tree; a cycle would hang every ancestry
/// walk, so the link closing the cycle is cut.
fn link_accounts(accounts: &mut HashMap<String, Account>) {
    let ids: Vec<String> = accounts.keys().cloned().collect();
    for id in &ids {
        let parent_id = accounts[id].parent_id.clone();
        if let Some(parent_id) = parent_id {
            if !accounts.contains_key(&parent_id) {
                warn!(
                    account = %id,
                    parent = %parent_id,
                    "Account refers to an unknown parent; clearing the link"
                );
                if let Some(account) = accounts.get_mut(id) {
                    account.parent_id = None;
                }
            }
        }
    }
    for id in &ids {
        let mut visited = HashSet::new();
        let mut current = id.clone();
        while let Some(parent_id) = accounts.get(&current).and_then(|a| a.parent_id.clone()) {
            if !visited.insert(current.clone()) {
                warn!(
                    account = %current,
                    "Cycle detected in account hierarchy; cutting the parent link"
                );
                if let Some(account) = accounts.get_mut(&current) {
                    account.parent_id = None;
                }
                break;
            }
            current = parent_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::PodState;
    use atoll_core::{DiskQuota, JobResources};
    use parking_lot::Mutex;

    /// Scripted in-memory reader
    #[derive(Default)]
    struct FakeReader {
        timestamp: Mutex<u64>,
        nodes: Vec<NodeRecord>,
        accounts: Vec<Account>,
        segments: Vec<NodeSegment>,
        pod_sets: Vec<PodSet>,
        pods: Vec<Pod>,
        fail_pods: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ClusterReader for FakeReader {
        async fn start_transaction(&self) -> SnapshotResult<u64> {
            let mut timestamp = self.timestamp.lock();
            *timestamp += 1;
            Ok(*timestamp)
        }

        async fn read_address_pools(&self) -> SnapshotResult<Vec<AddressPool>> {
            Ok(Vec::new())
        }

        async fn read_internet_addresses(&self) -> SnapshotResult<Vec<InternetAddress>> {
            Ok(Vec::new())
        }

        async fn read_nodes(&self) -> SnapshotResult<Vec<NodeRecord>> {
            Ok(self.nodes.clone())
        }

        async fn read_accounts(&self) -> SnapshotResult<Vec<Account>> {
            Ok(self.accounts.clone())
        }

        async fn read_node_segments(&self) -> SnapshotResult<Vec<NodeSegment>> {
            Ok(self.segments.clone())
        }

        async fn read_pod_sets(&self) -> SnapshotResult<Vec<PodSet>> {
            Ok(self.pod_sets.clone())
        }

        async fn read_pods(&self) -> SnapshotResult<Vec<Pod>> {
            if self.fail_pods.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(SnapshotError::Reader("pods table unavailable".to_string()));
            }
            Ok(self.pods.clone())
        }

        async fn read_resources(&self) -> SnapshotResult<Vec<ResourceRecord>> {
            Ok(Vec::new())
        }
    }

    fn node(id: &str, tags: &[&str], topology: &[(&str, &str)]) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            address: format!("{id}.cluster:9012"),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            topology: topology
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            schedulable: true,
        }
    }

    fn pod(id: &str, pod_set: &str, node: Option<&str>) -> Pod {
        Pod {
            id: id.to_string(),
            pod_set_id: pod_set.to_string(),
            node_id: node.map(|n| n.to_string()),
            account_id: None,
            state: PodState::Running,
            resource_requests: JobResources::zero(),
            disk_requests: DiskQuota::new(),
        }
    }

    fn pod_set(id: &str, account: &str, segment: &str) -> PodSet {
        PodSet {
            id: id.to_string(),
            account_id: account.to_string(),
            node_segment_id: segment.to_string(),
            antiaffinity_constraints: vec![AntiaffinityConstraint {
                key: "rack".to_string(),
                max_pods: 1,
            }],
        }
    }

    fn reader() -> FakeReader {
        FakeReader {
            nodes: vec![
                node("n1", &["prod"], &[("rack", "r1")]),
                node("n2", &["prod"], &[("rack", "r2")]),
                node("n3", &["dev"], &[("rack", "r1")]),
            ],
            accounts: vec![
                Account {
                    id: "root".to_string(),
                    parent_id: None,
                },
                Account {
                    id: "analytics".to_string(),
                    parent_id: Some("root".to_string()),
                },
            ],
            segments: vec![NodeSegment {
                id: "default".to_string(),
                node_filter: "prod".to_string(),
            }],
            pod_sets: vec![pod_set("ps1", "analytics", "default")],
            pods: vec![pod("p1", "ps1", Some("n1")), pod("p2", "ps1", None)],
            ..FakeReader::default()
        }
    }

    #[tokio::test]
    async fn test_load_builds_indexes() {
        let cluster = Cluster::new(Arc::new(reader()));
        let snapshot = cluster.load_snapshot().await.unwrap();

        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.pods_of_node("n1"), &["p1".to_string()]);
        assert_eq!(snapshot.pods_of_pod_set("ps1").len(), 2);
        assert_eq!(snapshot.pods_of_account("analytics").len(), 2);
        assert_eq!(
            snapshot.nodes_of_segment("default"),
            &["n1".to_string(), "n2".to_string()]
        );
        let ancestry = snapshot.account_ancestry("analytics");
        assert_eq!(ancestry.len(), 2);
        assert_eq!(ancestry[1].id, "root");
    }

    #[tokio::test]
    async fn test_antiaffinity_vacancies() {
        let cluster = Cluster::new(Arc::new(reader()));
        let snapshot = cluster.load_snapshot().await.unwrap();

        // Rack r1 already holds p1 of ps1 and the constraint allows one per
        // rack, so n1 and n3 are full while n2 is free.
        assert!(!snapshot.has_antiaffinity_vacancy("n1", "ps1"));
        assert!(!snapshot.has_antiaffinity_vacancy("n3", "ps1"));
        assert!(snapshot.has_antiaffinity_vacancy("n2", "ps1"));
    }

    #[tokio::test]
    async fn test_dangling_account_parent_is_cleared() {
        let mut fake = reader();
        fake.accounts = vec![Account {
            id: "analytics".to_string(),
            parent_id: Some("missing".to_string()),
        }];
        let cluster = Cluster::new(Arc::new(fake));
        let snapshot = cluster.load_snapshot().await.unwrap();

        // The account survives with its parent pointer cleared; the parent
        // is never materialized.
        let account = snapshot.account("analytics").unwrap();
        assert_eq!(account.parent_id, None);
        assert!(snapshot.account("missing").is_none());
        assert_eq!(snapshot.account_ancestry("analytics").len(), 1);
    }

    #[tokio::test]
    async fn test_account_cycle_is_broken() {
        let mut fake = reader();
        fake.accounts = vec![
            Account {
                id: "a".to_string(),
                parent_id: Some("b".to_string()),
            },
            Account {
                id: "b".to_string(),
                parent_id: Some("a".to_string()),
            },
        ];
        fake.pod_sets = Vec::new();
        fake.pods = Vec::new();
        let cluster = Cluster::new(Arc::new(fake));
        let snapshot = cluster.load_snapshot().await.unwrap();

        // Ancestry terminates for both accounts.
        assert!(snapshot.account_ancestry("a").len() <= 2);
        assert!(snapshot.account_ancestry("b").len() <= 2);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_snapshot() {
        let fake = Arc::new(reader());
        let cluster = Cluster::new(fake.clone());
        let first = cluster.load_snapshot().await.unwrap();

        fake.fail_pods
            .store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(cluster.load_snapshot().await.is_err());

        // The previously loaded snapshot is still current.
        let current = cluster.snapshot().unwrap();
        assert_eq!(current.timestamp(), first.timestamp());

        // A later healthy load replaces it with a newer timestamp.
        fake.fail_pods
            .store(false, std::sync::atomic::Ordering::Relaxed);
        let second = cluster.load_snapshot().await.unwrap();
        assert!(second.timestamp() > first.timestamp());
    }

    #[tokio::test]
    async fn test_dangling_pod_placement_is_cleared() {
        let mut fake = reader();
        fake.pods.push(pod("p3", "ps1", Some("missing-node")));
        let cluster = Cluster::new(Arc::new(fake));
        let snapshot = cluster.load_snapshot().await.unwrap();

        let p3 = snapshot.pod("p3").unwrap();
        assert_eq!(p3.node_id, None);
    }
}
