//! Reconciliation of the network interfaces of one partition.
//!
//! The agent reads fabric objects from the fabric cluster and writes the
//! metalnet mirror of each interface into the partition's host cluster.

pub mod firewall;
pub mod network_interface;


use crds::metalnet;
use crds::{LoadBalancer, LoadBalancerRouting, NATTable, Network, NetworkInterface, NetworkPolicyRule};
use fabric_client::{KubeClient, ObjectClient, ObjectKey};
use fabric_runtime::{IndexingMap, ReverseMapIndex, SourceLabels};
use k8s_openapi::api::core::v1::Node as HostNode;
use std::fmt;
use std::sync::Arc;

/// Field manager of every server-side apply issued by the agent
pub const FIELD_MANAGER: &str = "partition-agent";

/// Name of the reverse index from a dependency to the interfaces using it
pub const INDEX_DEPENDENCY: &str = "dependency";

/// Dependency value of a host node
pub fn host_node_dependency(name: &str) -> String {
    format!("node:{name}")
}

/// Dependency value of a network
pub fn network_dependency(namespace: &str, name: &str) -> String {
    format!("network:{namespace}/{name}")
}

/// Dependency value of a load balancer and its routing
pub fn load_balancer_dependency(namespace: &str, name: &str) -> String {
    format!("loadbalancer:{namespace}/{name}")
}

/// Dependency value of a network policy rule
pub fn policy_dependency(namespace: &str, name: &str) -> String {
    format!("policy:{namespace}/{name}")
}

/// API clients of both clusters
#[derive(Clone)]
pub struct Clients {
    pub(crate) network_interfaces: Arc<dyn ObjectClient<NetworkInterface>>,
    pub(crate) networks: Arc<dyn ObjectClient<Network>>,
    pub(crate) nat_tables: Arc<dyn ObjectClient<NATTable>>,
    pub(crate) load_balancers: Arc<dyn ObjectClient<LoadBalancer>>,
    pub(crate) load_balancer_routings: Arc<dyn ObjectClient<LoadBalancerRouting>>,
    pub(crate) network_policy_rules: Arc<dyn ObjectClient<NetworkPolicyRule>>,
    /// Dataplane mirrors in the host cluster
    pub(crate) mirrors: Arc<dyn ObjectClient<metalnet::NetworkInterface>>,
    /// Nodes of the host cluster
    pub(crate) host_nodes: Arc<dyn ObjectClient<HostNode>>,
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}

impl Clients {
    /// Clients reading `fabric` and writing mirrors through `host`
    pub fn from_kube(fabric: &KubeClient, host: &KubeClient) -> Self {
        Self {
            network_interfaces: Arc::new(fabric.clone()),
            networks: Arc::new(fabric.clone()),
            nat_tables: Arc::new(fabric.clone()),
            load_balancers: Arc::new(fabric.clone()),
            load_balancer_routings: Arc::new(fabric.clone()),
            network_policy_rules: Arc::new(fabric.clone()),
            mirrors: Arc::new(host.clone()),
            host_nodes: Arc::new(host.clone()),
        }
    }
}

/// Shared reconciliation context.
pub struct Reconciler {
    pub(crate) clients: Clients,
    /// Partition served by this agent
    pub(crate) partition_name: String,
    /// Namespace of the mirrors in the host cluster
    pub(crate) host_namespace: String,
    pub(crate) source_labels: SourceLabels,
    /// Interfaces by the objects their mirror was derived from
    pub(crate) dependencies: IndexingMap<ObjectKey, Vec<String>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("partition_name", &self.partition_name)
            .field("host_namespace", &self.host_namespace)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Context for `partition_name`, writing mirrors into `host_namespace`
    pub fn new(clients: Clients, partition_name: impl Into<String>, host_namespace: impl Into<String>) -> Self {
        let dependencies = IndexingMap::new();
        dependencies.register_index(INDEX_DEPENDENCY, ReverseMapIndex::new(|deps: &Vec<String>| deps.clone()));
        Self {
            clients,
            partition_name: partition_name.into(),
            host_namespace: host_namespace.into(),
            source_labels: SourceLabels::default(),
            dependencies,
        }
    }

    /// Interfaces whose mirror depends on `dependency`
    pub fn dependents(&self, dependency: &str) -> Vec<ObjectKey> {
        self.dependencies.lookup(INDEX_DEPENDENCY, dependency)
    }
}
