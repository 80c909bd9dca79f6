//! Test utilities for the partition agent
//!
//! [`TestEnv`] wires a [`Reconciler`] to in-memory stores standing in for the
//! fabric cluster and the partition's host cluster.

use crate::reconciler::{Clients, Reconciler};
use crds::metalnet;
use crds::*;
use fabric_client::{MemoryClient, ObjectKey};
use k8s_openapi::api::core::v1::Node as HostNode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;

/// Namespace of every fabric fixture
pub const NAMESPACE: &str = "default";
/// Namespace of the mirrors in the host cluster
pub const HOST_NAMESPACE: &str = "metalnet";
/// Partition under test
pub const PARTITION: &str = "zone-a";

/// In-memory store per resource kind
#[derive(Default)]
pub struct Stores {
    pub network_interfaces: MemoryClient<NetworkInterface>,
    pub networks: MemoryClient<Network>,
    pub nat_tables: MemoryClient<NATTable>,
    pub load_balancers: MemoryClient<LoadBalancer>,
    pub load_balancer_routings: MemoryClient<LoadBalancerRouting>,
    pub network_policy_rules: MemoryClient<NetworkPolicyRule>,
    pub mirrors: MemoryClient<metalnet::NetworkInterface>,
    pub host_nodes: MemoryClient<HostNode>,
}

/// Stores plus a reconciler wired to them
pub struct TestEnv {
    stores: Stores,
    pub reconciler: Arc<Reconciler>,
}

impl Deref for TestEnv {
    type Target = Stores;

    fn deref(&self) -> &Stores {
        &self.stores
    }
}

impl TestEnv {
    pub fn new() -> Self {
        let stores = Stores::default();
        let clients = Clients {
            network_interfaces: Arc::new(stores.network_interfaces.clone()),
            networks: Arc::new(stores.networks.clone()),
            nat_tables: Arc::new(stores.nat_tables.clone()),
            load_balancers: Arc::new(stores.load_balancers.clone()),
            load_balancer_routings: Arc::new(stores.load_balancer_routings.clone()),
            network_policy_rules: Arc::new(stores.network_policy_rules.clone()),
            mirrors: Arc::new(stores.mirrors.clone()),
            host_nodes: Arc::new(stores.host_nodes.clone()),
        };
        Self {
            stores,
            reconciler: Arc::new(Reconciler::new(clients, PARTITION, HOST_NAMESPACE)),
        }
    }

    /// Mirror of the interface named `name`
    pub fn mirror_of(&self, name: &str) -> Option<metalnet::NetworkInterface> {
        let uid = self.network_interfaces.object(&key(name))?.metadata.uid?;
        self.mirrors.object(&ObjectKey::namespaced(HOST_NAMESPACE, uid))
    }
}

/// Key of the fabric fixture named `name`
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced(NAMESPACE, name)
}

pub fn addr(ip: &str) -> IpAddr {
    ip.parse().unwrap()
}

pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn host_node(name: &str) -> HostNode {
    HostNode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Network with an allocated VNI
pub fn network(name: &str, vni: i32) -> Network {
    Network {
        metadata: meta(name),
        spec: NetworkSpec {
            vni: Some(vni),
            peerings: Vec::new(),
        },
        status: Some(NetworkStatus {
            vni: Some(vni),
            ..Default::default()
        }),
    }
}

/// Interface on `net` scheduled to partition node `node`
pub fn nic(name: &str, net: &str, node: &str, ips: &[&str]) -> NetworkInterface {
    NetworkInterface {
        metadata: meta(name),
        spec: NetworkInterfaceSpec {
            network_ref: LocalObjectReference::new(net),
            node_ref: Some(LocalObjectReference::new(node)),
            ips: ips.iter().map(|ip| addr(ip)).collect(),
            public_ips: Vec::new(),
            prefixes: Vec::new(),
            nat_claim_refs: Vec::new(),
        },
        status: None,
    }
}
