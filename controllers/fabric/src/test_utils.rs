//! Test utilities for unit testing reconcilers
//!
//! [`TestEnv`] wires a [`Reconciler`] to in-memory stores so tests can seed
//! objects, drive reconciles to a fixed point and inspect the results.

use crate::error::ControllerError;
use crate::reconciler::{Clients, Reconciler};
use crds::*;
use fabric_client::{MemoryClient, MemoryEventRecorder, ObjectKey};
use fabric_runtime::{Action, Managed, reconcile_managed, requeue};
use ipam::{IPSet, PublicIPAllocator, ReleasedReceiver, VNIAllocator};
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;

/// Namespace of every namespaced fixture
pub const NAMESPACE: &str = "default";
/// Name of the cluster under test in broker owner references
pub const CLUSTER: &str = "edge";

const MAX_PASSES: usize = 16;

/// In-memory store per resource kind
#[derive(Default)]
pub struct Stores {
    pub public_ips: MemoryClient<PublicIP>,
    pub ips: MemoryClient<IP>,
    pub ip_addresses: MemoryClient<IPAddress>,
    pub virtual_ips: MemoryClient<VirtualIP>,
    pub networks: MemoryClient<Network>,
    pub network_ids: MemoryClient<NetworkID>,
    pub nat_gateways: MemoryClient<NATGateway>,
    pub nat_tables: MemoryClient<NATTable>,
    pub nat_autoscalers: MemoryClient<NATGatewayAutoscaler>,
    pub network_interfaces: MemoryClient<NetworkInterface>,
    pub load_balancers: MemoryClient<LoadBalancer>,
    pub load_balancer_routings: MemoryClient<LoadBalancerRouting>,
    pub daemon_sets: MemoryClient<DaemonSet>,
    pub instances: MemoryClient<Instance>,
    pub nodes: MemoryClient<Node>,
    pub network_policies: MemoryClient<NetworkPolicy>,
    pub network_policy_rules: MemoryClient<NetworkPolicyRule>,
    /// `IP` store of the backing cluster
    pub backing_ips: MemoryClient<IP>,
    pub events: MemoryEventRecorder,
}

impl Stores {
    fn clients(&self) -> Clients {
        Clients {
            public_ips: Arc::new(self.public_ips.clone()),
            ips: Arc::new(self.ips.clone()),
            ip_addresses: Arc::new(self.ip_addresses.clone()),
            virtual_ips: Arc::new(self.virtual_ips.clone()),
            networks: Arc::new(self.networks.clone()),
            network_ids: Arc::new(self.network_ids.clone()),
            nat_gateways: Arc::new(self.nat_gateways.clone()),
            nat_tables: Arc::new(self.nat_tables.clone()),
            nat_autoscalers: Arc::new(self.nat_autoscalers.clone()),
            network_interfaces: Arc::new(self.network_interfaces.clone()),
            load_balancers: Arc::new(self.load_balancers.clone()),
            load_balancer_routings: Arc::new(self.load_balancer_routings.clone()),
            daemon_sets: Arc::new(self.daemon_sets.clone()),
            instances: Arc::new(self.instances.clone()),
            nodes: Arc::new(self.nodes.clone()),
            network_policies: Arc::new(self.network_policies.clone()),
            network_policy_rules: Arc::new(self.network_policy_rules.clone()),
        }
    }
}

/// Stores plus a reconciler wired to them
pub struct TestEnv {
    stores: Stores,
    pub reconciler: Arc<Reconciler>,
    pub ip_released: ReleasedReceiver,
    pub vni_released: ReleasedReceiver,
    prefixes: Vec<IpNet>,
    vnis: (i32, i32),
    proxied: bool,
}

impl Deref for TestEnv {
    type Target = Stores;

    fn deref(&self) -> &Stores {
        &self.stores
    }
}

fn parse_prefixes(prefixes: &[&str]) -> Vec<IpNet> {
    prefixes.iter().map(|p| p.parse().unwrap()).collect()
}

impl TestEnv {
    /// Environment allocating from `prefixes` and VNIs `1..=100`
    pub fn new(prefixes: &[&str]) -> Self {
        Self::with_vnis(prefixes, 1, 100)
    }

    /// Environment allocating from `prefixes` and VNIs `min..=max`
    pub fn with_vnis(prefixes: &[&str], min: i32, max: i32) -> Self {
        Self::wire(Stores::default(), parse_prefixes(prefixes), (min, max), false)
    }

    /// Environment proxying broker-annotated virtual IPs to `backing_ips`
    pub fn proxied(prefixes: &[&str]) -> Self {
        Self::wire(Stores::default(), parse_prefixes(prefixes), (1, 100), true)
    }

    /// Fresh allocators and reconciler over the same stores, as after a restart
    pub fn restart(self) -> Self {
        Self::wire(self.stores, self.prefixes, self.vnis, self.proxied)
    }

    fn wire(stores: Stores, prefixes: Vec<IpNet>, vnis: (i32, i32), proxied: bool) -> Self {
        let (ip_allocator, ip_released) = PublicIPAllocator::new(IPSet::from_prefixes(&prefixes));
        let (vni_allocator, vni_released) = VNIAllocator::new(vnis.0, vnis.1).unwrap();
        let mut reconciler = Reconciler::new(
            stores.clients(),
            Arc::new(stores.events.clone()),
            Arc::new(ip_allocator),
            Arc::new(vni_allocator),
            CLUSTER,
        );
        if proxied {
            reconciler = reconciler.with_backing(Arc::new(stores.backing_ips.clone()));
        }
        Self {
            stores,
            reconciler: Arc::new(reconciler),
            ip_released,
            vni_released,
            prefixes,
            vnis,
            proxied,
        }
    }
}

/// Key of the fixture named `name`
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced(NAMESPACE, name)
}

/// Run `managed` on `key` until it stops asking for a requeue
pub async fn settle_managed<M>(managed: &M, key: &ObjectKey) -> Action
where
    M: Managed<Error = ControllerError>,
{
    for _ in 0..MAX_PASSES {
        let action = reconcile_managed(managed, key).await.unwrap();
        if action != requeue() {
            return action;
        }
    }
    panic!("{key} did not settle");
}

/// Run `reconciler` on `key` until it stops asking for a requeue
pub async fn settle<R>(reconciler: &R, key: &ObjectKey) -> Action
where
    R: fabric_runtime::Reconciler<Error = ControllerError>,
{
    for _ in 0..MAX_PASSES {
        let action = reconciler.reconcile(key).await.unwrap();
        if action != requeue() {
            return action;
        }
    }
    panic!("{key} did not settle");
}

/// Status and reason of the `Allocated` condition, if set
pub fn allocated(conditions: &[Condition]) -> Option<(ConditionStatus, String)> {
    find_condition(conditions, CONDITION_ALLOCATED).map(|c| (c.status, c.reason.clone()))
}

/// `Allocated=True`
pub fn is_allocated(conditions: &[Condition]) -> bool {
    is_condition_true(conditions, CONDITION_ALLOCATED)
}

/// `Allocated=False` with `reason`
pub fn not_allocated(reason: &str) -> Option<(ConditionStatus, String)> {
    Some((ConditionStatus::False, reason.to_string()))
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

/// `obj` with `labels` added
pub fn labeled<K: Resource>(mut obj: K, labels: &[(&str, &str)]) -> K {
    obj.meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    obj
}

/// Controller owner reference pointing at `owner`
pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    owner.controller_owner_ref(&()).unwrap()
}

pub fn public_ip(name: &str, families: &[IpFamily], ips: &[&str]) -> PublicIP {
    PublicIP {
        metadata: meta(name),
        spec: PublicIPSpec {
            ip_families: families.to_vec(),
            ips: ips.iter().map(|ip| addr(ip)).collect(),
        },
        status: None,
    }
}

/// `IP` of the family of `literal`, IPv4 when dynamic
pub fn ip(name: &str, literal: Option<&str>) -> IP {
    let literal = literal.map(addr);
    IP {
        metadata: meta(name),
        spec: IPSpec {
            type_: IPType::Public,
            ip_family: literal.as_ref().map_or(IpFamily::IPv4, IpFamily::of),
            ip: literal,
            claim_ref: None,
        },
        status: None,
    }
}

pub fn virtual_ip(name: &str, literal: Option<&str>) -> VirtualIP {
    let literal = literal.map(addr);
    VirtualIP {
        metadata: meta(name),
        spec: VirtualIPSpec {
            type_: VirtualIPType::Public,
            ip_family: literal.as_ref().map_or(IpFamily::IPv4, IpFamily::of),
            ip: literal,
        },
        status: None,
    }
}

/// `VirtualIP` proxied to the backing `IP` `remote` in `NAMESPACE`
pub fn brokered_virtual_ip(name: &str, remote: &str) -> VirtualIP {
    let reference = BrokerControllerReference {
        namespace: NAMESPACE.to_string(),
        name: remote.to_string(),
    };
    let mut vip = virtual_ip(name, None);
    vip.metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_BROKER_CONTROLLER.to_string(),
        serde_json::to_string(&reference).unwrap(),
    )]));
    vip
}

pub fn network(name: &str, vni: Option<i32>) -> Network {
    Network {
        metadata: meta(name),
        spec: NetworkSpec {
            vni,
            peerings: Vec::new(),
        },
        status: None,
    }
}

pub fn peering(name: &str, id: i32) -> NetworkPeering {
    NetworkPeering {
        name: name.to_string(),
        id: id.to_string(),
        prefixes: Vec::new(),
    }
}

pub fn nat_gateway(name: &str, net: &str, ips: &[(&str, Option<&str>)], ports: i32) -> NATGateway {
    NATGateway {
        metadata: meta(name),
        spec: NATGatewaySpec {
            ip_family: IpFamily::IPv4,
            network_ref: LocalObjectReference::new(net),
            ips: ips
                .iter()
                .map(|(ip_name, ip)| NATGatewayIP {
                    name: ip_name.to_string(),
                    ip: ip.map(addr),
                })
                .collect(),
            ports_per_network_interface: ports,
        },
        status: None,
    }
}

pub fn autoscaler(name: &str, gateway: &str, min: Option<i32>, max: Option<i32>) -> NATGatewayAutoscaler {
    NATGatewayAutoscaler {
        metadata: meta(name),
        spec: NATGatewayAutoscalerSpec {
            nat_gateway_ref: LocalObjectReference::new(gateway),
            min_public_ips: min,
            max_public_ips: max,
        },
        status: None,
    }
}

pub fn nic(name: &str, net: &str, ips: &[&str]) -> NetworkInterface {
    NetworkInterface {
        metadata: meta(name),
        spec: NetworkInterfaceSpec {
            network_ref: LocalObjectReference::new(net),
            node_ref: None,
            ips: ips.iter().map(|ip| addr(ip)).collect(),
            public_ips: Vec::new(),
            prefixes: Vec::new(),
            nat_claim_refs: Vec::new(),
        },
        status: None,
    }
}

pub fn load_balancer(
    name: &str,
    net: &str,
    type_: LoadBalancerType,
    ips: &[(&str, Option<&str>)],
) -> LoadBalancer {
    LoadBalancer {
        metadata: meta(name),
        spec: LoadBalancerSpec {
            type_,
            network_ref: LocalObjectReference::new(net),
            ips: ips
                .iter()
                .map(|(ip_name, ip)| LoadBalancerIP {
                    name: ip_name.to_string(),
                    ip_family: IpFamily::IPv4,
                    ip: ip.map(addr),
                })
                .collect(),
            ports: vec![LoadBalancerPort {
                protocol: Some(Protocol::Tcp),
                port: 443,
                end_port: None,
            }],
            network_interface_selector: None,
            node_selector: None,
        },
        status: None,
    }
}

/// Cluster-scoped `Node` with `labels`
pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    labeled(
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: NodeSpec { unschedulable: false },
        },
        labels,
    )
}

pub fn selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        match_expressions: Vec::new(),
    }
}

pub fn instance_spec(net: &str) -> InstanceSpec {
    InstanceSpec {
        type_: InstanceType::LoadBalancer,
        load_balancer_type: Some(LoadBalancerType::Public),
        network_ref: LocalObjectReference::new(net),
        ips: vec![addr("203.0.113.10")],
        load_balancer_ports: Vec::new(),
        node_ref: None,
        affinity: None,
        topology_spread_constraints: Vec::new(),
    }
}

/// `DaemonSet` selecting `app=<name>` instances
pub fn daemon_set(name: &str, node_selector: Option<LabelSelector>) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    DaemonSet {
        metadata: meta(name),
        spec: DaemonSetSpec {
            selector: LabelSelector {
                match_labels: labels.clone(),
                match_expressions: Vec::new(),
            },
            node_selector,
            template: InstanceTemplate {
                labels,
                spec: instance_spec("net"),
            },
        },
        status: None,
    }
}

pub fn instance(name: &str, spec: InstanceSpec) -> Instance {
    Instance {
        metadata: meta(name),
        spec,
    }
}

pub fn network_policy(name: &str, net: &str, labels: &[(&str, &str)]) -> NetworkPolicy {
    NetworkPolicy {
        metadata: meta(name),
        spec: NetworkPolicySpec {
            network_ref: LocalObjectReference::new(net),
            network_interface_selector: selector(labels),
            priority: None,
            policy_types: Vec::new(),
            ingress: Vec::new(),
            egress: Vec::new(),
        },
    }
}

pub fn ip_block(cidr: &str, except: &[&str]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: cidr.to_string(),
            except: except.iter().map(|e| e.to_string()).collect(),
        }),
    }
}

pub fn tcp_port(port: i32, end_port: Option<i32>) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some(Protocol::Tcp),
        port: Some(port),
        end_port,
    }
}
