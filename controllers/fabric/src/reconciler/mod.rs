//! Reconciliation logic for the fabric CRDs.
//!
//! One shared [`Reconciler`] context holds the API clients, the allocators,
//! the event recorder and the reverse-lookup indexes. Each resource kind has
//! its own module with a thin handle type implementing either
//! [`fabric_runtime::Managed`] (kinds holding allocator reservations behind a
//! finalizer) or [`fabric_runtime::Reconciler`] (kinds whose outputs are owned
//! objects).

pub mod addresses;
pub mod daemon_set;
pub mod ip;
pub mod load_balancer;
pub mod nat_autoscaler;
pub mod nat_gateway;
pub mod network;
pub mod network_policy;
pub mod owned_ips;
pub mod public_ip;
pub mod scheduler;
pub mod virtual_ip;

#[cfg(test)]
mod daemon_set_test;
#[cfg(test)]
mod ip_test;
#[cfg(test)]
mod nat_autoscaler_test;
#[cfg(test)]
mod nat_gateway_test;
#[cfg(test)]
mod scheduler_test;

use crate::error::ControllerError;
use crds::{
    ClaimRef, Condition, ConditionStatus, DaemonSet, FABRIC_GROUP, IP, IPAddress, Instance,
    LoadBalancer, LoadBalancerRouting, NATGateway, NATGatewayAutoscaler, NATTable, Network,
    NetworkID, NetworkInterface, NetworkPolicy, NetworkPolicyRule, Node, PublicIP, VirtualIP,
    set_condition,
};
use fabric_client::{EventRecorder, FabricEvent, FabricResource, KubeClient, ObjectClient, ObjectKey};
use fabric_runtime::{IndexingMap, ReverseMapIndex};
use ipam::{PublicIPAllocator, VNIAllocator};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::fmt;
use std::sync::Arc;

/// Field manager of every server-side apply issued by this controller
pub const FIELD_MANAGER: &str = "fabric-controller";

/// Name of the reverse index from network to the objects referencing it
pub const INDEX_NETWORK: &str = "network";
/// Name of the reverse index from NAT gateway to its autoscalers
pub const INDEX_GATEWAY: &str = "gateway";
/// Name of the reverse index from VNI to the networks peering with it
pub const INDEX_PEER: &str = "peer";
/// Name of the index listing every entry under [`ALL`]
pub const INDEX_ALL: &str = "all";
/// Value every entry of an [`INDEX_ALL`] index maps to
pub const ALL: &str = "*";

/// Allocator key: the claiming resource plus its namespaced name.
///
/// The resource name keeps `PublicIP`, `IP` and `VirtualIP` claims with the
/// same name apart in the shared public IP allocator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocKey {
    /// Plural resource name, e.g. `publicips`
    pub resource: String,
    /// Namespace of the claimer
    pub namespace: String,
    /// Name of the claimer
    pub name: String,
}

impl AllocKey {
    /// Key of the `resource` object behind `key`
    pub fn new(resource: &str, key: &ObjectKey) -> Self {
        Self {
            resource: resource.to_string(),
            namespace: key.namespace_str().to_string(),
            name: key.name.clone(),
        }
    }

    /// Key recorded in a claim reference
    pub fn of_claim(claim: &ClaimRef) -> Self {
        Self {
            resource: claim.resource.clone(),
            namespace: claim.namespace.clone().unwrap_or_default(),
            name: claim.name.clone(),
        }
    }

    /// Object key of the claimer
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, &self.name)
    }

    /// Claim reference for the claimer with `uid`
    pub fn claim_ref(&self, uid: &str) -> ClaimRef {
        ClaimRef {
            group: FABRIC_GROUP.to_string(),
            resource: self.resource.clone(),
            namespace: Some(self.namespace.clone()),
            name: self.name.clone(),
            uid: uid.to_string(),
        }
    }

    /// Whether `claim` names this key
    pub fn matches(&self, claim: &ClaimRef) -> bool {
        claim.resource == self.resource
            && claim.namespace.as_deref().unwrap_or_default() == self.namespace
            && claim.name == self.name
    }
}

impl fmt::Display for AllocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource, self.namespace, self.name)
    }
}

/// Plural resource names used in allocator keys and claim references
pub mod resources {
    /// `PublicIP`
    pub const PUBLIC_IPS: &str = "publicips";
    /// `IP`
    pub const IPS: &str = "ips";
    /// `VirtualIP`
    pub const VIRTUAL_IPS: &str = "virtualips";
    /// `Network`
    pub const NETWORKS: &str = "networks";
}

/// Event reasons
pub mod reasons {
    /// No public IP left for a request
    pub const FAILED_ALLOCATING_PUBLIC_IP: &str = "FailedAllocatingPublicIP";
    /// No VNI left for a network
    pub const FAILED_ALLOCATING_VNI: &str = "FailedAllocatingVNI";
    /// A literal address or VNI is held by another object
    pub const ALLOCATION_CONFLICT: &str = "AllocationConflict";
    /// No pool serves the requested family
    pub const UNSUPPORTED_FAMILY: &str = "UnsupportedFamily";
    /// Spec cannot be served as written
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A NAT gateway cannot place every interface
    pub const OVER_SUBSCRIBED: &str = "OverSubscribed";
}

/// Status types carrying conditions
pub(crate) trait HasConditions: Default + Clone + serde::Serialize + PartialEq + Send + Sync {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

macro_rules! has_conditions {
    ($($status:ty),* $(,)?) => {
        $(
            impl HasConditions for $status {
                fn conditions(&self) -> &[Condition] {
                    &self.conditions
                }

                fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                    &mut self.conditions
                }
            }
        )*
    };
}

has_conditions!(
    crds::PublicIPStatus,
    crds::IPStatus,
    crds::VirtualIPStatus,
    crds::NetworkStatus,
    crds::NATGatewayStatus,
);

/// API clients, one per resource kind
#[derive(Clone)]
pub struct Clients {
    pub(crate) public_ips: Arc<dyn ObjectClient<PublicIP>>,
    pub(crate) ips: Arc<dyn ObjectClient<IP>>,
    pub(crate) ip_addresses: Arc<dyn ObjectClient<IPAddress>>,
    pub(crate) virtual_ips: Arc<dyn ObjectClient<VirtualIP>>,
    pub(crate) networks: Arc<dyn ObjectClient<Network>>,
    pub(crate) network_ids: Arc<dyn ObjectClient<NetworkID>>,
    pub(crate) nat_gateways: Arc<dyn ObjectClient<NATGateway>>,
    pub(crate) nat_tables: Arc<dyn ObjectClient<NATTable>>,
    pub(crate) nat_autoscalers: Arc<dyn ObjectClient<NATGatewayAutoscaler>>,
    pub(crate) network_interfaces: Arc<dyn ObjectClient<NetworkInterface>>,
    pub(crate) load_balancers: Arc<dyn ObjectClient<LoadBalancer>>,
    pub(crate) load_balancer_routings: Arc<dyn ObjectClient<LoadBalancerRouting>>,
    pub(crate) daemon_sets: Arc<dyn ObjectClient<DaemonSet>>,
    pub(crate) instances: Arc<dyn ObjectClient<Instance>>,
    pub(crate) nodes: Arc<dyn ObjectClient<Node>>,
    pub(crate) network_policies: Arc<dyn ObjectClient<NetworkPolicy>>,
    pub(crate) network_policy_rules: Arc<dyn ObjectClient<NetworkPolicyRule>>,
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients").finish_non_exhaustive()
    }
}

impl Clients {
    /// Clients talking to the API server through `client`
    pub fn from_kube(client: &KubeClient) -> Self {
        Self {
            public_ips: Arc::new(client.clone()),
            ips: Arc::new(client.clone()),
            ip_addresses: Arc::new(client.clone()),
            virtual_ips: Arc::new(client.clone()),
            networks: Arc::new(client.clone()),
            network_ids: Arc::new(client.clone()),
            nat_gateways: Arc::new(client.clone()),
            nat_tables: Arc::new(client.clone()),
            nat_autoscalers: Arc::new(client.clone()),
            network_interfaces: Arc::new(client.clone()),
            load_balancers: Arc::new(client.clone()),
            load_balancer_routings: Arc::new(client.clone()),
            daemon_sets: Arc::new(client.clone()),
            instances: Arc::new(client.clone()),
            nodes: Arc::new(client.clone()),
            network_policies: Arc::new(client.clone()),
            network_policy_rules: Arc::new(client.clone()),
        }
    }
}

/// Reverse-lookup indexes shared between reconcilers and watch mappers
#[derive(Debug)]
pub struct Indexes {
    /// NAT gateways by `<namespace>/<network>`
    pub nat_gateways: IndexingMap<ObjectKey, String>,
    /// Autoscalers by `<namespace>/<gateway>`
    pub nat_autoscalers: IndexingMap<ObjectKey, String>,
    /// Load balancers by `<namespace>/<network>`
    pub load_balancers: IndexingMap<ObjectKey, String>,
    /// Network policies by `<namespace>/<network>`
    pub network_policies: IndexingMap<ObjectKey, String>,
    /// Networks by the VNIs their peerings name
    pub peerings: IndexingMap<ObjectKey, Vec<String>>,
    /// Live daemon sets, revisited on node changes
    pub daemon_sets: IndexingMap<ObjectKey, String>,
    /// Instances no node fits yet, revisited on node changes
    pub unscheduled: IndexingMap<ObjectKey, String>,
}

/// `<namespace>/<name>` index value
pub fn scoped(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl Default for Indexes {
    fn default() -> Self {
        let single = |name: &str| {
            let map = IndexingMap::new();
            map.register_index(name, ReverseMapIndex::new(|value: &String| vec![value.clone()]));
            map
        };
        let peerings = IndexingMap::new();
        peerings.register_index(INDEX_PEER, ReverseMapIndex::new(|ids: &Vec<String>| ids.clone()));
        Self {
            nat_gateways: single(INDEX_NETWORK),
            nat_autoscalers: single(INDEX_GATEWAY),
            load_balancers: single(INDEX_NETWORK),
            network_policies: single(INDEX_NETWORK),
            peerings,
            daemon_sets: single(INDEX_ALL),
            unscheduled: single(INDEX_ALL),
        }
    }
}

/// Shared reconciliation context.
pub struct Reconciler {
    pub(crate) clients: Clients,
    /// `IP` client of the backing cluster, when virtual IPs may be proxied
    pub(crate) backing_ips: Option<Arc<dyn ObjectClient<IP>>>,
    pub(crate) events: Arc<dyn EventRecorder>,
    pub(crate) ip_allocator: Arc<PublicIPAllocator<AllocKey>>,
    pub(crate) vni_allocator: Arc<VNIAllocator<AllocKey>>,
    pub(crate) indexes: Indexes,
    /// Name of this cluster in broker owner references
    pub(crate) cluster_name: String,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("cluster_name", &self.cluster_name)
            .field("proxying", &self.backing_ips.is_some())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Context over `clients` and the two allocators
    pub fn new(
        clients: Clients,
        events: Arc<dyn EventRecorder>,
        ip_allocator: Arc<PublicIPAllocator<AllocKey>>,
        vni_allocator: Arc<VNIAllocator<AllocKey>>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            backing_ips: None,
            events,
            ip_allocator,
            vni_allocator,
            indexes: Indexes::default(),
            cluster_name: cluster_name.into(),
        }
    }

    /// Proxy broker-annotated virtual IPs to `backing_ips`
    #[must_use]
    pub fn with_backing(mut self, backing_ips: Arc<dyn ObjectClient<IP>>) -> Self {
        self.backing_ips = Some(backing_ips);
        self
    }

    /// Publish `event` on `obj`
    pub(crate) async fn record<K: Resource<DynamicType = ()>>(&self, obj: &K, event: FabricEvent) {
        self.events.publish(&obj.object_ref(&()), event).await;
    }

    /// Set `Allocated=False` with `reason` on `obj`, publishing `event` when
    /// the status changed.
    pub(crate) async fn report_not_allocated<K, S>(
        &self,
        client: &dyn ObjectClient<K>,
        obj: &K,
        current: Option<&S>,
        reason: &str,
        event: FabricEvent,
    ) -> Result<(), ControllerError>
    where
        K: FabricResource,
        S: HasConditions,
    {
        let mut status = current.cloned().unwrap_or_default();
        set_condition(
            status.conditions_mut(),
            allocated_condition(false, reason, event.note.clone(), obj.meta().generation),
        );
        if patch_status_if_changed(client, obj, current, &status).await? {
            self.record(obj, event).await;
        }
        Ok(())
    }
}

/// Merge-patch `status` onto `obj` unless it already equals `current`.
///
/// Returns whether a write happened.
pub(crate) async fn patch_status_if_changed<K, S>(
    client: &dyn ObjectClient<K>,
    obj: &K,
    current: Option<&S>,
    desired: &S,
) -> Result<bool, ControllerError>
where
    K: FabricResource,
    S: serde::Serialize + PartialEq,
{
    if current == Some(desired) {
        return Ok(false);
    }
    let patch = serde_json::json!({ "status": desired });
    client.patch_status(&ObjectKey::of(obj), &patch).await?;
    Ok(true)
}

/// `Allocated` condition
pub(crate) fn allocated_condition(
    allocated: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    let status = if allocated {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    Condition::new(crds::CONDITION_ALLOCATED, status, reason, message).with_generation(generation)
}

/// Controller owner reference pointing at `owner`
pub(crate) fn controller_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

/// Whether `obj` is controlled by the object with `uid`
pub(crate) fn is_controlled_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true) && r.uid == uid))
}

/// Controller owner reference of `obj`, if any
pub(crate) fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// UID of `obj`; objects read from the API server always carry one
pub(crate) fn uid_of<K: Resource>(obj: &K) -> Result<String, ControllerError> {
    obj.meta()
        .uid
        .clone()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{} has no uid", ObjectKey::of(obj))))
}

/// Whether two specs serialize identically
pub(crate) fn same_spec<T: serde::Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
