//! Watch event mappers
//!
//! Each function builds the mapper of one related watch: which objects of
//! which controller an event on the watched kind should wake up. Children
//! carrying a controller owner reference are mapped by the runtime itself.

use crate::reconciler::{ALL, INDEX_ALL, INDEX_GATEWAY, INDEX_NETWORK, INDEX_PEER, Reconciler, scoped};
use crds::{IP, NATGateway, Network, NetworkInterface, broker_owners};
use fabric_client::ObjectKey;
use fabric_runtime::IndexingMap;
use std::sync::Arc;

fn by_network(
    reconciler: Arc<Reconciler>,
    index: fn(&Reconciler) -> &IndexingMap<ObjectKey, String>,
) -> impl Fn(&NetworkInterface) -> Vec<ObjectKey> + Send + Sync + 'static {
    move |nic: &NetworkInterface| {
        let namespace = nic.metadata.namespace.as_deref().unwrap_or_default();
        index(&reconciler).lookup(INDEX_NETWORK, &scoped(namespace, &nic.spec.network_ref.name))
    }
}

/// NAT gateways on the network of an interface
pub fn gateways_of_interface(reconciler: Arc<Reconciler>) -> impl Fn(&NetworkInterface) -> Vec<ObjectKey> + Send + Sync {
    by_network(reconciler, |r| &r.indexes.nat_gateways)
}

/// Load balancers on the network of an interface
pub fn load_balancers_of_interface(
    reconciler: Arc<Reconciler>,
) -> impl Fn(&NetworkInterface) -> Vec<ObjectKey> + Send + Sync {
    by_network(reconciler, |r| &r.indexes.load_balancers)
}

/// Network policies on the network of an interface
pub fn policies_of_interface(reconciler: Arc<Reconciler>) -> impl Fn(&NetworkInterface) -> Vec<ObjectKey> + Send + Sync {
    by_network(reconciler, |r| &r.indexes.network_policies)
}

/// The gateway itself plus every other gateway on its network, which may
/// take over the interfaces it claimed.
pub fn gateways_sharing_network(reconciler: Arc<Reconciler>) -> impl Fn(&NATGateway) -> Vec<ObjectKey> + Send + Sync {
    move |gateway: &NATGateway| {
        let own = ObjectKey::of(gateway);
        let mut keys = reconciler
            .indexes
            .nat_gateways
            .lookup(INDEX_NETWORK, &scoped(own.namespace_str(), &gateway.spec.network_ref.name));
        if !keys.contains(&own) {
            keys.push(own);
        }
        keys
    }
}

/// Autoscalers of a gateway
pub fn autoscalers_of_gateway(reconciler: Arc<Reconciler>) -> impl Fn(&NATGateway) -> Vec<ObjectKey> + Send + Sync {
    move |gateway: &NATGateway| {
        let own = ObjectKey::of(gateway);
        reconciler
            .indexes
            .nat_autoscalers
            .lookup(INDEX_GATEWAY, &scoped(own.namespace_str(), &own.name))
    }
}

/// The network itself plus every network peering with its VNI
pub fn network_and_peers(reconciler: Arc<Reconciler>) -> impl Fn(&Network) -> Vec<ObjectKey> + Send + Sync {
    move |network: &Network| {
        let own = ObjectKey::of(network);
        let vni = network.spec.vni.or_else(|| network.status.as_ref().and_then(|s| s.vni));
        let peers = vni
            .map(|vni| reconciler.indexes.peerings.lookup(INDEX_PEER, &vni.to_string()))
            .unwrap_or_default();
        let mut keys: Vec<ObjectKey> = peers.into_iter().filter(|key| key != &own).collect();
        keys.insert(0, own);
        keys
    }
}

/// Every live daemon set, for node events
pub fn all_daemon_sets<K>(reconciler: Arc<Reconciler>) -> impl Fn(&K) -> Vec<ObjectKey> + Send + Sync {
    move |_: &K| reconciler.indexes.daemon_sets.lookup(INDEX_ALL, ALL)
}

/// Every instance waiting for a node, for node events
pub fn unscheduled_instances<K>(reconciler: Arc<Reconciler>) -> impl Fn(&K) -> Vec<ObjectKey> + Send + Sync {
    move |_: &K| reconciler.indexes.unscheduled.lookup(INDEX_ALL, ALL)
}

/// Local virtual IPs pinning a backing `IP` from `cluster_name`
pub fn virtual_ips_pinning(cluster_name: String) -> impl Fn(&IP) -> Vec<ObjectKey> + Send + Sync + 'static {
    move |ip: &IP| match broker_owners(ip.metadata.annotations.as_ref()) {
        Some(Ok(owners)) => owners
            .into_iter()
            .filter(|o| o.cluster_name == cluster_name && o.kind == "VirtualIP")
            .map(|o| ObjectKey::namespaced(o.namespace, o.name))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::{ANNOTATION_BROKER_OWNERS, BrokerOwnerReference, encode_broker_owners};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_interface_maps_to_indexed_gateways() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let key = ObjectKey::namespaced(NAMESPACE, "nat");
        env.reconciler
            .indexes
            .nat_gateways
            .insert(key.clone(), scoped(NAMESPACE, "net"));

        let map = gateways_of_interface(env.reconciler.clone());
        assert_eq!(map(&nic("nic-1", "net", &["192.168.0.1"])), vec![key]);
        assert!(map(&nic("nic-2", "other", &["192.168.0.2"])).is_empty());
    }

    #[tokio::test]
    async fn test_network_wakes_peers() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let peer = ObjectKey::namespaced(NAMESPACE, "peer");
        env.reconciler
            .indexes
            .peerings
            .insert(peer.clone(), vec!["7".to_string()]);

        let keys = network_and_peers(env.reconciler.clone())(&network("net", Some(7)));
        assert_eq!(keys, vec![ObjectKey::namespaced(NAMESPACE, "net"), peer]);
    }

    #[test]
    fn test_backing_ip_maps_to_local_virtual_ips() {
        let owners = vec![
            BrokerOwnerReference {
                cluster_name: "edge".to_string(),
                kind: "VirtualIP".to_string(),
                api_version: "fabric.microscaler.io/v1alpha1".to_string(),
                namespace: "tenant".to_string(),
                name: "vip".to_string(),
                uid: "uid-1".to_string(),
                controller: true,
            },
            BrokerOwnerReference {
                cluster_name: "other".to_string(),
                kind: "VirtualIP".to_string(),
                api_version: "fabric.microscaler.io/v1alpha1".to_string(),
                namespace: "tenant".to_string(),
                name: "vip".to_string(),
                uid: "uid-2".to_string(),
                controller: true,
            },
        ];
        let mut ip = ip("backing", None);
        ip.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_BROKER_OWNERS.to_string(),
            encode_broker_owners(&owners).unwrap(),
        )]));

        assert_eq!(
            virtual_ips_pinning("edge".to_string())(&ip),
            vec![ObjectKey::namespaced("tenant", "vip")]
        );
    }
}
