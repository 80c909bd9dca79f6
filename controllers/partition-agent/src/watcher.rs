//! Watch event mappers
//!
//! Events on the objects a mirror is derived from wake the interfaces whose
//! mirror used them, as recorded in the dependency index, plus any interface
//! the object names directly.

use crate::reconciler::{
    Reconciler, host_node_dependency, load_balancer_dependency, network_dependency, policy_dependency,
};
use crds::metalnet;
use crds::{LoadBalancer, LoadBalancerRouting, NATTable, Network, NetworkPolicyRule};
use fabric_client::ObjectKey;
use fabric_runtime::SourceLabels;
use k8s_openapi::api::core::v1::Node as HostNode;
use std::sync::Arc;

fn merge(mut keys: Vec<ObjectKey>, more: Vec<ObjectKey>) -> Vec<ObjectKey> {
    for key in more {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Interfaces whose mirror carries the VNI of a network
pub fn network_dependents(reconciler: Arc<Reconciler>) -> impl Fn(&Network) -> Vec<ObjectKey> + Send + Sync {
    move |network: &Network| {
        let own = ObjectKey::of(network);
        reconciler.dependents(&network_dependency(own.namespace_str(), &own.name))
    }
}

/// Interfaces holding a section of a NAT table
pub fn nat_table_targets(table: &NATTable) -> Vec<ObjectKey> {
    let namespace = table.metadata.namespace.clone().unwrap_or_default();
    let targets = table
        .spec
        .ips
        .iter()
        .flat_map(|ip| ip.sections.iter())
        .filter_map(|section| section.target_ref.as_ref())
        .map(|target| ObjectKey::namespaced(namespace.clone(), target.name.clone()))
        .collect();
    merge(Vec::new(), targets)
}

/// Interfaces a routing sends traffic to, plus those that used to be
pub fn routing_targets(reconciler: Arc<Reconciler>) -> impl Fn(&LoadBalancerRouting) -> Vec<ObjectKey> + Send + Sync {
    move |routing: &LoadBalancerRouting| {
        let own = ObjectKey::of(routing);
        let targets = routing
            .spec
            .destinations
            .iter()
            .filter_map(|d| d.target_ref.as_ref())
            .map(|target| ObjectKey::namespaced(own.namespace_str(), target.name.clone()))
            .collect();
        merge(targets, reconciler.dependents(&load_balancer_dependency(own.namespace_str(), &own.name)))
    }
}

/// Interfaces whose mirror lists the frontend addresses of a load balancer
pub fn load_balancer_dependents(reconciler: Arc<Reconciler>) -> impl Fn(&LoadBalancer) -> Vec<ObjectKey> + Send + Sync {
    move |lb: &LoadBalancer| {
        let own = ObjectKey::of(lb);
        reconciler.dependents(&load_balancer_dependency(own.namespace_str(), &own.name))
    }
}

/// Interfaces a policy rule targets, plus those it used to
pub fn policy_targets(reconciler: Arc<Reconciler>) -> impl Fn(&NetworkPolicyRule) -> Vec<ObjectKey> + Send + Sync {
    move |rule: &NetworkPolicyRule| {
        let own = ObjectKey::of(rule);
        let targets = rule
            .spec
            .targets
            .iter()
            .map(|target| ObjectKey::namespaced(own.namespace_str(), target.target_ref.name.clone()))
            .collect();
        merge(targets, reconciler.dependents(&policy_dependency(own.namespace_str(), &own.name)))
    }
}

/// Interfaces placed on a host node
pub fn host_node_dependents(reconciler: Arc<Reconciler>) -> impl Fn(&HostNode) -> Vec<ObjectKey> + Send + Sync {
    move |node: &HostNode| {
        node.metadata
            .name
            .as_deref()
            .map(|name| reconciler.dependents(&host_node_dependency(name)))
            .unwrap_or_default()
    }
}

/// Interface a mirror was derived from
pub fn mirror_source(labels: SourceLabels) -> impl Fn(&metalnet::NetworkInterface) -> Vec<ObjectKey> + Send + Sync {
    move |mirror: &metalnet::NetworkInterface| {
        mirror
            .metadata
            .labels
            .as_ref()
            .and_then(|l| labels.source_key(l))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::{
        LoadBalancerDestination, LoadBalancerRoutingSpec, LocalObjectReference, LocalUIDReference, NATIP,
        NATIPSection, NATTableSpec, NATTableTargetRef, NetworkPolicyRuleSpec, TargetNetworkInterface,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_nat_table_maps_to_section_targets() {
        let section = |name: &str, port: i32| NATIPSection {
            ip: addr("192.168.0.1"),
            port,
            end_port: port + 63,
            target_ref: Some(NATTableTargetRef {
                name: name.to_string(),
                uid: format!("{name}-uid"),
                node_ref: None,
            }),
        };
        let table = NATTable {
            metadata: meta("nat"),
            spec: NATTableSpec {
                ports_per_network_interface: 64,
                ips: vec![
                    NATIP {
                        ip: addr("203.0.113.1"),
                        sections: vec![section("nic-1", 1024), section("nic-2", 1088)],
                    },
                    NATIP {
                        ip: addr("203.0.113.2"),
                        sections: vec![section("nic-1", 1024)],
                    },
                ],
            },
        };

        assert_eq!(nat_table_targets(&table), vec![key("nic-1"), key("nic-2")]);
    }

    #[test]
    fn test_routing_maps_to_destinations_and_previous_targets() {
        let env = TestEnv::new();
        env.reconciler
            .dependencies
            .insert(key("old"), vec![load_balancer_dependency(NAMESPACE, "lb")]);
        let routing = LoadBalancerRouting {
            metadata: meta("lb"),
            spec: LoadBalancerRoutingSpec {
                network_ref: LocalObjectReference::new("net"),
                destinations: vec![LoadBalancerDestination {
                    ip: addr("192.168.0.1"),
                    target_ref: Some(LocalUIDReference {
                        name: "new".to_string(),
                        uid: "new-uid".to_string(),
                    }),
                }],
            },
        };

        assert_eq!(routing_targets(env.reconciler.clone())(&routing), vec![key("new"), key("old")]);
    }

    #[test]
    fn test_policy_rule_maps_to_targets() {
        let env = TestEnv::new();
        env.reconciler
            .dependencies
            .insert(key("nic"), vec![policy_dependency(NAMESPACE, "allow")]);
        let rule = NetworkPolicyRule {
            metadata: meta("allow"),
            spec: NetworkPolicyRuleSpec {
                network_ref: LocalObjectReference::new("net"),
                priority: None,
                targets: vec![TargetNetworkInterface {
                    ip: addr("192.168.0.1"),
                    target_ref: LocalUIDReference {
                        name: "nic".to_string(),
                        uid: "nic-uid".to_string(),
                    },
                }],
                ingress_rules: Vec::new(),
                egress_rules: Vec::new(),
            },
        };

        assert_eq!(policy_targets(env.reconciler.clone())(&rule), vec![key("nic")]);
    }

    #[test]
    fn test_host_node_and_network_use_the_index() {
        let env = TestEnv::new();
        env.reconciler.dependencies.insert(
            key("nic"),
            vec![host_node_dependency("host-1"), network_dependency(NAMESPACE, "net")],
        );

        assert_eq!(host_node_dependents(env.reconciler.clone())(&host_node("host-1")), vec![key("nic")]);
        assert!(host_node_dependents(env.reconciler.clone())(&host_node("host-2")).is_empty());
        assert_eq!(network_dependents(env.reconciler.clone())(&network("net", 100)), vec![key("nic")]);
    }

    #[test]
    fn test_mirror_maps_to_source() {
        let source = nic("nic", "net", "zone-a.host-1", &["192.168.0.1"]);
        let labels = SourceLabels::default();
        let mirror = metalnet::NetworkInterface {
            metadata: ObjectMeta {
                name: Some("uid".to_string()),
                namespace: Some(HOST_NAMESPACE.to_string()),
                labels: Some(labels.for_object(&source)),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        let unlabelled = metalnet::NetworkInterface {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::new()),
                ..mirror.metadata.clone()
            },
            ..mirror.clone()
        };

        assert_eq!(mirror_source(labels.clone())(&mirror), vec![key("nic")]);
        assert!(mirror_source(labels)(&unlabelled).is_empty());
    }
}
