//! NetworkPolicy reconciliation
//!
//! Resolves a `NetworkPolicy` into the `NetworkPolicyRule` of the same name:
//! the addresses of the selected interfaces on the policy's network plus the
//! rules of every direction the policy covers.

use super::{FIELD_MANAGER, Reconciler, controller_reference, reasons, same_spec, scoped};
use crate::error::ControllerError;
use crds::{
    IPBlock, LocalUIDReference, NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicyRule,
    NetworkPolicyRuleSpec, PolicyType, Rule, TargetNetworkInterface,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting, matches_label_selector};
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Directions `policy` covers.
///
/// Without explicit types a policy always covers ingress, and egress when it
/// lists egress rules.
pub fn effective_policy_types(policy: &NetworkPolicy) -> Vec<PolicyType> {
    if !policy.spec.policy_types.is_empty() {
        return policy.spec.policy_types.clone();
    }
    let mut types = vec![PolicyType::Ingress];
    if !policy.spec.egress.is_empty() {
        types.push(PolicyType::Egress);
    }
    types
}

/// First problem with `policy`'s peers or ports, if any
pub fn validate(policy: &NetworkPolicy) -> Option<String> {
    let peers = policy
        .spec
        .ingress
        .iter()
        .flat_map(|r| r.from.iter())
        .chain(policy.spec.egress.iter().flat_map(|r| r.to.iter()));
    for block in peers.filter_map(|p| p.ip_block.as_ref()) {
        let cidr: IpNet = match block.cidr.parse() {
            Ok(cidr) => cidr,
            Err(_) => return Some(format!("invalid cidr {}", block.cidr)),
        };
        for except in &block.except {
            match except.parse::<IpNet>() {
                Ok(carve) if cidr.contains(&carve) => {}
                Ok(_) => return Some(format!("{except} is not within {}", block.cidr)),
                Err(_) => return Some(format!("invalid cidr {except}")),
            }
        }
    }

    let ports = policy
        .spec
        .ingress
        .iter()
        .flat_map(|r| r.ports.iter())
        .chain(policy.spec.egress.iter().flat_map(|r| r.ports.iter()));
    for port in ports {
        let valid = |p: i32| (1..=65535).contains(&p);
        match (port.port, port.end_port) {
            (Some(p), _) if !valid(p) => return Some(format!("invalid port {p}")),
            (Some(p), Some(end)) if !valid(end) || end < p => return Some(format!("invalid port range {p}-{end}")),
            (None, Some(_)) => return Some("endPort without port".to_string()),
            _ => {}
        }
    }
    None
}

fn resolve_rule(peers: &[NetworkPolicyPeer], ports: &[NetworkPolicyPort]) -> Rule {
    Rule {
        ip_blocks: peers.iter().filter_map(|p| p.ip_block.clone()).collect::<Vec<IPBlock>>(),
        network_policy_ports: ports.to_vec(),
    }
}

impl Reconciler {
    /// Interface addresses `policy` applies to, ordered by interface name and address
    pub async fn policy_targets(&self, policy: &NetworkPolicy) -> Result<Vec<TargetNetworkInterface>, ControllerError> {
        let empty = BTreeMap::new();
        let mut nics = self
            .clients
            .network_interfaces
            .list(policy.metadata.namespace.as_deref(), &empty)
            .await?;
        nics.retain(|nic| {
            !is_deleting(nic)
                && nic.spec.network_ref == policy.spec.network_ref
                && matches_label_selector(
                    &policy.spec.network_interface_selector,
                    nic.metadata.labels.as_ref().unwrap_or(&empty),
                )
        });
        nics.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut targets = Vec::new();
        for nic in nics {
            let (Some(name), Some(uid)) = (nic.metadata.name, nic.metadata.uid) else {
                continue;
            };
            let mut ips = nic.spec.ips;
            ips.sort();
            targets.extend(ips.into_iter().map(|ip| TargetNetworkInterface {
                ip,
                target_ref: LocalUIDReference {
                    name: name.clone(),
                    uid: uid.clone(),
                },
            }));
        }
        Ok(targets)
    }

    /// Reconcile the `NetworkPolicy` behind `key`
    #[instrument(skip(self, key), fields(network_policy = %key))]
    pub async fn reconcile_network_policy(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(policy) = self.clients.network_policies.get(key).await? else {
            self.indexes.network_policies.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&policy) {
            return Ok(Action::await_change());
        }
        self.indexes
            .network_policies
            .insert(key.clone(), scoped(key.namespace_str(), &policy.spec.network_ref.name));

        if let Some(problem) = validate(&policy) {
            self.record(&policy, FabricEvent::warning(reasons::INVALID_SPEC, "Reconcile", problem))
                .await;
            return Ok(Action::await_change());
        }

        let types = effective_policy_types(&policy);
        let spec = NetworkPolicyRuleSpec {
            network_ref: policy.spec.network_ref.clone(),
            priority: policy.spec.priority,
            targets: self.policy_targets(&policy).await?,
            ingress_rules: if types.contains(&PolicyType::Ingress) {
                policy.spec.ingress.iter().map(|r| resolve_rule(&r.from, &r.ports)).collect()
            } else {
                Vec::new()
            },
            egress_rules: if types.contains(&PolicyType::Egress) {
                policy.spec.egress.iter().map(|r| resolve_rule(&r.to, &r.ports)).collect()
            } else {
                Vec::new()
            },
        };

        let current = self.clients.network_policy_rules.get(key).await?;
        if current.as_ref().is_some_and(|rule| same_spec(&rule.spec, &spec)) {
            return Ok(Action::await_change());
        }
        let rule = NetworkPolicyRule {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                owner_references: controller_reference(&policy).map(|r| vec![r]),
                ..Default::default()
            },
            spec,
        };
        self.clients
            .network_policy_rules
            .apply(&rule, FIELD_MANAGER)
            .await?;
        info!(targets = rule.spec.targets.len(), "Applied network policy rule");
        Ok(Action::await_change())
    }
}

/// Reconciler handle for `NetworkPolicy`
#[derive(Debug, Clone)]
pub struct NetworkPolicies(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for NetworkPolicies {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "networkpolicy"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_network_policy(key).await
    }
}
