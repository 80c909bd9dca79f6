//! NetworkPolicy and NetworkPolicyRule CRDs
//!
//! `NetworkPolicy` is the tenant-facing selector-based definition.
//! `NetworkPolicyRule` (same name) is its resolved form listing the
//! targeted interface addresses, consumed by partition agents.

use crate::common::{LabelSelector, Protocol};
use crate::references::{LocalObjectReference, LocalUIDReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Traffic direction a policy applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PolicyType {
    /// Incoming traffic
    Ingress,
    /// Outgoing traffic
    Egress,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkPolicy",
    plural = "networkpolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Network the policy applies to
    pub network_ref: LocalObjectReference,

    /// Interfaces the policy applies to
    #[serde(default)]
    pub network_interface_selector: LabelSelector,

    /// Rule priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Directions covered; derived from the rule lists when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<PolicyType>,

    /// Allowed incoming traffic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<NetworkPolicyIngressRule>,

    /// Allowed outgoing traffic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkPolicyEgressRule>,
}

/// Incoming traffic rule
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyIngressRule {
    /// Sources
    #[serde(default)]
    pub from: Vec<NetworkPolicyPeer>,
    /// Destination ports; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

/// Outgoing traffic rule
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyEgressRule {
    /// Destinations
    #[serde(default)]
    pub to: Vec<NetworkPolicyPeer>,
    /// Destination ports; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

/// Traffic peer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    /// CIDR block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IPBlock>,
}

/// CIDR with carve-outs
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct IPBlock {
    /// Allowed CIDR
    pub cidr: String,
    /// Denied sub-CIDRs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// Port or port range
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPort {
    /// Protocol; TCP when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// First port; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Last port; equal to `port` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkPolicyRule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyRuleSpec {
    /// Network of the targets
    #[serde(default)]
    pub network_ref: LocalObjectReference,

    /// Rule priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Interface addresses the rule applies to
    #[serde(default)]
    pub targets: Vec<TargetNetworkInterface>,

    /// Incoming rules
    #[serde(default)]
    pub ingress_rules: Vec<Rule>,

    /// Outgoing rules
    #[serde(default)]
    pub egress_rules: Vec<Rule>,
}

/// Targeted interface address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetNetworkInterface {
    /// Interface address
    pub ip: IpAddr,
    /// Interface
    pub target_ref: LocalUIDReference,
}

/// Resolved rule
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Peer CIDRs
    #[serde(default)]
    pub ip_blocks: Vec<IPBlock>,
    /// Ports; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_policy_ports: Vec<NetworkPolicyPort>,
}
