//! Metalnet dataplane mirror
//!
//! Low-level per-interface representation consumed by the dataplane agent of
//! a partition. Written only by the partition agent through server-side apply.

use crate::common::{IpFamily, Protocol};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "metalnet.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkInterface",
    namespaced,
    status = "NetworkInterfaceStatus",
    printcolumn = r#"{"name":"VNI","type":"integer","jsonPath":".spec.vni"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    /// VNI of the network
    pub vni: i32,

    /// Families of `ips`
    #[serde(default)]
    pub ip_families: Vec<IpFamily>,

    /// Interface addresses
    #[serde(default)]
    pub ips: Vec<IpAddr>,

    /// Public IPv4 address
    #[serde(default, rename = "virtualIP", skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<IpAddr>,

    /// NAT section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NATDetails>,

    /// Routed prefixes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,

    /// Load-balancer frontends targeting this interface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_targets: Vec<String>,

    /// Firewall rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall_rules: Vec<FirewallRule>,

    /// Host node
    pub node_name: String,
}

/// NAT section of an interface
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATDetails {
    /// Gateway address
    pub ip: IpAddr,
    /// First port
    pub port: i32,
    /// Last port (inclusive)
    pub end_port: i32,
}

/// Traffic direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum FirewallRuleDirection {
    /// Incoming
    Ingress,
    /// Outgoing
    Egress,
}

/// Rule verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum FirewallRuleAction {
    /// Allow
    Accept,
    /// Drop
    Deny,
}

/// Destination port range match
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortMatch {
    /// First destination port
    pub dst_port: i32,
    /// Last destination port
    pub end_dst_port: i32,
}

/// Protocol and port match
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFilter {
    /// Protocol
    pub protocol: Protocol,
    /// Ports; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_match: Option<PortMatch>,
}

/// One firewall entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    /// Stable identifier of the entry
    #[serde(rename = "firewallRuleID")]
    pub firewall_rule_id: String,

    /// Direction
    pub direction: FirewallRuleDirection,

    /// Verdict
    pub action: FirewallRuleAction,

    /// Priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Family of the prefixes
    pub ip_family: IpFamily,

    /// Source prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_prefix: Option<String>,

    /// Destination prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_prefix: Option<String>,

    /// Protocol filter; all traffic when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_match: Option<ProtocolFilter>,
}

impl FirewallRule {
    /// Whether two entries match the same traffic, ignoring their identifiers
    pub fn same_match(&self, other: &FirewallRule) -> bool {
        self.direction == other.direction
            && self.action == other.action
            && self.priority == other.priority
            && self.ip_family == other.ip_family
            && self.source_prefix == other.source_prefix
            && self.destination_prefix == other.destination_prefix
            && self.protocol_match == other.protocol_match
    }
}

/// Dataplane state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NetworkInterfaceState {
    /// Not yet programmed
    #[default]
    Pending,
    /// Programmed
    Ready,
    /// Programming failed
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceStatus {
    /// Dataplane state
    #[serde(default)]
    pub state: NetworkInterfaceState,

    /// PCI address of the virtual function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,

    /// Programmed public address
    #[serde(default, rename = "virtualIP", skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<IpAddr>,

    /// Programmed NAT section
    #[serde(default, rename = "natIP", skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<NATDetails>,

    /// Programmed prefixes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
}
