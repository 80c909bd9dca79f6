//! LoadBalancer and LoadBalancerRouting CRDs

use crate::common::{IpFamily, LabelSelector, Protocol};
use crate::references::{LocalObjectReference, LocalUIDReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Type of a load balancer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum LoadBalancerType {
    /// Fronted by public addresses
    #[default]
    Public,
    /// Fronted by literal network-internal addresses
    Internal,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "LoadBalancer",
    namespaced,
    status = "LoadBalancerStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".status.ips"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Public or internal
    #[serde(rename = "type", default)]
    pub type_: LoadBalancerType,

    /// Network of the load balancer
    pub network_ref: LocalObjectReference,

    /// Frontend addresses
    #[serde(default)]
    pub ips: Vec<LoadBalancerIP>,

    /// Forwarded ports; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<LoadBalancerPort>,

    /// Interfaces to route to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface_selector: Option<LabelSelector>,

    /// Nodes to run instances on; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
}

/// One frontend address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIP {
    /// Name, unique within the load balancer
    pub name: String,

    /// Family of the address
    pub ip_family: IpFamily,

    /// Literal address; required for internal load balancers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

/// Forwarded port range
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    /// Protocol; TCP when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// First port
    pub port: i32,

    /// Last port; equal to `port` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Effective frontend addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,
}

/// Routing table of a load balancer; same name as the load balancer.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "LoadBalancerRouting",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRoutingSpec {
    /// Network of the destinations
    #[serde(default)]
    pub network_ref: LocalObjectReference,

    /// Backend addresses, ordered by address
    #[serde(default)]
    pub destinations: Vec<LoadBalancerDestination>,
}

/// One backend address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDestination {
    /// Interface address
    pub ip: IpAddr,

    /// Interface owning the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<LocalUIDReference>,
}
