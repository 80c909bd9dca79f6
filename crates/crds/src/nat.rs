//! NAT CRDs
//!
//! `NATGateway` owns a set of public IPs whose ephemeral port space is split
//! into `portsPerNetworkInterface`-sized sections. `NATTable` (same name as
//! the gateway) is the computed assignment of sections to network
//! interfaces. `NATGatewayAutoscaler` resizes a gateway's IP list.

use crate::common::{Condition, IpFamily};
use crate::references::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Default ports per network interface
pub const DEFAULT_PORTS_PER_NETWORK_INTERFACE: i32 = 2048;

fn default_ports_per_network_interface() -> i32 {
    DEFAULT_PORTS_PER_NETWORK_INTERFACE
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NATGateway",
    plural = "natgateways",
    namespaced,
    status = "NATGatewayStatus",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.networkRef.name"}"#,
    printcolumn = r#"{"name":"Used","type":"integer","jsonPath":".status.usedNATIPs"}"#,
    printcolumn = r#"{"name":"Requested","type":"integer","jsonPath":".status.requestedNATIPs"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewaySpec {
    /// Family of the gateway IPs
    pub ip_family: IpFamily,

    /// Network whose interfaces are translated
    pub network_ref: LocalObjectReference,

    /// Gateway IPs
    #[serde(default)]
    pub ips: Vec<NATGatewayIP>,

    /// Size of each port section; must divide 64512 and is immutable
    #[serde(default = "default_ports_per_network_interface")]
    pub ports_per_network_interface: i32,
}

/// One gateway IP
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayIP {
    /// Name, unique within the gateway
    pub name: String,

    /// Literal address; allocated from the public pools when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

/// Allocated address of one gateway IP
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayIPStatus {
    /// Name of the gateway IP
    pub name: String,
    /// Allocated address
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayStatus {
    /// Allocated gateway addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<NATGatewayIPStatus>,

    /// Interfaces holding a section
    #[serde(default, rename = "usedNATIPs")]
    pub used_nat_ips: i64,

    /// Interfaces asking for a section
    #[serde(default, rename = "requestedNATIPs")]
    pub requested_nat_ips: i64,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NATTable",
    plural = "nattables",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NATTableSpec {
    /// Section size the table was computed with
    #[serde(default)]
    pub ports_per_network_interface: i32,

    /// Sections per gateway IP
    #[serde(default)]
    pub ips: Vec<NATIP>,
}

/// Sections carved from one gateway IP
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATIP {
    /// Gateway address
    pub ip: IpAddr,

    /// Assigned sections, ordered by port
    #[serde(default)]
    pub sections: Vec<NATIPSection>,
}

/// Port section assigned to one network interface
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATIPSection {
    /// Interface address being translated
    pub ip: IpAddr,

    /// First port
    pub port: i32,

    /// Last port (inclusive)
    pub end_port: i32,

    /// Interface holding the section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<NATTableTargetRef>,
}

/// Network interface a section belongs to
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATTableTargetRef {
    /// Interface name
    pub name: String,

    /// Interface UID
    pub uid: String,

    /// Node the interface is scheduled on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<LocalObjectReference>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NATGatewayAutoscaler",
    plural = "natgatewayautoscalers",
    namespaced,
    status = "NATGatewayAutoscalerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayAutoscalerSpec {
    /// Gateway to scale
    pub nat_gateway_ref: LocalObjectReference,

    /// Lower bound of gateway IPs
    #[serde(default, rename = "minPublicIPs", skip_serializing_if = "Option::is_none")]
    pub min_public_ips: Option<i32>,

    /// Upper bound of gateway IPs
    #[serde(default, rename = "maxPublicIPs", skip_serializing_if = "Option::is_none")]
    pub max_public_ips: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayAutoscalerStatus {
    /// Gateway IP count last computed
    #[serde(default, rename = "desiredPublicIPs", skip_serializing_if = "Option::is_none")]
    pub desired_public_ips: Option<i32>,
}
