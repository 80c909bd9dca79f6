//! NetworkInterface CRD

use crate::common::IpFamily;
use crate::references::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkInterface",
    namespaced,
    status = "NetworkInterfaceStatus",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.networkRef.name"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeRef.name"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    /// Network the interface is attached to
    pub network_ref: LocalObjectReference,

    /// Partition node hosting the interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<LocalObjectReference>,

    /// Network-internal addresses
    #[serde(default)]
    pub ips: Vec<IpAddr>,

    /// Public addresses bound to the interface
    #[serde(default, rename = "publicIPs", skip_serializing_if = "Vec::is_empty")]
    pub public_ips: Vec<IpAddr>,

    /// Routed prefixes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,

    /// NAT gateways translating the interface, at most one per family.
    /// An entry without a UID asks for that gateway; the gateway fills the
    /// UID in when it takes the interface.
    #[serde(default, rename = "natClaimRefs", skip_serializing_if = "Vec::is_empty")]
    pub nat_claim_refs: Vec<NATClaimRef>,
}

/// Claim of a NAT gateway on an interface
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NATClaimRef {
    /// Gateway name
    pub name: String,
    /// Gateway UID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Family the gateway translates
    pub ip_family: IpFamily,
}

impl NetworkInterfaceSpec {
    /// Gateway claim for `family`, if any
    pub fn nat_claim(&self, family: IpFamily) -> Option<&NATClaimRef> {
        self.nat_claim_refs.iter().find(|claim| claim.ip_family == family)
    }
}

/// Dataplane state of an interface
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

    /// Public addresses programmed
    #[serde(default, rename = "publicIPs", skip_serializing_if = "Vec::is_empty")]
    pub public_ips: Vec<IpAddr>,

    /// NAT addresses programmed
    #[serde(default, rename = "natIPs", skip_serializing_if = "Vec::is_empty")]
    pub nat_ips: Vec<IpAddr>,

    /// Prefixes programmed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_claim_refs_wire_format() {
        let spec: NetworkInterfaceSpec = serde_json::from_value(serde_json::json!({
            "networkRef": { "name": "net" },
            "natClaimRefs": [{ "name": "nat-a", "ipFamily": "IPv4" }]
        }))
        .unwrap();

        let claim = spec.nat_claim(IpFamily::IPv4).unwrap();
        assert_eq!(claim.name, "nat-a");
        assert!(claim.uid.is_empty());
        assert!(spec.nat_claim(IpFamily::IPv6).is_none());
    }
}
