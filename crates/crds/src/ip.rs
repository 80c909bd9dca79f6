//! IP and IPAddress CRDs
//!
//! `IP` is a single-address request usable by other controllers (NAT gateways
//! and load balancers claim their public addresses through it). `IPAddress`
//! is the cluster-scoped occupancy record of one allocated address, named by
//! the canonical address.

use crate::common::{Condition, IpFamily};
use crate::references::ClaimRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Type of an `IP`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum IPType {
    /// Address from the public pools
    #[default]
    Public,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "IP",
    plural = "ips",
    namespaced,
    status = "IPStatus",
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"Family","type":"string","jsonPath":".spec.ipFamily"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    /// Kind of address
    #[serde(rename = "type", default)]
    pub type_: IPType,

    /// Family to allocate from
    pub ip_family: IpFamily,

    /// Literal address; defaulted by the controller when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,

    /// Object consuming this address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPStatus {
    /// Conditions (`Allocated`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "IPAddress",
    plural = "ipaddresses",
    printcolumn = r#"{"name":"Claimer","type":"string","jsonPath":".spec.claimRef.name"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.claimRef.resource"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    /// The allocated address
    pub ip: IpAddr,

    /// Object holding the address
    pub claim_ref: ClaimRef,
}
