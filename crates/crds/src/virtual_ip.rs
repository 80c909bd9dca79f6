//! VirtualIP CRD
//!
//! A public address bound to a workload. Allocated locally, or proxied to a
//! backing cluster when the broker-controller annotation is set.

use crate::common::{Condition, IpFamily};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Type of a virtual IP
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VirtualIPType {
    /// Address from the public pools
    #[default]
    Public,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "VirtualIP",
    namespaced,
    status = "VirtualIPStatus",
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.ip"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIPSpec {
    /// Kind of address
    #[serde(rename = "type", default)]
    pub type_: VirtualIPType,

    /// Family of the address
    pub ip_family: IpFamily,

    /// Literal address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIPStatus {
    /// Allocated address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,

    /// Conditions (`Allocated`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
