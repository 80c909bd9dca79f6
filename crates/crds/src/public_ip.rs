//! PublicIP CRD
//!
//! Requests one public address per family, or reserves literal addresses.

use crate::common::{Condition, IpFamily};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "PublicIP",
    namespaced,
    status = "PublicIPStatus",
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".status.ips"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPSpec {
    /// Families to allocate an address for
    #[serde(default)]
    pub ip_families: Vec<IpFamily>,

    /// Literal addresses; defaulted by the controller when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPStatus {
    /// Allocated addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,

    /// Conditions (`Allocated`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
