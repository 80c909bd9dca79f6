//! Network and NetworkID CRDs

use crate::common::Condition;
use crate::references::ClaimRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "Network",
    namespaced,
    status = "NetworkStatus",
    printcolumn = r#"{"name":"VNI","type":"integer","jsonPath":".status.vni"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Requested VNI; defaulted by the controller when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vni: Option<i32>,

    /// Networks this network peers with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<NetworkPeering>,
}

/// Peering with another network, addressed by its VNI
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeering {
    /// Peering name, unique within the network
    pub name: String,

    /// Decimal VNI of the peer network
    pub id: String,

    /// Peer prefixes to route; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
}

/// State of a peering
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum PeeringState {
    /// Peer missing or not peering back
    #[default]
    Pending,
    /// Both sides peer with each other
    Ready,
    /// Peering definition is invalid
    Error,
}

/// Observed state of one peering
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeeringStatus {
    /// Peering name
    pub name: String,
    /// Peering state
    pub state: PeeringState,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Effective VNI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vni: Option<i32>,

    /// Per-peering state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<NetworkPeeringStatus>,

    /// Conditions (`Allocated`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Occupancy record of one VNI; named by the decimal VNI.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkID",
    plural = "networkids",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.claimRef.name"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.claimRef.namespace"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIDSpec {
    /// Network holding the VNI
    pub claim_ref: ClaimRef,
}
