//! Broker references
//!
//! Cross-cluster pins are carried in annotations rather than owner
//! references, since the API server cannot resolve owners in another cluster.
//! A local object names its backing object through
//! [`ANNOTATION_BROKER_CONTROLLER`]; the backing object lists the clusters
//! pinning it through [`ANNOTATION_BROKER_OWNERS`].

use crate::common::{ANNOTATION_BROKER_CONTROLLER, ANNOTATION_BROKER_OWNERS};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Location of the backing object of a proxied local object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerControllerReference {
    /// Namespace of the backing object
    pub namespace: String,
    /// Name of the backing object
    pub name: String,
}

/// Pin on a backing object held by one object in a source cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOwnerReference {
    /// Name of the source cluster
    pub cluster_name: String,
    /// Kind of the pinning object
    pub kind: String,
    /// API version of the pinning object
    pub api_version: String,
    /// Namespace of the pinning object
    #[serde(default)]
    pub namespace: String,
    /// Name of the pinning object
    pub name: String,
    /// UID of the pinning object
    pub uid: String,
    /// Whether the pinning object controls the backing object
    #[serde(default)]
    pub controller: bool,
}

/// Broker controller reference of a local object, if annotated.
pub fn broker_controller(
    annotations: Option<&BTreeMap<String, String>>,
) -> Option<serde_json::Result<BrokerControllerReference>> {
    let raw = annotations?.get(ANNOTATION_BROKER_CONTROLLER)?;
    Some(serde_json::from_str(raw))
}

/// Broker owners of a backing object; `None` when not annotated at all.
pub fn broker_owners(
    annotations: Option<&BTreeMap<String, String>>,
) -> Option<serde_json::Result<Vec<BrokerOwnerReference>>> {
    let raw = annotations?.get(ANNOTATION_BROKER_OWNERS)?;
    if raw.trim().is_empty() {
        return Some(Ok(Vec::new()));
    }
    Some(serde_json::from_str(raw))
}

/// Encode broker owners as the annotation value.
pub fn encode_broker_owners(owners: &[BrokerOwnerReference]) -> serde_json::Result<String> {
    serde_json::to_string(owners)
}

/// Insert or replace the pin of `owner.cluster_name`. Returns whether the list changed.
pub fn upsert_broker_owner(owners: &mut Vec<BrokerOwnerReference>, owner: BrokerOwnerReference) -> bool {
    match owners.iter_mut().find(|o| o.cluster_name == owner.cluster_name) {
        Some(existing) if *existing == owner => false,
        Some(existing) => {
            *existing = owner;
            true
        }
        None => {
            owners.push(owner);
            true
        }
    }
}

/// Remove the pin of `cluster_name` held by `uid`. Returns whether the list changed.
pub fn remove_broker_owner(owners: &mut Vec<BrokerOwnerReference>, cluster_name: &str, uid: &str) -> bool {
    let before = owners.len();
    owners.retain(|o| !(o.cluster_name == cluster_name && o.uid == uid));
    owners.len() != before
}
