//! Node CRD
//!
//! A partition node, named `<partition>.<hostNode>`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(group = "fabric.microscaler.io", version = "v1alpha1", kind = "Node")]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Excluded from scheduling
    #[serde(default)]
    pub unschedulable: bool,
}

/// Split a partition node name into `(partition, host node)`.
pub fn parse_partition_node_name(name: &str) -> Option<(&str, &str)> {
    let (partition, host) = name.split_once('.')?;
    if partition.is_empty() || host.is_empty() {
        return None;
    }
    Some((partition, host))
}

/// Partition node name of `host` in `partition`.
pub fn partition_node_name(partition: &str, host: &str) -> String {
    format!("{partition}.{host}")
}
