//! Instance and DaemonSet CRDs
//!
//! An `Instance` is one load-balancer replica pinned to a partition node.
//! A `DaemonSet` keeps one instance per eligible node.

use crate::common::{LabelSelector, LabelSelectorOperator};
use crate::load_balancer::{LoadBalancerPort, LoadBalancerType};
use crate::references::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Kind of workload an instance runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum InstanceType {
    /// Load-balancer replica
    #[default]
    LoadBalancer,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "Instance",
    namespaced,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Workload kind
    #[serde(rename = "type", default)]
    pub type_: InstanceType,

    /// Type of the load balancer served
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_type: Option<LoadBalancerType>,

    /// Network of the instance
    pub network_ref: LocalObjectReference,

    /// Addresses served
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,

    /// Ports served
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_ports: Vec<LoadBalancerPort>,

    /// Node the instance runs on; set by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<LocalObjectReference>,

    /// Placement constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

/// Placement constraints
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    /// Node affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
}

/// Node affinity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    /// Hard requirement evaluated at scheduling time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_during_scheduling_ignored_during_execution: Option<NodeSelector>,
}

/// Disjunction of node selector terms
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    /// Terms, any of which must match
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// Conjunction of node label requirements
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    /// Requirements, all of which must match
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// Node label requirement
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub operator: LabelSelectorOperator,
    /// Values for `In` / `NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Spread of matching instances across a topology domain
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraint {
    /// Largest allowed difference between domains
    pub max_skew: i32,

    /// Node label defining the domains
    pub topology_key: String,

    /// Instances counted; those of the same daemon set when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fabric.microscaler.io",
    version = "v1alpha1",
    kind = "DaemonSet",
    namespaced,
    status = "DaemonSetStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredNumberScheduled"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentNumberScheduled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetSpec {
    /// Instances belonging to this daemon set
    pub selector: LabelSelector,

    /// Nodes to run on; all schedulable nodes when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    /// Template of created instances
    pub template: InstanceTemplate,
}

/// Instance template
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    /// Labels of created instances; must match the selector
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Spec of created instances, `nodeRef` is filled per node
    pub spec: InstanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    /// Bumped on every instance name collision
    #[serde(default)]
    pub collision_count: i32,

    /// Nodes that should run an instance
    #[serde(default)]
    pub desired_number_scheduled: i32,

    /// Nodes running an instance
    #[serde(default)]
    pub current_number_scheduled: i32,
}
