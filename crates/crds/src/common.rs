//! Shared CRD building blocks
//!
//! Address families, status conditions, label selectors and the well-known
//! label, annotation and finalizer keys used across the fabric.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// API group of the fabric resources
pub const FABRIC_GROUP: &str = "fabric.microscaler.io";
/// API version of the fabric resources
pub const FABRIC_VERSION: &str = "v1alpha1";

/// Finalizer set by the fabric controller on every resource it allocates for
pub const FABRIC_FINALIZER: &str = "fabric.microscaler.io/fabric-controller";
/// Finalizer set by the partition agent on network interfaces it mirrors
pub const PARTITION_AGENT_FINALIZER: &str = "partition.fabric.microscaler.io/network-interface";

/// Label carrying the address family of an `IP`
pub const LABEL_IP_FAMILY: &str = "fabric.microscaler.io/ip-family";
/// Label carrying the address of an `IP` (`:` replaced by `-`)
pub const LABEL_IP: &str = "fabric.microscaler.io/ip";
/// Label naming the load balancer an `Instance` belongs to
pub const LABEL_LOAD_BALANCER_NAME: &str = "fabric.microscaler.io/load-balancer-name";
/// Label naming the NAT gateway or load balancer owning an `IP`
pub const LABEL_IP_OWNER: &str = "fabric.microscaler.io/ip-owner";
/// Label carrying the claimer UID of an `IPAddress` or `NetworkID` record
pub const LABEL_CLAIM_UID: &str = "fabric.microscaler.io/claim-uid";

/// Annotation whose presence forces one more reconcile
pub const ANNOTATION_RECONCILE_REQUEST: &str = "fabric.microscaler.io/reconcile-request";
/// Annotation pointing a local object at its backing-cluster broker
pub const ANNOTATION_BROKER_CONTROLLER: &str = "fabric.microscaler.io/broker-controller";
/// Annotation listing the broker owners pinning a backing object
pub const ANNOTATION_BROKER_OWNERS: &str = "fabric.microscaler.io/broker-owners";

/// Condition type reporting allocation progress
pub const CONDITION_ALLOCATED: &str = "Allocated";
/// Reason: allocation succeeded
pub const REASON_ALLOCATED: &str = "Allocated";
/// Reason: waiting for capacity
pub const REASON_PENDING: &str = "Pending";
/// Reason: a literal value collides with another claimer
pub const REASON_ALREADY_TAKEN: &str = "AlreadyTaken";
/// Reason: requested family is not served
pub const REASON_UNSUPPORTED_FAMILY: &str = "UnsupportedFamily";
/// Reason: the spec is invalid
pub const REASON_INVALID: &str = "Invalid";
/// Reason: demand exceeds capacity
pub const REASON_OVER_SUBSCRIBED: &str = "OverSubscribed";

/// IP address family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    /// IPv4
    #[serde(rename = "IPv4")]
    IPv4,
    /// IPv6
    #[serde(rename = "IPv6")]
    IPv6,
}

impl IpFamily {
    /// Family of an address
    pub fn of(addr: &std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => IpFamily::IPv4,
            std::net::IpAddr::V6(_) => IpFamily::IPv6,
        }
    }

    /// Label value used on `IP` objects
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::IPv4 => "IPv4",
            IpFamily::IPv6 => "IPv6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<IpFamily> for ipam::IpFamily {
    fn from(family: IpFamily) -> Self {
        match family {
            IpFamily::IPv4 => ipam::IpFamily::V4,
            IpFamily::IPv6 => ipam::IpFamily::V6,
        }
    }
}

impl From<ipam::IpFamily> for IpFamily {
    fn from(family: ipam::IpFamily) -> Self {
        match family {
            ipam::IpFamily::V4 => IpFamily::IPv4,
            ipam::IpFamily::V6 => IpFamily::IPv6,
        }
    }
}

/// Label-safe rendering of an address (`:` becomes `-`)
pub fn ip_label_value(ip: &std::net::IpAddr) -> String {
    ip.to_string().replace(':', "-")
}

/// L4 protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

/// Condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

/// Status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Allocated`
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine readable reason
    #[serde(default)]
    pub reason: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Condition with the given type, status and reason
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    /// Attach the observed generation
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of `type_` has status `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or update a condition.
///
/// The transition time only moves when the status flips. Returns whether
/// anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => false,
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                Some(Utc::now())
            };
            *existing = condition;
            true
        }
        None => {
            condition.last_transition_time = Some(Utc::now());
            conditions.push(condition);
            true
        }
    }
}

/// Label selector requirement operator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Value in set
    In,
    /// Value not in set
    NotIn,
    /// Key present
    Exists,
    /// Key absent
    DoesNotExist,
}

/// Single label selector requirement
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub operator: LabelSelectorOperator,
    /// Values for `In` / `NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Label selector
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}
