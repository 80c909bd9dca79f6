//! Object references
//!
//! References between fabric objects are plain value tuples; nothing is owned
//! through them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl LocalObjectReference {
    /// Reference by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to an object in the same namespace, pinned to one incarnation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalUIDReference {
    /// Name of the referenced object
    pub name: String,
    /// UID of the referenced object
    pub uid: String,
}

/// Back-reference from an allocation record to the object holding it.
///
/// `group` and `resource` identify the claimer kind, so claims of different
/// kinds with the same name never collide.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    /// API group of the claimer
    #[serde(default)]
    pub group: String,
    /// Plural resource name of the claimer, e.g. `publicips`
    pub resource: String,
    /// Namespace of the claimer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name of the claimer
    pub name: String,
    /// UID of the claimer
    pub uid: String,
}
