//! Source labels
//!
//! Mirrors written into another cluster carry the identity of the object they
//! were derived from as `<prefix>name`, `<prefix>namespace` and `<prefix>uid`
//! labels, which is how their watches map back to the source key.

use fabric_client::ObjectKey;
use kube::Resource;
use std::collections::BTreeMap;

/// Default prefix of source labels
pub const SOURCE_LABEL_PREFIX: &str = "fabric.microscaler.io/source-";

/// Source labels under a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLabels {
    prefix: String,
}

impl Default for SourceLabels {
    fn default() -> Self {
        Self::new(SOURCE_LABEL_PREFIX)
    }
}

impl SourceLabels {
    /// Labels named `<prefix>name`, `<prefix>namespace` and `<prefix>uid`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    /// Labels identifying `source`
    pub fn for_object<K: Resource>(&self, source: &K) -> BTreeMap<String, String> {
        let meta = source.meta();
        let mut labels = BTreeMap::new();
        if let Some(name) = &meta.name {
            labels.insert(self.key("name"), name.clone());
        }
        if let Some(namespace) = &meta.namespace {
            labels.insert(self.key("namespace"), namespace.clone());
        }
        if let Some(uid) = &meta.uid {
            labels.insert(self.key("uid"), uid.clone());
        }
        labels
    }

    /// Exact-match selector for the mirrors of the source behind `key`
    pub fn selector(&self, key: &ObjectKey) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([(self.key("name"), key.name.clone())]);
        if let Some(namespace) = &key.namespace {
            labels.insert(self.key("namespace"), namespace.clone());
        }
        labels
    }

    /// Key of the source recorded in `labels`
    pub fn source_key(&self, labels: &BTreeMap<String, String>) -> Option<ObjectKey> {
        let name = labels.get(&self.key("name"))?;
        Some(ObjectKey {
            namespace: labels.get(&self.key("namespace")).cloned(),
            name: name.clone(),
        })
    }

    /// UID of the source recorded in `labels`
    pub fn source_uid<'a>(&self, labels: &'a BTreeMap<String, String>) -> Option<&'a str> {
        labels.get(&self.key("uid")).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{NetworkInterface, NetworkInterfaceSpec};

    #[test]
    fn test_source_labels_round_trip() {
        let mut nic = NetworkInterface::new("nic1", NetworkInterfaceSpec::default());
        nic.metadata.namespace = Some("tenant".to_string());
        nic.metadata.uid = Some("u-1".to_string());

        let source = SourceLabels::default();
        let labels = source.for_object(&nic);
        assert_eq!(
            labels.get("fabric.microscaler.io/source-name").map(String::as_str),
            Some("nic1")
        );
        assert_eq!(
            source.source_key(&labels),
            Some(ObjectKey::namespaced("tenant", "nic1"))
        );
        assert_eq!(source.source_uid(&labels), Some("u-1"));
        let selector = source.selector(&ObjectKey::namespaced("tenant", "nic1"));
        assert!(selector.iter().all(|(k, v)| labels.get(k) == Some(v)));
        assert_eq!(source.source_key(&BTreeMap::new()), None);
    }
}
