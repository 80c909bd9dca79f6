//! DaemonSet reconciliation
//!
//! Keeps one `Instance` per eligible node. Instances are created unpinned
//! with a node affinity derived from the node selector and left to the
//! scheduler, which pins each to a node. Matching orphans are adopted,
//! mismatching instances are released, and instances on ineligible nodes,
//! duplicates and surplus are deleted.

use super::{ALL, Reconciler, controller_of, controller_reference, is_controlled_by, patch_status_if_changed, uid_of};
use crate::error::ControllerError;
use crds::{
    Affinity, DaemonSet, Instance, InstanceSpec, LabelSelector, Node, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm,
};
use fabric_client::{ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting, matches_label_selector, matches_optional_selector, requeue};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Required node affinity equivalent to `selector`; `None` for an empty selector.
pub fn affinity_for(selector: Option<&LabelSelector>) -> Option<Affinity> {
    let selector = selector?;
    let mut match_expressions: Vec<NodeSelectorRequirement> = selector
        .match_labels
        .iter()
        .map(|(key, value)| NodeSelectorRequirement {
            key: key.clone(),
            operator: crds::LabelSelectorOperator::In,
            values: vec![value.clone()],
        })
        .collect();
    match_expressions.extend(selector.match_expressions.iter().map(|r| NodeSelectorRequirement {
        key: r.key.clone(),
        operator: r.operator,
        values: r.values.clone(),
    }));
    if match_expressions.is_empty() {
        return None;
    }
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm { match_expressions }],
            }),
        }),
    })
}

/// Name of the instance created for `node`, salted with the collision count
pub fn instance_name(daemon_set: &str, node: &str, collision_count: i32) -> String {
    let mut hasher = DefaultHasher::new();
    node.hash(&mut hasher);
    collision_count.hash(&mut hasher);
    format!("{daemon_set}-{:08x}", hasher.finish() as u32)
}

/// Whether `node` may host instances of `ds`
pub fn is_eligible(ds: &DaemonSet, node: &Node) -> bool {
    let empty = BTreeMap::new();
    !node.spec.unschedulable
        && !is_deleting(node)
        && matches_optional_selector(
            ds.spec.node_selector.as_ref(),
            node.metadata.labels.as_ref().unwrap_or(&empty),
        )
}

fn node_of(instance: &Instance) -> Option<&str> {
    instance.spec.node_ref.as_ref().map(|r| r.name.as_str())
}

/// Template spec as it should appear on `current`, keeping its placement
fn desired_instance_spec(ds: &DaemonSet, current: &InstanceSpec) -> InstanceSpec {
    InstanceSpec {
        node_ref: current.node_ref.clone(),
        affinity: affinity_for(ds.spec.node_selector.as_ref()),
        ..ds.spec.template.spec.clone()
    }
}

impl Reconciler {
    /// Reconcile the `DaemonSet` behind `key`
    #[instrument(skip(self, key), fields(daemon_set = %key))]
    pub async fn reconcile_daemon_set(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.daemon_sets.as_ref();
        let instances_client = self.clients.instances.as_ref();
        let Some(ds) = client.get(key).await? else {
            self.indexes.daemon_sets.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&ds) {
            self.indexes.daemon_sets.remove(key);
            return Ok(Action::await_change());
        }
        self.indexes.daemon_sets.insert(key.clone(), ALL.to_string());
        let uid = uid_of(&ds)?;
        let owner = controller_reference(&ds)
            .ok_or_else(|| ControllerError::InvalidConfig(format!("{key} cannot own objects")))?;

        let eligible: BTreeSet<String> = self
            .clients
            .nodes
            .list_all()
            .await?
            .into_iter()
            .filter(|node| is_eligible(&ds, node))
            .filter_map(|node| node.metadata.name)
            .collect();

        let empty = BTreeMap::new();
        let mut owned = Vec::new();
        for instance in instances_client.list(key.namespace.as_deref(), &empty).await? {
            let labels = instance.metadata.labels.as_ref().unwrap_or(&empty);
            let matches = matches_label_selector(&ds.spec.selector, labels);
            let instance_key = ObjectKey::of(&instance);
            if is_controlled_by(&instance, &uid) {
                if matches {
                    owned.push(instance);
                } else {
                    info!(instance = %instance_key, "Releasing instance no longer matching the selector");
                    let refs: Vec<_> = instance
                        .metadata
                        .owner_references
                        .iter()
                        .flatten()
                        .filter(|r| r.uid != uid)
                        .cloned()
                        .collect();
                    let patch = json!({
                        "metadata": {
                            "resourceVersion": instance.metadata.resource_version,
                            "ownerReferences": refs,
                        },
                    });
                    instances_client.patch(&instance_key, &patch).await?;
                }
            } else if matches && controller_of(&instance).is_none() && !is_deleting(&instance) {
                info!(instance = %instance_key, "Adopting orphaned instance");
                let mut refs = instance.metadata.owner_references.clone().unwrap_or_default();
                refs.push(owner.clone());
                let patch = json!({
                    "metadata": {
                        "resourceVersion": instance.metadata.resource_version,
                        "ownerReferences": refs,
                    },
                });
                owned.push(instances_client.patch(&instance_key, &patch).await?);
            }
        }
        owned.retain(|instance| !is_deleting(instance));
        owned.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut pinned: BTreeMap<String, Instance> = BTreeMap::new();
        let mut unpinned = Vec::new();
        let mut doomed = Vec::new();
        for instance in owned {
            match node_of(&instance).map(str::to_string) {
                None => unpinned.push(instance),
                Some(node) if !eligible.contains(&node) || pinned.contains_key(&node) => doomed.push(instance),
                Some(node) => {
                    pinned.insert(node, instance);
                }
            }
        }

        let uncovered: Vec<&String> = eligible.iter().filter(|node| !pinned.contains_key(*node)).collect();
        while unpinned.len() > uncovered.len() {
            if let Some(surplus) = unpinned.pop() {
                doomed.push(surplus);
            }
        }
        for instance in &doomed {
            info!(instance = %ObjectKey::of(instance), node = ?node_of(instance), "Deleting instance");
            instances_client.delete_if_exists(&ObjectKey::of(instance)).await?;
        }

        for instance in pinned.values().chain(unpinned.iter()) {
            let desired = desired_instance_spec(&ds, &instance.spec);
            if instance.spec != desired {
                debug!(instance = %ObjectKey::of(instance), "Syncing instance with template");
                let patch = json!({
                    "metadata": { "resourceVersion": instance.metadata.resource_version },
                    "spec": desired,
                });
                instances_client.patch(&ObjectKey::of(instance), &patch).await?;
            }
        }

        let mut status = ds.status.clone().unwrap_or_default();
        for node in uncovered.iter().skip(unpinned.len()) {
            let mut labels = ds.spec.template.labels.clone();
            labels.extend(ds.spec.selector.match_labels.clone());
            let instance = Instance {
                metadata: ObjectMeta {
                    name: Some(instance_name(&key.name, node, status.collision_count)),
                    namespace: key.namespace.clone(),
                    labels: Some(labels),
                    owner_references: Some(vec![owner.clone()]),
                    ..Default::default()
                },
                spec: InstanceSpec {
                    node_ref: None,
                    affinity: affinity_for(ds.spec.node_selector.as_ref()),
                    ..ds.spec.template.spec.clone()
                },
            };
            match instances_client.create(&instance, false).await {
                Ok(created) => info!(instance = %ObjectKey::of(&created), "Created instance"),
                Err(e) if e.is_already_exists() => {
                    status.collision_count += 1;
                    info!(collision_count = status.collision_count, "Instance name collision");
                    patch_status_if_changed(client, &ds, ds.status.as_ref(), &status).await?;
                    return Ok(requeue());
                }
                Err(e) => return Err(e.into()),
            }
        }

        status.desired_number_scheduled = i32::try_from(eligible.len()).unwrap_or(i32::MAX);
        status.current_number_scheduled = i32::try_from(pinned.len()).unwrap_or(i32::MAX);
        patch_status_if_changed(client, &ds, ds.status.as_ref(), &status).await?;
        Ok(Action::await_change())
    }
}

/// Reconciler handle for `DaemonSet`
#[derive(Debug, Clone)]
pub struct DaemonSets(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for DaemonSets {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "daemonset"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_daemon_set(key).await
    }
}
