//! Instance scheduler
//!
//! Pins each unpinned `Instance` to a node. A node is a candidate when it is
//! schedulable, satisfies the instance's required node affinity and does not
//! already host an instance of the same controller. Among candidates the one
//! giving the smallest maximum skew over the topology spread constraints
//! wins, ties broken by node name. `maxSkew` is not enforced.

use super::{ALL, Reconciler, controller_of};
use crate::error::ControllerError;
use crds::{Instance, Node, TopologySpreadConstraint};
use fabric_client::{ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting, matches_label_selector, matches_node_selector};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

/// Whether `node` satisfies the required node affinity of `instance`
pub fn fits_affinity(instance: &Instance, node: &Node) -> bool {
    let required = instance
        .spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref());
    required.is_none_or(|selector| matches_node_selector(selector, &node_labels(node)))
}

/// Whether `other` counts towards the spread of `instance` under `constraint`
fn counts_towards(constraint: &TopologySpreadConstraint, instance: &Instance, other: &Instance) -> bool {
    match &constraint.label_selector {
        Some(selector) => {
            let empty = BTreeMap::new();
            matches_label_selector(selector, other.metadata.labels.as_ref().unwrap_or(&empty))
        }
        None => match (controller_of(instance), controller_of(other)) {
            (Some(a), Some(b)) => a.uid == b.uid,
            _ => false,
        },
    }
}

/// Skew of `constraint` once `instance` lands on `candidate`; `None` when the
/// candidate lacks the topology key.
fn skew_with(
    constraint: &TopologySpreadConstraint,
    instance: &Instance,
    candidate: &Node,
    nodes: &[&Node],
    placed: &[Instance],
) -> Option<i64> {
    let key = &constraint.topology_key;
    let domain_of = |name: &str| {
        nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .and_then(|n| n.metadata.labels.as_ref()?.get(key).cloned())
    };
    let target = candidate.metadata.labels.as_ref()?.get(key)?.clone();

    let mut counts: BTreeMap<String, i64> = nodes
        .iter()
        .filter_map(|n| n.metadata.labels.as_ref()?.get(key).cloned())
        .map(|domain| (domain, 0))
        .collect();
    for other in placed.iter().filter(|o| counts_towards(constraint, instance, o)) {
        if let Some(domain) = other.spec.node_ref.as_ref().and_then(|r| domain_of(&r.name)) {
            *counts.entry(domain).or_default() += 1;
        }
    }
    *counts.entry(target).or_default() += 1;
    let max = counts.values().max().copied().unwrap_or_default();
    let min = counts.values().min().copied().unwrap_or_default();
    Some(max - min)
}

/// Node `instance` should be pinned to, given the cluster's `nodes` and the
/// instances already `placed`.
pub fn pick_node<'a>(instance: &Instance, nodes: &'a [Node], placed: &[Instance]) -> Option<&'a Node> {
    let controller = controller_of(instance).map(|r| r.uid.as_str());
    let eligible: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.metadata.name.is_some())
        .filter(|n| !n.spec.unschedulable && !is_deleting(*n) && fits_affinity(instance, n))
        .collect();

    let occupied = |name: &str| {
        controller.is_some_and(|uid| {
            placed.iter().any(|other| {
                other.spec.node_ref.as_ref().is_some_and(|r| r.name == name)
                    && controller_of(other).is_some_and(|r| r.uid == uid)
            })
        })
    };

    let mut best: Option<(i64, &'a Node)> = None;
    for &node in &eligible {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        if occupied(name) {
            continue;
        }
        let skews: Option<Vec<i64>> = instance
            .spec
            .topology_spread_constraints
            .iter()
            .map(|constraint| skew_with(constraint, instance, node, &eligible, placed))
            .collect();
        let Some(skews) = skews else {
            continue;
        };
        let score = skews.into_iter().max().unwrap_or_default();
        let better = best.is_none_or(|(best_score, best_node)| {
            (score, name) < (best_score, best_node.metadata.name.as_deref().unwrap_or_default())
        });
        if better {
            best = Some((score, node));
        }
    }
    best.map(|(_, node)| node)
}

impl Reconciler {
    /// Pin the `Instance` behind `key` to a node
    #[instrument(skip(self, key), fields(instance = %key))]
    pub async fn schedule_instance(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.instances.as_ref();
        let Some(instance) = client.get(key).await? else {
            self.indexes.unscheduled.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&instance) || instance.spec.node_ref.is_some() {
            self.indexes.unscheduled.remove(key);
            return Ok(Action::await_change());
        }

        let nodes = self.clients.nodes.list_all().await?;
        let placed: Vec<Instance> = client
            .list(key.namespace.as_deref(), &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|other| other.spec.node_ref.is_some() && !is_deleting(other))
            .collect();

        let Some(node) = pick_node(&instance, &nodes, &placed).and_then(|n| n.metadata.name.clone()) else {
            debug!(nodes = nodes.len(), "No node fits instance");
            self.indexes.unscheduled.insert(key.clone(), ALL.to_string());
            return Ok(Action::await_change());
        };
        let patch = json!({
            "metadata": { "resourceVersion": instance.metadata.resource_version },
            "spec": { "nodeRef": { "name": node } },
        });
        client.patch(key, &patch).await?;
        self.indexes.unscheduled.remove(key);
        info!(node = %node, "Scheduled instance");
        Ok(Action::await_change())
    }
}

/// Reconciler handle scheduling `Instance`s
#[derive(Debug, Clone)]
pub struct Scheduler(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for Scheduler {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "scheduler"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.schedule_instance(key).await
    }
}
