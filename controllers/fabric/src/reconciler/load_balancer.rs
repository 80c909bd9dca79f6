//! LoadBalancer reconciliation
//!
//! A load balancer is materialized as a `DaemonSet` of `Instance`s carrying
//! its addresses and ports, plus a `LoadBalancerRouting` listing the
//! interfaces traffic is forwarded to. Public load balancers allocate their
//! addresses through owned `IP`s; internal ones must name them literally.

use super::owned_ips::WantedIP;
use super::{FIELD_MANAGER, Reconciler, controller_reference, patch_status_if_changed, reasons, same_spec, scoped};
use crate::error::ControllerError;
use crds::{
    DaemonSet, DaemonSetSpec, InstanceSpec, InstanceTemplate, InstanceType, LABEL_LOAD_BALANCER_NAME, LabelSelector,
    LoadBalancer, LoadBalancerDestination, LoadBalancerRouting, LoadBalancerRoutingSpec, LoadBalancerStatus,
    LoadBalancerType, LocalUIDReference,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting, matches_label_selector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Labels of the instances of load balancer `name`
pub fn instance_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_LOAD_BALANCER_NAME.to_string(), name.to_string())])
}

/// Desired `DaemonSet` spec of `lb` serving `ips`
pub fn daemon_set_spec(lb: &LoadBalancer, ips: Vec<IpAddr>) -> DaemonSetSpec {
    let labels = instance_labels(lb.metadata.name.as_deref().unwrap_or_default());
    DaemonSetSpec {
        selector: LabelSelector {
            match_labels: labels.clone(),
            ..Default::default()
        },
        node_selector: lb.spec.node_selector.clone(),
        template: InstanceTemplate {
            labels,
            spec: InstanceSpec {
                type_: InstanceType::LoadBalancer,
                load_balancer_type: Some(lb.spec.type_),
                network_ref: lb.spec.network_ref.clone(),
                ips,
                load_balancer_ports: lb.spec.ports.clone(),
                node_ref: None,
                affinity: None,
                topology_spread_constraints: Vec::new(),
            },
        },
    }
}

impl Reconciler {
    /// Interfaces `lb` forwards to, ordered by interface name and address.
    ///
    /// A load balancer without an interface selector forwards nowhere.
    pub async fn load_balancer_destinations(
        &self,
        lb: &LoadBalancer,
    ) -> Result<Vec<LoadBalancerDestination>, ControllerError> {
        let Some(selector) = lb.spec.network_interface_selector.as_ref() else {
            return Ok(Vec::new());
        };
        let empty = BTreeMap::new();
        let mut nics = self
            .clients
            .network_interfaces
            .list(lb.metadata.namespace.as_deref(), &empty)
            .await?;
        nics.retain(|nic| {
            !is_deleting(nic)
                && nic.spec.network_ref == lb.spec.network_ref
                && matches_label_selector(selector, nic.metadata.labels.as_ref().unwrap_or(&empty))
        });
        nics.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut destinations = Vec::new();
        for nic in &nics {
            let target_ref = match (&nic.metadata.name, &nic.metadata.uid) {
                (Some(name), Some(uid)) => Some(LocalUIDReference {
                    name: name.clone(),
                    uid: uid.clone(),
                }),
                _ => None,
            };
            let mut ips = nic.spec.ips.clone();
            ips.sort();
            destinations.extend(ips.into_iter().map(|ip| LoadBalancerDestination {
                ip,
                target_ref: target_ref.clone(),
            }));
        }
        Ok(destinations)
    }

    /// Reconcile the `LoadBalancer` behind `key`
    #[instrument(skip(self, key), fields(load_balancer = %key))]
    pub async fn reconcile_load_balancer(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.load_balancers.as_ref();
        let Some(lb) = client.get(key).await? else {
            self.indexes.load_balancers.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&lb) {
            return Ok(Action::await_change());
        }
        self.indexes
            .load_balancers
            .insert(key.clone(), scoped(key.namespace_str(), &lb.spec.network_ref.name));

        let ips: Vec<Option<IpAddr>> = match lb.spec.type_ {
            LoadBalancerType::Public => {
                let wanted: Vec<WantedIP> = lb
                    .spec
                    .ips
                    .iter()
                    .map(|ip| WantedIP {
                        name: ip.name.clone(),
                        family: ip.ip_family,
                        ip: ip.ip,
                    })
                    .collect();
                self.sync_owned_ips(&lb, &wanted)
                    .await?
                    .into_iter()
                    .map(|owned| owned.ip)
                    .collect()
            }
            LoadBalancerType::Internal => {
                self.sync_owned_ips(&lb, &[]).await?;
                if let Some(missing) = lb.spec.ips.iter().find(|ip| ip.ip.is_none()) {
                    let note = format!("internal load balancer address {} needs a literal ip", missing.name);
                    self.record(&lb, FabricEvent::warning(reasons::INVALID_SPEC, "Reconcile", note))
                        .await;
                    return Ok(Action::await_change());
                }
                lb.spec.ips.iter().map(|ip| ip.ip).collect()
            }
        };
        let resolved: Vec<IpAddr> = ips.iter().flatten().copied().collect();

        let status = LoadBalancerStatus { ips: resolved.clone() };
        patch_status_if_changed(client, &lb, lb.status.as_ref(), &status).await?;

        let owner = controller_reference(&lb).map(|r| vec![r]);
        if resolved.len() == ips.len() {
            let spec = daemon_set_spec(&lb, resolved);
            let current = self.clients.daemon_sets.get(key).await?;
            if !current.as_ref().is_some_and(|ds| same_spec(&ds.spec, &spec)) {
                let ds = DaemonSet {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        namespace: key.namespace.clone(),
                        owner_references: owner.clone(),
                        ..Default::default()
                    },
                    spec,
                    status: None,
                };
                self.clients.daemon_sets.apply(&ds, FIELD_MANAGER).await?;
                info!("Applied load balancer daemon set");
            }
        } else {
            debug!(pending = ips.len() - resolved.len(), "Waiting for load balancer addresses");
        }

        let spec = LoadBalancerRoutingSpec {
            network_ref: lb.spec.network_ref.clone(),
            destinations: self.load_balancer_destinations(&lb).await?,
        };
        let current = self.clients.load_balancer_routings.get(key).await?;
        if !current.as_ref().is_some_and(|r| same_spec(&r.spec, &spec)) {
            let routing = LoadBalancerRouting {
                metadata: ObjectMeta {
                    name: Some(key.name.clone()),
                    namespace: key.namespace.clone(),
                    owner_references: owner,
                    ..Default::default()
                },
                spec,
            };
            self.clients
                .load_balancer_routings
                .apply(&routing, FIELD_MANAGER)
                .await?;
            info!(destinations = routing.spec.destinations.len(), "Applied load balancer routing");
        }
        Ok(Action::await_change())
    }
}

/// Reconciler handle for `LoadBalancer`
#[derive(Debug, Clone)]
pub struct LoadBalancers(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for LoadBalancers {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "loadbalancer"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_load_balancer(key).await
    }
}
