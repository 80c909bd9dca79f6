//! NATGatewayAutoscaler reconciliation
//!
//! Sizes `spec.ips` of the referenced gateway so that every interface it
//! serves fits, within `[minPublicIPs, maxPublicIPs]`. Addresses are only
//! removed when rebuilding the table without them keeps every placed
//! interface placed.

use super::nat_gateway::plan_nat_table;
use super::{Reconciler, patch_status_if_changed, scoped};
use crate::error::ControllerError;
use crds::{NATGateway, NATGatewayAutoscaler, NATGatewayAutoscalerStatus, NATGatewayIP};
use fabric_client::{ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting};
use serde_json::json;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Default lower bound of gateway addresses
pub const DEFAULT_MIN_PUBLIC_IPS: i32 = 1;

/// Addresses needed for `requested` interfaces at `slots` interfaces per address,
/// clamped to `[min, max]`.
pub fn desired_public_ips(requested: i64, slots: u32, min: i32, max: i32) -> i32 {
    let slots = i64::from(slots.max(1));
    let needed = (requested.max(0) + slots - 1) / slots;
    let needed = i32::try_from(needed).unwrap_or(i32::MAX);
    needed.clamp(min, max.max(min))
}

fn next_ip_names(existing: &[NATGatewayIP], prefix: &str, count: usize) -> Vec<String> {
    let taken: BTreeSet<&str> = existing.iter().map(|ip| ip.name.as_str()).collect();
    (0..)
        .map(|i| format!("{prefix}-{i}"))
        .filter(|name| !taken.contains(name.as_str()))
        .take(count)
        .collect()
}

impl Reconciler {
    /// Reconcile the `NATGatewayAutoscaler` behind `key`
    #[instrument(skip(self, key), fields(nat_autoscaler = %key))]
    pub async fn reconcile_nat_autoscaler(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.nat_autoscalers.as_ref();
        let Some(autoscaler) = client.get(key).await? else {
            self.indexes.nat_autoscalers.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&autoscaler) {
            return Ok(Action::await_change());
        }
        let gateway_name = &autoscaler.spec.nat_gateway_ref.name;
        self.indexes
            .nat_autoscalers
            .insert(key.clone(), scoped(key.namespace_str(), gateway_name));

        let gateway_key = ObjectKey::namespaced(key.namespace_str(), gateway_name);
        let Some(gateway) = self.clients.nat_gateways.get(&gateway_key).await? else {
            debug!(gateway = %gateway_key, "Gateway not found");
            return Ok(Action::await_change());
        };
        let Ok(slots) = ipam::nat::slots_per_ip(gateway.spec.ports_per_network_interface) else {
            debug!(gateway = %gateway_key, "Gateway has an invalid port count");
            return Ok(Action::await_change());
        };

        let status = gateway.status.clone().unwrap_or_default();
        let desired = desired_public_ips(
            status.requested_nat_ips,
            slots,
            autoscaler.spec.min_public_ips.unwrap_or(DEFAULT_MIN_PUBLIC_IPS),
            autoscaler.spec.max_public_ips.unwrap_or(i32::MAX),
        );
        let current = gateway.spec.ips.len();
        let target = usize::try_from(desired).unwrap_or_default();

        if target > current {
            let mut ips = gateway.spec.ips.clone();
            ips.extend(
                next_ip_names(&ips, &key.name, target - current)
                    .into_iter()
                    .map(|name| NATGatewayIP { name, ip: None }),
            );
            info!(gateway = %gateway_key, from = current, to = target, "Scaling NAT gateway up");
            self.patch_gateway_ips(&gateway, &ips).await?;
        } else if target < current
            && let Some(ips) = self.scale_down(&gateway, target).await?
        {
            info!(gateway = %gateway_key, from = current, to = ips.len(), "Scaling NAT gateway down");
            self.patch_gateway_ips(&gateway, &ips).await?;
        }

        let desired_status = NATGatewayAutoscalerStatus {
            desired_public_ips: Some(desired),
        };
        patch_status_if_changed(client, &autoscaler, autoscaler.status.as_ref(), &desired_status).await?;
        Ok(Action::await_change())
    }

    /// Smallest address list of at least `target` entries that keeps every
    /// placed interface placed; `None` when nothing can go.
    async fn scale_down(&self, gateway: &NATGateway, target: usize) -> Result<Option<Vec<NATGatewayIP>>, ControllerError> {
        let status = gateway.status.clone().unwrap_or_default();
        let table = self.clients.nat_tables.get(&ObjectKey::of(gateway)).await?;
        let targets = self.nat_targets(gateway).await?;

        let resolved = |name: &str| status.ips.iter().find(|ip| ip.name == name).map(|ip| ip.ip);
        let load = |ip: Option<IpAddr>| {
            table
                .as_ref()
                .and_then(|t| t.spec.ips.iter().find(|nat_ip| Some(nat_ip.ip) == ip))
                .map_or(0, |nat_ip| nat_ip.sections.len())
        };

        // Least loaded first, later entries first among equals
        let mut removal: Vec<usize> = (0..gateway.spec.ips.len()).collect();
        removal.sort_by_key(|&i| (load(resolved(&gateway.spec.ips[i].name)), std::cmp::Reverse(i)));

        let current = gateway.spec.ips.len();
        for keep in target..current {
            let dropped: BTreeSet<usize> = removal.iter().take(current - keep).copied().collect();
            let kept: Vec<NATGatewayIP> = gateway
                .spec
                .ips
                .iter()
                .enumerate()
                .filter(|(i, _)| !dropped.contains(i))
                .map(|(_, ip)| ip.clone())
                .collect();
            let addresses: Vec<IpAddr> = kept.iter().filter_map(|ip| resolved(&ip.name)).collect();
            let plan = plan_nat_table(
                gateway.spec.ports_per_network_interface,
                &addresses,
                table.as_ref().map(|t| &t.spec),
                &targets,
            )?;
            if plan.used == status.used_nat_ips {
                return Ok(Some(kept));
            }
            debug!(keep, used = plan.used, before = status.used_nat_ips, "Scale down would evict interfaces");
        }
        Ok(None)
    }

    async fn patch_gateway_ips(&self, gateway: &NATGateway, ips: &[NATGatewayIP]) -> Result<(), ControllerError> {
        let patch = json!({
            "metadata": { "resourceVersion": gateway.metadata.resource_version },
            "spec": { "ips": ips },
        });
        self.clients
            .nat_gateways
            .patch(&ObjectKey::of(gateway), &patch)
            .await?;
        Ok(())
    }
}

/// Reconciler handle for `NATGatewayAutoscaler`
#[derive(Debug, Clone)]
pub struct NATGatewayAutoscalers(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for NATGatewayAutoscalers {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "natgatewayautoscaler"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_nat_autoscaler(key).await
    }
}
