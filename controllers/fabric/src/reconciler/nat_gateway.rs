//! NATGateway reconciliation
//!
//! A gateway owns one `IP` per entry of `spec.ips` and one `NATTable` named
//! after itself. The table hands every interface claiming the gateway a port
//! range on one of the gateway addresses; ranges already handed out stay
//! where they are as long as they remain valid.

use super::owned_ips::WantedIP;
use super::{
    FIELD_MANAGER, Reconciler, allocated_condition, controller_reference, patch_status_if_changed, reasons, scoped,
};
use crate::error::ControllerError;
use crds::{
    IpFamily, LocalObjectReference, NATClaimRef, NATGateway, NATGatewayIPStatus, NATIP, NATIPSection, NATTable,
    NATTableSpec, NATTableTargetRef, NetworkInterface, REASON_ALLOCATED, REASON_INVALID, REASON_OVER_SUBSCRIBED,
    set_condition,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, is_deleting};
use ipam::{AllocationManager, NatError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Interface to translate behind a gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTarget {
    /// Interface name
    pub name: String,
    /// Interface UID
    pub uid: String,
    /// Interface address of the gateway's family
    pub ip: IpAddr,
    /// Node hosting the interface
    pub node_ref: Option<LocalObjectReference>,
}

/// Table contents computed for a set of gateway addresses and targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPlan {
    /// Sections per gateway address, in gateway order
    pub ips: Vec<NATIP>,
    /// Targets that received a range
    pub used: i64,
    /// Targets asking for a range
    pub requested: i64,
}

/// Place `targets` on `gateway_ips` with ranges of `ports` ports.
///
/// Targets keep their range from `existing` when it is still valid on the
/// current addresses. The remaining targets take the next free range in
/// order until none is left.
pub fn plan_nat_table(
    ports: i32,
    gateway_ips: &[IpAddr],
    existing: Option<&NATTableSpec>,
    targets: &[NatTarget],
) -> Result<NatPlan, NatError> {
    let mut addresses: Vec<IpAddr> = Vec::with_capacity(gateway_ips.len());
    for ip in gateway_ips {
        if !addresses.contains(ip) {
            addresses.push(*ip);
        }
    }
    let mut manager = AllocationManager::new(ports, addresses.iter().copied())?;

    let previous: HashMap<&str, (IpAddr, i32, i32)> = existing
        .into_iter()
        .flat_map(|table| table.ips.iter())
        .flat_map(|nat_ip| {
            nat_ip.sections.iter().filter_map(move |section| {
                section
                    .target_ref
                    .as_ref()
                    .map(|target| (target.uid.as_str(), (nat_ip.ip, section.port, section.end_port)))
            })
        })
        .collect();

    let mut sections: BTreeMap<IpAddr, Vec<NATIPSection>> = BTreeMap::new();
    let section = |target: &NatTarget, port: i32, end_port: i32| NATIPSection {
        ip: target.ip,
        port,
        end_port,
        target_ref: Some(NATTableTargetRef {
            name: target.name.clone(),
            uid: target.uid.clone(),
            node_ref: target.node_ref.clone(),
        }),
    };

    let mut unplaced = Vec::new();
    for target in targets {
        match previous.get(target.uid.as_str()) {
            Some(&(ip, port, end_port)) if manager.has_ip(&ip) && manager.use_ports(ip, port, end_port).is_ok() => {
                sections.entry(ip).or_default().push(section(target, port, end_port));
            }
            _ => unplaced.push(target),
        }
    }
    for target in unplaced {
        let Some(allocation) = manager.use_next_free() else {
            break;
        };
        sections
            .entry(allocation.ip)
            .or_default()
            .push(section(target, allocation.port, allocation.end_port));
    }

    let used = sections.values().map(Vec::len).sum::<usize>() as i64;
    let ips = addresses
        .iter()
        .map(|ip| {
            let mut placed = sections.remove(ip).unwrap_or_default();
            placed.sort_by_key(|s| s.port);
            NATIP {
                ip: *ip,
                sections: placed,
            }
        })
        .collect();
    Ok(NatPlan {
        ips,
        used,
        requested: targets.len() as i64,
    })
}

fn family_ip(nic: &NetworkInterface, family: IpFamily) -> Option<IpAddr> {
    nic.spec.ips.iter().copied().find(|ip| IpFamily::of(ip) == family)
}

impl Reconciler {
    /// Interfaces `gateway` translates, sorted by name.
    ///
    /// An interface on the gateway's network belongs to the gateway its claim
    /// for the family names. Unclaimed interfaces, and those whose claimed
    /// gateway is gone, are claimed for `gateway` on the way. A claim without
    /// a UID is a request for a gateway that has not taken it yet and is left
    /// alone. Interfaces with a public address of the family need no
    /// translation.
    pub async fn nat_targets(&self, gateway: &NATGateway) -> Result<Vec<NatTarget>, ControllerError> {
        let namespace = gateway.metadata.namespace.as_deref();
        let network = &gateway.spec.network_ref.name;
        let family = gateway.spec.ip_family;
        let (Some(name), Some(uid)) = (gateway.metadata.name.as_deref(), gateway.metadata.uid.as_deref()) else {
            return Ok(Vec::new());
        };

        let live: HashSet<String> = self
            .clients
            .nat_gateways
            .list(namespace, &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|g| !is_deleting(g) && g.spec.network_ref.name == *network && g.spec.ip_family == family)
            .filter_map(|g| g.metadata.name)
            .collect();

        let mut targets = Vec::new();
        for nic in self.clients.network_interfaces.list(namespace, &BTreeMap::new()).await? {
            if is_deleting(&nic)
                || nic.spec.network_ref.name != *network
                || nic.spec.public_ips.iter().any(|ip| IpFamily::of(ip) == family)
            {
                continue;
            }
            let Some(ip) = family_ip(&nic, family) else {
                continue;
            };
            match nic.spec.nat_claim(family) {
                Some(claim) if claim.name == name && claim.uid == uid => {}
                Some(claim) if claim.name != name && (claim.uid.is_empty() || live.contains(&claim.name)) => continue,
                _ => self.claim_for_nat(&nic, name, uid, family).await?,
            }
            let (Some(nic_name), Some(nic_uid)) = (nic.metadata.name.clone(), nic.metadata.uid.clone()) else {
                continue;
            };
            targets.push(NatTarget {
                name: nic_name,
                uid: nic_uid,
                ip,
                node_ref: nic.spec.node_ref.clone(),
            });
        }
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(targets)
    }

    /// Point the `family` claim of `nic` at gateway `name`
    async fn claim_for_nat(
        &self,
        nic: &NetworkInterface,
        name: &str,
        uid: &str,
        family: IpFamily,
    ) -> Result<(), ControllerError> {
        let mut claims: Vec<NATClaimRef> = nic
            .spec
            .nat_claim_refs
            .iter()
            .filter(|claim| claim.ip_family != family)
            .cloned()
            .collect();
        claims.push(NATClaimRef {
            name: name.to_string(),
            uid: uid.to_string(),
            ip_family: family,
        });
        let patch = json!({
            "metadata": { "resourceVersion": nic.metadata.resource_version },
            "spec": { "natClaimRefs": claims },
        });
        let key = ObjectKey::of(nic);
        self.clients.network_interfaces.patch(&key, &patch).await?;
        debug!(network_interface = %key, family = ?family, "Claimed interface for NAT");
        Ok(())
    }

    /// Reconcile the `NATGateway` behind `key`
    #[instrument(skip(self, key), fields(nat_gateway = %key))]
    pub async fn reconcile_nat_gateway(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.nat_gateways.as_ref();
        let Some(gateway) = client.get(key).await? else {
            self.indexes.nat_gateways.remove(key);
            return Ok(Action::await_change());
        };
        if is_deleting(&gateway) {
            return Ok(Action::await_change());
        }
        let ports = gateway.spec.ports_per_network_interface;
        self.indexes
            .nat_gateways
            .insert(key.clone(), scoped(key.namespace_str(), &gateway.spec.network_ref.name));

        if let Err(e) = ipam::nat::slots_per_ip(ports) {
            return self.reject_nat_gateway(&gateway, e.to_string()).await;
        }
        let existing = self.clients.nat_tables.get(key).await?;
        if let Some(table) = &existing
            && table.spec.ports_per_network_interface != 0
            && table.spec.ports_per_network_interface != ports
        {
            let note = format!(
                "portsPerNetworkInterface cannot change from {} to {ports}",
                table.spec.ports_per_network_interface
            );
            return self.reject_nat_gateway(&gateway, note).await;
        }

        let wanted: Vec<WantedIP> = gateway
            .spec
            .ips
            .iter()
            .map(|ip| WantedIP {
                name: ip.name.clone(),
                family: gateway.spec.ip_family,
                ip: ip.ip,
            })
            .collect();
        let resolved: Vec<NATGatewayIPStatus> = self
            .sync_owned_ips(&gateway, &wanted)
            .await?
            .into_iter()
            .filter_map(|owned| owned.ip.map(|ip| NATGatewayIPStatus { name: owned.name, ip }))
            .collect();
        let addresses: Vec<IpAddr> = resolved.iter().map(|r| r.ip).collect();

        let targets = self.nat_targets(&gateway).await?;
        let plan = plan_nat_table(ports, &addresses, existing.as_ref().map(|t| &t.spec), &targets)?;

        let unchanged = existing
            .as_ref()
            .is_some_and(|t| t.spec.ports_per_network_interface == ports && t.spec.ips == plan.ips);
        if !unchanged {
            let table = NATTable {
                metadata: ObjectMeta {
                    name: Some(key.name.clone()),
                    namespace: key.namespace.clone(),
                    owner_references: controller_reference(&gateway).map(|r| vec![r]),
                    ..Default::default()
                },
                spec: NATTableSpec {
                    ports_per_network_interface: ports,
                    ips: plan.ips.clone(),
                },
            };
            self.clients.nat_tables.apply(&table, FIELD_MANAGER).await?;
            info!(used = plan.used, requested = plan.requested, "Applied NAT table");
        }

        let mut status = gateway.status.clone().unwrap_or_default();
        status.ips = resolved;
        status.used_nat_ips = plan.used;
        status.requested_nat_ips = plan.requested;
        let over_subscribed = plan.used < plan.requested;
        let condition = if over_subscribed {
            allocated_condition(
                false,
                REASON_OVER_SUBSCRIBED,
                format!("{} of {} interfaces placed", plan.used, plan.requested),
                gateway.metadata.generation,
            )
        } else {
            allocated_condition(true, REASON_ALLOCATED, "", gateway.metadata.generation)
        };
        let transitioned = set_condition(&mut status.conditions, condition.clone());
        if patch_status_if_changed(client, &gateway, gateway.status.as_ref(), &status).await?
            && over_subscribed
            && transitioned
        {
            self.record(
                &gateway,
                FabricEvent::warning(reasons::OVER_SUBSCRIBED, "Allocate", condition.message),
            )
            .await;
        }
        Ok(Action::await_change())
    }

    async fn reject_nat_gateway(&self, gateway: &NATGateway, note: String) -> Result<Action, ControllerError> {
        debug!(note = %note, "Rejecting NAT gateway");
        let event = FabricEvent::warning(reasons::INVALID_SPEC, "Allocate", note);
        self.report_not_allocated(
            self.clients.nat_gateways.as_ref(),
            gateway,
            gateway.status.as_ref(),
            REASON_INVALID,
            event,
        )
        .await?;
        Ok(Action::await_change())
    }
}

/// Reconciler handle for `NATGateway`
#[derive(Debug, Clone)]
pub struct NATGateways(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for NATGateways {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "natgateway"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_nat_gateway(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, ip: &str) -> NatTarget {
        NatTarget {
            name: name.to_string(),
            uid: format!("uid-{name}"),
            ip: ip.parse().unwrap(),
            node_ref: None,
        }
    }

    fn ranges(plan: &NatPlan) -> Vec<(String, i32, i32)> {
        plan.ips
            .iter()
            .flat_map(|ip| ip.sections.iter())
            .map(|s| (s.target_ref.as_ref().unwrap().name.clone(), s.port, s.end_port))
            .collect()
    }

    #[test]
    fn test_plan_keeps_existing_ranges() {
        let gateway: IpAddr = "203.0.113.1".parse().unwrap();
        let first = plan_nat_table(
            64,
            &[gateway],
            None,
            &[target("a", "10.0.0.1"), target("b", "10.0.0.2")],
        )
        .unwrap();
        let existing = NATTableSpec {
            ports_per_network_interface: 64,
            ips: first.ips.clone(),
        };

        // "a" leaves, "c" joins; "b" keeps its range and "c" takes the freed one
        let second = plan_nat_table(
            64,
            &[gateway],
            Some(&existing),
            &[target("b", "10.0.0.2"), target("c", "10.0.0.3")],
        )
        .unwrap();
        assert_eq!(
            ranges(&second),
            vec![("c".to_string(), 1024, 1087), ("b".to_string(), 1088, 1151)]
        );
        assert_eq!(second.used, 2);
    }

    #[test]
    fn test_plan_drops_ranges_on_removed_addresses() {
        let old: IpAddr = "203.0.113.1".parse().unwrap();
        let new: IpAddr = "203.0.113.2".parse().unwrap();
        let first = plan_nat_table(64, &[old], None, &[target("a", "10.0.0.1")]).unwrap();
        let existing = NATTableSpec {
            ports_per_network_interface: 64,
            ips: first.ips,
        };
        let second = plan_nat_table(64, &[new], Some(&existing), &[target("a", "10.0.0.1")]).unwrap();
        assert_eq!(second.ips.len(), 1);
        assert_eq!(second.ips[0].ip, new);
        assert_eq!(second.ips[0].sections[0].port, 1024);
    }

    #[test]
    fn test_plan_reports_over_subscription() {
        let gateway: IpAddr = "203.0.113.1".parse().unwrap();
        // 64512 / 32256 = 2 ranges per address
        let plan = plan_nat_table(
            32256,
            &[gateway],
            None,
            &[target("a", "10.0.0.1"), target("b", "10.0.0.2"), target("c", "10.0.0.3")],
        )
        .unwrap();
        assert_eq!(plan.used, 2);
        assert_eq!(plan.requested, 3);
    }

    #[test]
    fn test_plan_rejects_invalid_port_count() {
        assert!(plan_nat_table(1000, &[], None, &[]).is_err());
    }
}
