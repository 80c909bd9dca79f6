//! NetworkInterface mirroring
//!
//! An interface belongs to this partition when its node is named
//! `<partition>.<hostNode>`. Its mirror in the host cluster is named after
//! the interface UID and carries source labels pointing back at it. The
//! mirror's observed state is copied back onto the interface status.

use super::{
    FIELD_MANAGER, Reconciler, firewall, host_node_dependency, load_balancer_dependency, network_dependency,
    policy_dependency,
};
use crate::error::ControllerError;
use crds::metalnet::{self, NATDetails};
use crds::{
    IpFamily, NetworkInterface, NetworkInterfaceState, NetworkInterfaceStatus, PARTITION_AGENT_FINALIZER,
};
use fabric_client::{ObjectClient, ObjectKey};
use fabric_runtime::{Action, ensure_finalizer, has_finalizer, is_deleting, remove_finalizer, requeue};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// State of the mirror as seen from the interface
pub fn observed_status(mirror: Option<&metalnet::NetworkInterfaceStatus>) -> NetworkInterfaceStatus {
    let Some(mirror) = mirror else {
        return NetworkInterfaceStatus::default();
    };
    NetworkInterfaceStatus {
        state: match mirror.state {
            metalnet::NetworkInterfaceState::Pending => NetworkInterfaceState::Pending,
            metalnet::NetworkInterfaceState::Ready => NetworkInterfaceState::Ready,
            metalnet::NetworkInterfaceState::Error => NetworkInterfaceState::Error,
        },
        pci_address: mirror.pci_address.clone(),
        public_ips: mirror.virtual_ip.into_iter().collect(),
        nat_ips: mirror.nat_ip.iter().map(|nat| nat.ip).collect(),
        prefixes: mirror.prefixes.clone(),
    }
}

/// Families of `ips`, in order of first appearance
fn families(ips: &[IpAddr]) -> Vec<IpFamily> {
    let mut families = Vec::new();
    for family in ips.iter().map(IpFamily::of) {
        if !families.contains(&family) {
            families.push(family);
        }
    }
    families
}

impl Reconciler {
    /// Host node of `nic` when it is scheduled in this partition
    pub fn host_node_name<'a>(&self, nic: &'a NetworkInterface) -> Option<&'a str> {
        nic.spec
            .node_ref
            .as_ref()?
            .name
            .strip_prefix(self.partition_name.as_str())?
            .strip_prefix('.')
            .filter(|host| !host.is_empty())
    }

    fn mirror_key(&self, uid: &str) -> ObjectKey {
        ObjectKey::namespaced(&self.host_namespace, uid)
    }

    /// Delete every mirror derived from the interface behind `key`
    async fn delete_mirrors(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let mirrors = self
            .clients
            .mirrors
            .list(Some(&self.host_namespace), &self.source_labels.selector(key))
            .await?;
        for mirror in mirrors {
            let mirror_key = ObjectKey::of(&mirror);
            if self.clients.mirrors.delete_if_exists(&mirror_key).await? {
                info!(mirror = %mirror_key, "Deleted dataplane mirror");
            }
        }
        Ok(())
    }

    /// Delete the mirrors of `nic` and let go of it
    async fn release(&self, nic: &NetworkInterface) -> Result<(), ControllerError> {
        let key = ObjectKey::of(nic);
        self.delete_mirrors(&key).await?;
        remove_finalizer(self.clients.network_interfaces.as_ref(), nic, PARTITION_AGENT_FINALIZER).await?;
        self.dependencies.remove(&key);
        Ok(())
    }

    /// VNI of the network of `nic`, once allocated
    async fn network_vni(&self, nic: &NetworkInterface) -> Result<Option<i32>, ControllerError> {
        let namespace = nic.metadata.namespace.as_deref().unwrap_or_default();
        let key = ObjectKey::namespaced(namespace, &nic.spec.network_ref.name);
        Ok(self
            .clients
            .networks
            .get(&key)
            .await?
            .and_then(|network| network.status)
            .and_then(|status| status.vni))
    }

    /// NAT section a claimed gateway placed `nic` in, IPv4 first
    async fn nat_details(&self, nic: &NetworkInterface, uid: &str) -> Result<Option<NATDetails>, ControllerError> {
        let namespace = nic.metadata.namespace.clone().unwrap_or_default();
        let mut claims: Vec<_> = nic.spec.nat_claim_refs.iter().collect();
        claims.sort_by_key(|claim| claim.ip_family);
        for claim in claims {
            let key = ObjectKey::namespaced(namespace.clone(), claim.name.clone());
            let Some(table) = self.clients.nat_tables.get(&key).await? else {
                continue;
            };
            let section = table.spec.ips.iter().find_map(|nat_ip| {
                nat_ip
                    .sections
                    .iter()
                    .find(|s| s.target_ref.as_ref().is_some_and(|t| t.uid == uid))
                    .map(|s| NATDetails {
                        ip: nat_ip.ip,
                        port: s.port,
                        end_port: s.end_port,
                    })
            });
            if section.is_some() {
                return Ok(section);
            }
        }
        Ok(None)
    }

    /// Frontend addresses of every load balancer routing to `nic`, plus the
    /// names of those load balancers.
    async fn load_balancer_targets(
        &self,
        nic: &NetworkInterface,
    ) -> Result<(Vec<String>, Vec<String>), ControllerError> {
        let namespace = nic.metadata.namespace.as_deref();
        let routings = self
            .clients
            .load_balancer_routings
            .list(namespace, &BTreeMap::new())
            .await?;
        let mut names = Vec::new();
        let mut targets = BTreeSet::new();
        for routing in routings {
            let routes_here = routing.spec.network_ref == nic.spec.network_ref
                && routing.spec.destinations.iter().any(|d| nic.spec.ips.contains(&d.ip));
            let Some(name) = routing.metadata.name.filter(|_| routes_here) else {
                continue;
            };
            let key = ObjectKey::namespaced(namespace.unwrap_or_default(), &name);
            if let Some(lb) = self.clients.load_balancers.get(&key).await? {
                targets.extend(lb.status.iter().flat_map(|s| s.ips.iter()).map(ToString::to_string));
            }
            names.push(name);
        }
        Ok((targets.into_iter().collect(), names))
    }

    /// Firewall entries of every policy rule targeting `nic`, plus the names
    /// of those rules.
    async fn firewall_rules(
        &self,
        nic: &NetworkInterface,
        uid: &str,
    ) -> Result<(Vec<metalnet::FirewallRule>, Vec<String>), ControllerError> {
        let mut rules = self
            .clients
            .network_policy_rules
            .list(nic.metadata.namespace.as_deref(), &BTreeMap::new())
            .await?;
        rules.retain(|rule| {
            rule.spec.network_ref == nic.spec.network_ref
                && rule.spec.targets.iter().any(|t| t.target_ref.uid == uid)
        });
        rules.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let entries = rules.iter().flat_map(firewall::expand).collect();
        let names = rules.into_iter().filter_map(|rule| rule.metadata.name).collect();
        Ok((entries, names))
    }

    /// Reconcile the interface behind `key`
    #[instrument(skip(self, key), fields(network_interface = %key))]
    pub async fn reconcile_network_interface(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let client = self.clients.network_interfaces.as_ref();
        let Some(nic) = client.get(key).await? else {
            debug!("Interface gone");
            self.dependencies.remove(key);
            self.delete_mirrors(key).await?;
            return Ok(Action::await_change());
        };

        let Some(host) = self.host_node_name(&nic).map(str::to_string) else {
            if has_finalizer(&nic, PARTITION_AGENT_FINALIZER) {
                info!("Interface left the partition");
                self.release(&nic).await?;
            }
            return Ok(Action::await_change());
        };
        if is_deleting(&nic) {
            if has_finalizer(&nic, PARTITION_AGENT_FINALIZER) {
                info!("Cleaning up deleted interface");
                self.release(&nic).await?;
            }
            return Ok(Action::await_change());
        }

        let namespace = key.namespace_str();
        self.dependencies.insert(
            key.clone(),
            vec![
                host_node_dependency(&host),
                network_dependency(namespace, &nic.spec.network_ref.name),
            ],
        );
        let node = self.clients.host_nodes.get(&ObjectKey::cluster(&host)).await?;
        if node.as_ref().is_none_or(is_deleting) {
            info!(host, "Host node absent or terminating");
            self.delete_mirrors(key).await?;
            remove_finalizer(client, &nic, PARTITION_AGENT_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        if ensure_finalizer(client, &nic, PARTITION_AGENT_FINALIZER).await? {
            return Ok(requeue());
        }
        self.sync_mirror(nic, host).await
    }

    async fn sync_mirror(&self, nic: NetworkInterface, host: String) -> Result<Action, ControllerError> {
        let key = ObjectKey::of(&nic);
        let namespace = key.namespace_str();
        let uid = nic.metadata.uid.clone().unwrap_or_default();

        let (load_balancer_targets, load_balancers) = self.load_balancer_targets(&nic).await?;
        let (firewall_rules, policies) = self.firewall_rules(&nic, &uid).await?;
        let mut dependencies = vec![
            host_node_dependency(&host),
            network_dependency(namespace, &nic.spec.network_ref.name),
        ];
        dependencies.extend(load_balancers.iter().map(|name| load_balancer_dependency(namespace, name)));
        dependencies.extend(policies.iter().map(|name| policy_dependency(namespace, name)));
        self.dependencies.insert(key.clone(), dependencies);

        let Some(vni) = self.network_vni(&nic).await? else {
            debug!(network = %nic.spec.network_ref.name, "Network has no VNI yet");
            self.copy_status(&nic, None).await?;
            return Ok(Action::await_change());
        };

        let mirror_key = self.mirror_key(&uid);
        let existing = self.clients.mirrors.get(&mirror_key).await?;
        let existing_rules = existing
            .as_ref()
            .map(|m| m.spec.firewall_rules.as_slice())
            .unwrap_or_default();
        let spec = metalnet::NetworkInterfaceSpec {
            vni,
            ip_families: families(&nic.spec.ips),
            ips: nic.spec.ips.clone(),
            virtual_ip: nic.spec.public_ips.iter().copied().find(IpAddr::is_ipv4),
            nat: self.nat_details(&nic, &uid).await?,
            prefixes: nic.spec.prefixes.clone(),
            load_balancer_targets,
            firewall_rules: firewall::assign_ids(existing_rules, firewall_rules),
            node_name: host,
        };

        let labels = self.source_labels.for_object(&nic);
        let up_to_date = existing.as_ref().is_some_and(|mirror| {
            mirror.spec == spec
                && mirror
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|current| labels.iter().all(|(k, v)| current.get(k) == Some(v)))
        });
        let mirror = if up_to_date {
            existing
        } else {
            let desired = metalnet::NetworkInterface {
                metadata: ObjectMeta {
                    name: Some(mirror_key.name.clone()),
                    namespace: Some(self.host_namespace.clone()),
                    labels: Some(labels),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            let applied = self.clients.mirrors.apply(&desired, FIELD_MANAGER).await?;
            info!(mirror = %mirror_key, vni, "Applied dataplane mirror");
            Some(applied)
        };

        self.copy_status(&nic, mirror.as_ref().and_then(|m| m.status.as_ref()))
            .await?;
        Ok(Action::await_change())
    }

    async fn copy_status(
        &self,
        nic: &NetworkInterface,
        mirror: Option<&metalnet::NetworkInterfaceStatus>,
    ) -> Result<(), ControllerError> {
        let status = observed_status(mirror);
        if nic.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.clients
            .network_interfaces
            .patch_status(&ObjectKey::of(nic), &serde_json::json!({ "status": status }))
            .await?;
        debug!(state = ?status.state, "Copied dataplane status");
        Ok(())
    }
}

/// Reconciler handle for the interfaces of the partition
#[derive(Debug, Clone)]
pub struct NetworkInterfaces(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl fabric_runtime::Reconciler for NetworkInterfaces {
    type Error = ControllerError;

    fn name(&self) -> &str {
        "networkinterface"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        self.0.reconcile_network_interface(key).await
    }
}
