//! Orphan sweep
//!
//! Finalizers release allocations in the normal case. The sweep catches
//! what slipped through: allocation records whose claimer is gone or was
//! recreated under a new UID, and owned `IP`s whose NAT gateway or load
//! balancer no longer exists.

use crate::error::ControllerError;
use crate::reconciler::{AllocKey, Reconciler, resources};
use crds::{ClaimRef, LABEL_IP_OWNER, LoadBalancer, NATGateway};
use fabric_client::{FabricResource, ObjectClient, ObjectKey};
use kube::Resource;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the sweep found about a claimer
#[derive(Debug, Clone, PartialEq, Eq)]
enum Claimer {
    /// Exists with this UID
    Live(String),
    /// Does not exist
    Gone,
    /// Kind not handled by this controller
    Unknown,
}

/// Counts of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    /// Orphaned `IPAddress` records deleted
    pub addresses: usize,
    /// Orphaned `NetworkID` records deleted
    pub network_ids: usize,
    /// Orphaned owned `IP`s deleted
    pub owned_ips: usize,
}

async fn uid_in<K: FabricResource>(client: &dyn ObjectClient<K>, key: &ObjectKey) -> Result<Claimer, ControllerError> {
    Ok(match client.get(key).await? {
        Some(obj) => Claimer::Live(obj.meta().uid.clone().unwrap_or_default()),
        None => Claimer::Gone,
    })
}

impl Reconciler {
    async fn claimer(&self, claim: &ClaimRef) -> Result<Claimer, ControllerError> {
        let key = AllocKey::of_claim(claim).object_key();
        match claim.resource.as_str() {
            resources::PUBLIC_IPS => uid_in(self.clients.public_ips.as_ref(), &key).await,
            resources::IPS => uid_in(self.clients.ips.as_ref(), &key).await,
            resources::VIRTUAL_IPS => uid_in(self.clients.virtual_ips.as_ref(), &key).await,
            resources::NETWORKS => uid_in(self.clients.networks.as_ref(), &key).await,
            plural if plural == NATGateway::plural(&()) => uid_in(self.clients.nat_gateways.as_ref(), &key).await,
            plural if plural == LoadBalancer::plural(&()) => {
                uid_in(self.clients.load_balancers.as_ref(), &key).await
            }
            _ => Ok(Claimer::Unknown),
        }
    }

    async fn is_orphaned(&self, claim: &ClaimRef) -> Result<bool, ControllerError> {
        Ok(match self.claimer(claim).await? {
            Claimer::Live(uid) => uid != claim.uid,
            Claimer::Gone => true,
            Claimer::Unknown => false,
        })
    }

    /// Delete every orphaned record and owned `IP` and release what they held
    pub async fn sweep_orphans(&self) -> Result<Swept, ControllerError> {
        let mut swept = Swept::default();

        for record in self.clients.ip_addresses.list_all().await? {
            let claim = &record.spec.claim_ref;
            if !self.is_orphaned(claim).await? {
                continue;
            }
            info!(ip = %record.spec.ip, claimer = %claim.name, "Deleting orphaned address record");
            if let Some(allocation) = self.ip_allocator.release_if_uid(&AllocKey::of_claim(claim), &claim.uid) {
                debug!(ips = ?allocation.ips, "Released orphaned reservation");
            }
            if self.clients.ip_addresses.delete_if_exists(&ObjectKey::of(&record)).await? {
                swept.addresses += 1;
            }
        }

        for record in self.clients.network_ids.list_all().await? {
            let claim = &record.spec.claim_ref;
            if !self.is_orphaned(claim).await? {
                continue;
            }
            info!(record = ?record.metadata.name, claimer = %claim.name, "Deleting orphaned network id record");
            self.vni_allocator.release_if_uid(&AllocKey::of_claim(claim), &claim.uid);
            if self.clients.network_ids.delete_if_exists(&ObjectKey::of(&record)).await? {
                swept.network_ids += 1;
            }
        }

        for ip in self.clients.ips.list_all().await? {
            let owned = ip
                .metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(LABEL_IP_OWNER));
            let Some(claim) = ip.spec.claim_ref.as_ref().filter(|_| owned) else {
                continue;
            };
            if ip.metadata.deletion_timestamp.is_some() || !self.is_orphaned(claim).await? {
                continue;
            }
            info!(ip = %ObjectKey::of(&ip), owner = %claim.name, "Deleting IP of vanished owner");
            if self.clients.ips.delete_if_exists(&ObjectKey::of(&ip)).await? {
                swept.owned_ips += 1;
            }
        }
        Ok(swept)
    }
}

/// Sweep every `interval` until `cancel` fires
pub async fn run_gc(reconciler: Arc<Reconciler>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => match reconciler.sweep_orphans().await {
                Ok(swept) if swept != Swept::default() => info!(?swept, "Orphan sweep finished"),
                Ok(_) => debug!("Orphan sweep found nothing"),
                Err(e) => warn!(error = %e, "Orphan sweep failed"),
            },
        }
    }
    info!("Orphan sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::Swept;
    use crate::reconciler::nat_gateway::NATGateways;
    use crate::reconciler::network::Networks;
    use crate::reconciler::public_ip::PublicIPs;
    use crate::test_utils::*;
    use crds::{ClaimRef, IPAddress, IPAddressSpec, IpFamily};
    use fabric_client::{ObjectClient, ObjectKey};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn record(ip: &str, resource: &str, name: &str, uid: &str) -> IPAddress {
        IPAddress {
            metadata: ObjectMeta {
                name: Some(ip.to_string()),
                ..Default::default()
            },
            spec: IPAddressSpec {
                ip: addr(ip),
                claim_ref: ClaimRef {
                    group: String::new(),
                    resource: resource.to_string(),
                    namespace: Some(NAMESPACE.to_string()),
                    name: name.to_string(),
                    uid: uid.to_string(),
                },
            },
        }
    }

    #[tokio::test]
    async fn test_live_claims_survive() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        env.public_ips.seed(public_ip("p", &[IpFamily::IPv4], &[])).unwrap();
        settle_managed(&PublicIPs(env.reconciler.clone()), &key("p")).await;
        env.networks.seed(network("net", None)).unwrap();
        settle_managed(&Networks(env.reconciler.clone()), &key("net")).await;

        let swept = env.reconciler.sweep_orphans().await.unwrap();

        assert_eq!(swept, Swept::default());
        assert_eq!(env.ip_addresses.len(), 1);
        assert_eq!(env.network_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_records_of_vanished_claimers_are_deleted() {
        // Setup: one record for a missing claimer, one for a recreated claimer
        let env = TestEnv::new(&["10.0.0.0/24"]);
        env.ip_addresses
            .seed(record("10.0.0.1", "publicips", "missing", "uid-1"))
            .unwrap();
        env.public_ips
            .seed(public_ip("recreated", &[IpFamily::IPv4], &[]))
            .unwrap();
        env.ip_addresses
            .seed(record("10.0.0.2", "publicips", "recreated", "uid-2"))
            .unwrap();
        env.reconciler.rehydrate().await.unwrap();

        // Execute
        let swept = env.reconciler.sweep_orphans().await.unwrap();

        // Assert
        assert_eq!(swept.addresses, 2);
        assert!(env.ip_addresses.is_empty());
        assert_eq!(env.reconciler.ip_allocator.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_claimer_kinds_are_left_alone() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        env.ip_addresses
            .seed(record("10.0.0.1", "machines", "m1", "uid-1"))
            .unwrap();

        let swept = env.reconciler.sweep_orphans().await.unwrap();

        assert_eq!(swept, Swept::default());
        assert_eq!(env.ip_addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_owned_ips_of_vanished_gateway_are_deleted() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        env.nat_gateways
            .seed(nat_gateway("nat", "net", &[("a", None)], 64))
            .unwrap();
        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;
        assert!(env.ips.object(&key("nat-a")).is_some());

        // The gateway disappears without its IPs being pruned
        env.nat_gateways.delete(&key("nat")).await.unwrap();
        let swept = env.reconciler.sweep_orphans().await.unwrap();

        assert_eq!(swept.owned_ips, 1);
        let ip = env.ips.object(&ObjectKey::namespaced(NAMESPACE, "nat-a"));
        assert!(ip.is_none_or(|ip| ip.metadata.deletion_timestamp.is_some()));
    }
}
