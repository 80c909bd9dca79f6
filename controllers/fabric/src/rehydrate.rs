//! Allocator rehydration
//!
//! Rebuilds the in-memory allocators from the durable `IPAddress` and
//! `NetworkID` records before any reconciler runs. Records that no longer
//! fit the configured pools are kept but skipped.

use crate::error::ControllerError;
use crate::reconciler::{AllocKey, Reconciler};
use fabric_client::ObjectClient;
use tracing::{info, warn};

/// Counts of restored reservations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rehydrated {
    /// Addresses restored into the public IP allocator
    pub addresses: usize,
    /// VNIs restored into the VNI allocator
    pub vnis: usize,
    /// Records that could not be restored
    pub skipped: usize,
}

impl Reconciler {
    /// Restore every recorded reservation
    pub async fn rehydrate(&self) -> Result<Rehydrated, ControllerError> {
        let mut result = Rehydrated::default();

        for record in self.clients.ip_addresses.list_all().await? {
            let claim = &record.spec.claim_ref;
            match self
                .ip_allocator
                .restore(&AllocKey::of_claim(claim), &claim.uid, record.spec.ip)
            {
                Ok(()) => result.addresses += 1,
                Err(e) => {
                    warn!(ip = %record.spec.ip, claimer = %claim.name, error = %e, "Skipping address record");
                    result.skipped += 1;
                }
            }
        }

        for record in self.clients.network_ids.list_all().await? {
            let name = record.metadata.name.as_deref().unwrap_or_default();
            let Ok(vni) = name.parse::<i32>() else {
                warn!(record = %name, "Skipping network id record with a non-numeric name");
                result.skipped += 1;
                continue;
            };
            let claim = &record.spec.claim_ref;
            match self.vni_allocator.restore(&AllocKey::of_claim(claim), &claim.uid, vni) {
                Ok(()) => result.vnis += 1,
                Err(e) => {
                    warn!(vni, claimer = %claim.name, error = %e, "Skipping network id record");
                    result.skipped += 1;
                }
            }
        }

        info!(
            addresses = result.addresses,
            vnis = result.vnis,
            skipped = result.skipped,
            "Rehydrated allocators"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::Rehydrated;
    use crate::reconciler::network::Networks;
    use crate::reconciler::public_ip::PublicIPs;
    use crate::test_utils::*;
    use crds::{ClaimRef, IPAddress, IPAddressSpec, IpFamily, REASON_ALREADY_TAKEN};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    async fn seed_allocations(env: &TestEnv) {
        let networks = Networks(env.reconciler.clone());
        for (name, vni) in [("n5", 5), ("n7", 7)] {
            env.networks.seed(network(name, Some(vni))).unwrap();
            settle_managed(&networks, &key(name)).await;
        }
        let public_ips = PublicIPs(env.reconciler.clone());
        for (name, ip) in [("p3", "10.0.0.3"), ("p5", "10.0.0.5")] {
            env.public_ips.seed(public_ip(name, &[IpFamily::IPv4], &[ip])).unwrap();
            settle_managed(&public_ips, &key(name)).await;
        }
    }

    #[tokio::test]
    async fn test_restart_preserves_allocations() {
        // Setup: allocations made before the restart
        let env = TestEnv::with_vnis(&["10.0.0.0/24"], 1, 10);
        seed_allocations(&env).await;
        assert_eq!(env.network_ids.len(), 2);
        assert_eq!(env.ip_addresses.len(), 2);

        // Execute
        let env = env.restart();
        let restored = env.reconciler.rehydrate().await.unwrap();

        // Assert
        assert_eq!(
            restored,
            Rehydrated {
                addresses: 2,
                vnis: 2,
                skipped: 0
            }
        );
        assert!(env.reconciler.vni_allocator.is_taken(5));
        assert!(env.reconciler.vni_allocator.is_taken(7));

        env.networks.seed(network("fresh", None)).unwrap();
        settle_managed(&Networks(env.reconciler.clone()), &key("fresh")).await;
        assert_eq!(env.networks.object(&key("fresh")).unwrap().spec.vni, Some(1));

        env.public_ips.seed(public_ip("fresh", &[IpFamily::IPv4], &[])).unwrap();
        settle_managed(&PublicIPs(env.reconciler.clone()), &key("fresh")).await;
        let status = env.public_ips.object(&key("fresh")).unwrap().status.unwrap();
        assert_eq!(status.ips, vec![addr("10.0.0.0")]);
    }

    #[tokio::test]
    async fn test_restored_reservations_still_belong_to_their_claimers() {
        let env = TestEnv::with_vnis(&["10.0.0.0/24"], 1, 10);
        seed_allocations(&env).await;
        let env = env.restart();
        env.reconciler.rehydrate().await.unwrap();

        // The original claimer reconciles cleanly
        settle_managed(&Networks(env.reconciler.clone()), &key("n5")).await;
        let n5 = env.networks.object(&key("n5")).unwrap();
        assert!(is_allocated(&n5.status.unwrap().conditions));

        // A newcomer asking for the same VNI is refused
        env.networks.seed(network("copycat", Some(5))).unwrap();
        settle_managed(&Networks(env.reconciler.clone()), &key("copycat")).await;
        let copycat = env.networks.object(&key("copycat")).unwrap();
        assert_eq!(
            allocated(&copycat.status.unwrap().conditions),
            not_allocated(REASON_ALREADY_TAKEN)
        );
    }

    #[tokio::test]
    async fn test_records_outside_the_pool_are_skipped() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        env.ip_addresses
            .seed(IPAddress {
                metadata: ObjectMeta {
                    name: Some("192.168.1.1".to_string()),
                    ..Default::default()
                },
                spec: IPAddressSpec {
                    ip: addr("192.168.1.1"),
                    claim_ref: ClaimRef {
                        group: String::new(),
                        resource: "publicips".to_string(),
                        namespace: Some(NAMESPACE.to_string()),
                        name: "stale".to_string(),
                        uid: "stale-uid".to_string(),
                    },
                },
            })
            .unwrap();

        let restored = env.reconciler.rehydrate().await.unwrap();

        assert_eq!(restored.addresses, 0);
        assert_eq!(restored.skipped, 1);
        assert_eq!(env.ip_addresses.len(), 1);
    }
}
