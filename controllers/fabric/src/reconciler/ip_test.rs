//! Unit tests for IP reconciler

#[cfg(test)]
mod tests {
    use super::super::ip::IPs;
    use super::super::owned_ips::{WantedIP, owned_ip_name};
    use crate::test_utils::*;
    use crds::{
        ANNOTATION_BROKER_OWNERS, BrokerOwnerReference, IpFamily, LABEL_IP, LABEL_IP_FAMILY, LABEL_IP_OWNER,
        REASON_INVALID, encode_broker_owners,
    };
    use fabric_client::{ObjectClient, ObjectKey};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_dynamic_ip_gets_address_and_labels() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let ips = IPs(env.reconciler.clone());
        env.ips.seed(ip("web", None)).unwrap();

        settle_managed(&ips, &key("web")).await;

        let web = env.ips.object(&key("web")).unwrap();
        assert_eq!(web.spec.ip, Some(addr("10.0.0.0")));
        let labels = web.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_IP], "10.0.0.0");
        assert_eq!(labels[LABEL_IP_FAMILY], "IPv4");
        assert!(is_allocated(&web.status.unwrap().conditions));
    }

    #[tokio::test]
    async fn test_ipv6_label_is_label_safe() {
        let env = TestEnv::new(&["2001:db8::/64"]);
        let ips = IPs(env.reconciler.clone());
        env.ips.seed(ip("v6", Some("2001:db8::5"))).unwrap();

        settle_managed(&ips, &key("v6")).await;

        let v6 = env.ips.object(&key("v6")).unwrap();
        assert_eq!(v6.metadata.labels.unwrap()[LABEL_IP], "2001-db8--5");
        assert!(env.ip_addresses.object(&ObjectKey::cluster("2001-db8--5")).is_some());
    }

    #[tokio::test]
    async fn test_family_mismatch_is_invalid() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let ips = IPs(env.reconciler.clone());
        let mut mismatched = ip("bad", Some("10.0.0.1"));
        mismatched.spec.ip_family = IpFamily::IPv6;
        env.ips.seed(mismatched).unwrap();

        settle_managed(&ips, &key("bad")).await;

        let bad = env.ips.object(&key("bad")).unwrap();
        assert_eq!(allocated(&bad.status.unwrap().conditions), not_allocated(REASON_INVALID));
        assert_eq!(env.events.reasons_for("bad"), vec!["InvalidSpec"]);
        assert_eq!(env.reconciler.ip_allocator.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_public_ip_and_ip_share_the_pool() {
        let env = TestEnv::new(&["10.0.0.0/31"]);
        let ips = IPs(env.reconciler.clone());
        let public_ips = super::super::public_ip::PublicIPs(env.reconciler.clone());
        env.public_ips
            .seed(public_ip("first", &[IpFamily::IPv4], &[]))
            .unwrap();
        settle_managed(&public_ips, &key("first")).await;
        env.ips.seed(ip("second", None)).unwrap();

        settle_managed(&ips, &key("second")).await;

        assert_eq!(env.ips.object(&key("second")).unwrap().spec.ip, Some(addr("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_pinned_ip_waits_for_broker_owners() {
        // Setup: an allocated IP pinned by one remote virtual IP
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let ips = IPs(env.reconciler.clone());
        let owner = BrokerOwnerReference {
            cluster_name: "edge".to_string(),
            kind: "VirtualIP".to_string(),
            api_version: "fabric.microscaler.io/v1alpha1".to_string(),
            namespace: "tenant".to_string(),
            name: "vip".to_string(),
            uid: "uid-1".to_string(),
            controller: true,
        };
        let mut pinned = ip("pinned", None);
        pinned.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_BROKER_OWNERS.to_string(),
            encode_broker_owners(&[owner]).unwrap(),
        )]));
        env.ips.seed(pinned).unwrap();
        settle_managed(&ips, &key("pinned")).await;

        // Execute: deletion is blocked while the owner remains
        env.ips.delete(&key("pinned")).await.unwrap();
        settle_managed(&ips, &key("pinned")).await;
        assert!(env.ips.object(&key("pinned")).is_some());
        assert_eq!(env.reconciler.ip_allocator.allocation_count(), 1);

        // Execute: the last owner unpins
        env.ips
            .patch(
                &key("pinned"),
                &serde_json::json!({ "metadata": { "annotations": { ANNOTATION_BROKER_OWNERS: "[]" } } }),
            )
            .await
            .unwrap();
        settle_managed(&ips, &key("pinned")).await;

        // Assert
        assert!(env.ips.object(&key("pinned")).is_none());
        assert_eq!(env.reconciler.ip_allocator.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_unpinned_live_ip_deletes_itself() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let ips = IPs(env.reconciler.clone());
        let mut orphan = ip("orphan", None);
        orphan.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_BROKER_OWNERS.to_string(),
            "[]".to_string(),
        )]));
        env.ips.seed(orphan).unwrap();

        settle_managed(&ips, &key("orphan")).await;
        settle_managed(&ips, &key("orphan")).await;

        assert!(env.ips.object(&key("orphan")).is_none());
        assert!(env.ip_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_sync_owned_ips_creates_and_prunes() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let gateway = env.nat_gateways.seed(nat_gateway("nat", "net", &[], 64)).unwrap();
        let wanted = |names: &[&str]| -> Vec<WantedIP> {
            names
                .iter()
                .map(|name| WantedIP {
                    name: name.to_string(),
                    family: IpFamily::IPv4,
                    ip: None,
                })
                .collect()
        };

        // Execute: two addresses wanted
        let owned = env.reconciler.sync_owned_ips(&gateway, &wanted(&["a", "b"])).await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|o| o.ip.is_none()));
        let a = env.ips.object(&key(&owned_ip_name("nat", "a"))).unwrap();
        assert_eq!(a.metadata.labels.unwrap()[LABEL_IP_OWNER], "nat");
        let claim = a.spec.claim_ref.unwrap();
        assert_eq!(claim.resource, "natgateways");
        assert_eq!(claim.name, "nat");

        // Execute: one address dropped
        env.reconciler.sync_owned_ips(&gateway, &wanted(&["a"])).await.unwrap();

        // Assert
        assert!(env.ips.object(&key("nat-a")).is_some());
        assert!(env.ips.object(&key("nat-b")).is_none());
    }

    #[tokio::test]
    async fn test_owned_ip_reports_address_once_allocated() {
        let env = TestEnv::new(&["10.0.0.0/24"]);
        let ips = IPs(env.reconciler.clone());
        let gateway = env.nat_gateways.seed(nat_gateway("nat", "net", &[], 64)).unwrap();
        let wanted = [WantedIP {
            name: "a".to_string(),
            family: IpFamily::IPv4,
            ip: None,
        }];
        env.reconciler.sync_owned_ips(&gateway, &wanted).await.unwrap();

        settle_managed(&ips, &key("nat-a")).await;
        let owned = env.reconciler.sync_owned_ips(&gateway, &wanted).await.unwrap();

        assert_eq!(owned[0].ip, Some(addr("10.0.0.0")));
    }
}
