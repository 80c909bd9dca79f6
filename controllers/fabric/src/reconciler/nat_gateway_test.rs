//! Unit tests for NATGateway reconciler

#[cfg(test)]
mod tests {
    use super::super::ip::IPs;
    use super::super::nat_gateway::NATGateways;
    use crate::test_utils::*;
    use crds::{IpFamily, NATClaimRef, NATTable, REASON_INVALID, REASON_OVER_SUBSCRIBED};
    use fabric_client::ObjectClient;

    /// Seed `gateway` and let its owned IPs settle
    async fn gateway_with_addresses(env: &TestEnv, gateway: crds::NATGateway) {
        let name = gateway.metadata.name.clone().unwrap();
        let ip_names: Vec<String> = gateway.spec.ips.iter().map(|ip| format!("{name}-{}", ip.name)).collect();
        env.nat_gateways.seed(gateway).unwrap();
        let gateways = NATGateways(env.reconciler.clone());
        let ips = IPs(env.reconciler.clone());
        settle(&gateways, &key(&name)).await;
        for ip_name in &ip_names {
            settle_managed(&ips, &key(ip_name)).await;
        }
        settle(&gateways, &key(&name)).await;
    }

    fn sections(table: &NATTable) -> Vec<(String, i32, i32)> {
        table
            .spec
            .ips
            .iter()
            .flat_map(|ip| ip.sections.iter())
            .map(|s| (s.target_ref.as_ref().unwrap().name.clone(), s.port, s.end_port))
            .collect()
    }

    #[tokio::test]
    async fn test_interfaces_get_consecutive_port_ranges() {
        // Setup: three interfaces on the gateway's network
        let env = TestEnv::new(&["203.0.113.0/24"]);
        for (name, ip) in [("nic-1", "192.168.0.1"), ("nic-2", "192.168.0.2"), ("nic-3", "192.168.0.3")] {
            env.network_interfaces.seed(nic(name, "net", &[ip])).unwrap();
        }

        // Execute
        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None)], 64)).await;

        // Assert
        let table = env.nat_tables.object(&key("nat")).unwrap();
        assert_eq!(table.spec.ports_per_network_interface, 64);
        assert_eq!(table.spec.ips.len(), 1);
        assert_eq!(table.spec.ips[0].ip, addr("203.0.113.0"));
        assert_eq!(
            sections(&table),
            vec![
                ("nic-1".to_string(), 1024, 1087),
                ("nic-2".to_string(), 1088, 1151),
                ("nic-3".to_string(), 1152, 1215),
            ]
        );
        assert_eq!(table.spec.ips[0].sections[1].ip, addr("192.168.0.2"));

        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(status.ips.len(), 1);
        assert_eq!(status.ips[0].ip, addr("203.0.113.0"));
        assert_eq!(status.used_nat_ips, 3);
        assert_eq!(status.requested_nat_ips, 3);
        assert!(is_allocated(&status.conditions));
    }

    #[tokio::test]
    async fn test_table_waits_for_gateway_address() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.network_interfaces.seed(nic("nic-1", "net", &["192.168.0.1"])).unwrap();
        env.nat_gateways.seed(nat_gateway("nat", "net", &[("a", None)], 64)).unwrap();

        // The owned IP exists but is not allocated yet
        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;

        assert!(env.ips.object(&key("nat-a")).is_some());
        let table = env.nat_tables.object(&key("nat")).unwrap();
        assert!(table.spec.ips.is_empty());
        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(allocated(&status.conditions), not_allocated(REASON_OVER_SUBSCRIBED));
    }

    #[tokio::test]
    async fn test_interfaces_with_public_ip_are_skipped() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.network_interfaces.seed(nic("private", "net", &["192.168.0.1"])).unwrap();
        let mut public = nic("public", "net", &["192.168.0.2"]);
        public.spec.public_ips = vec![addr("198.51.100.7")];
        env.network_interfaces.seed(public).unwrap();
        env.network_interfaces.seed(nic("elsewhere", "other", &["192.168.0.3"])).unwrap();
        env.network_interfaces.seed(nic("v6-only", "net", &["fd00::1"])).unwrap();

        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None)], 64)).await;

        let table = env.nat_tables.object(&key("nat")).unwrap();
        assert_eq!(sections(&table), vec![("private".to_string(), 1024, 1087)]);
    }

    #[tokio::test]
    async fn test_over_subscription_is_not_repeated() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        for name in ["nic-1", "nic-2", "nic-3"] {
            env.network_interfaces.seed(nic(name, "net", &["192.168.0.1"])).unwrap();
        }
        let over_subscribed = |env: &TestEnv| {
            env.events
                .reasons_for("nat")
                .into_iter()
                .filter(|r| r == "OverSubscribed")
                .count()
        };

        // 64512 / 32256 = 2 ranges for three interfaces
        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None)], 32256)).await;
        let reported = over_subscribed(&env);
        assert!(reported >= 1);
        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;

        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(status.used_nat_ips, 2);
        assert_eq!(status.requested_nat_ips, 3);
        assert_eq!(allocated(&status.conditions), not_allocated(REASON_OVER_SUBSCRIBED));
        assert_eq!(over_subscribed(&env), reported);
    }

    fn claimed(name: &str, uid: &str) -> NATClaimRef {
        NATClaimRef {
            name: name.to_string(),
            uid: uid.to_string(),
            ip_family: IpFamily::IPv4,
        }
    }

    #[tokio::test]
    async fn test_gateways_on_one_network_serve_their_claims() {
        // Setup: nic-1 asks for nat-b, nic-2 for nat-a, nic-3 has no preference
        let env = TestEnv::new(&["203.0.113.0/24"]);
        for (name, ip, wanted) in [
            ("nic-1", "192.168.0.1", Some("nat-b")),
            ("nic-2", "192.168.0.2", Some("nat-a")),
            ("nic-3", "192.168.0.3", None),
        ] {
            let mut nic = nic(name, "net", &[ip]);
            nic.spec.nat_claim_refs = wanted.map(|gateway| claimed(gateway, "")).into_iter().collect();
            env.network_interfaces.seed(nic).unwrap();
        }

        // Execute
        gateway_with_addresses(&env, nat_gateway("nat-a", "net", &[("a", None)], 64)).await;
        gateway_with_addresses(&env, nat_gateway("nat-b", "net", &[("a", None)], 64)).await;
        settle(&NATGateways(env.reconciler.clone()), &key("nat-a")).await;

        // Assert: each gateway holds exactly its interfaces
        let table_a = env.nat_tables.object(&key("nat-a")).unwrap();
        let names_a: Vec<String> = sections(&table_a).into_iter().map(|(name, _, _)| name).collect();
        assert_eq!(names_a, vec!["nic-2", "nic-3"]);
        let table_b = env.nat_tables.object(&key("nat-b")).unwrap();
        assert_eq!(sections(&table_b), vec![("nic-1".to_string(), 1024, 1087)]);

        let status_a = env.nat_gateways.object(&key("nat-a")).unwrap().status.unwrap();
        assert_eq!((status_a.used_nat_ips, status_a.requested_nat_ips), (2, 2));
        let status_b = env.nat_gateways.object(&key("nat-b")).unwrap().status.unwrap();
        assert_eq!((status_b.used_nat_ips, status_b.requested_nat_ips), (1, 1));

        let uid_b = env.nat_gateways.object(&key("nat-b")).unwrap().metadata.uid.unwrap();
        let nic_1 = env.network_interfaces.object(&key("nic-1")).unwrap();
        assert_eq!(nic_1.spec.nat_claim_refs, vec![claimed("nat-b", &uid_b)]);
        let nic_3 = env.network_interfaces.object(&key("nic-3")).unwrap();
        assert_eq!(nic_3.spec.nat_claim(IpFamily::IPv4).unwrap().name, "nat-a");
    }

    #[tokio::test]
    async fn test_claim_of_vanished_gateway_is_taken_over() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        let mut orphan = nic("nic-1", "net", &["192.168.0.1"]);
        orphan.spec.nat_claim_refs = vec![claimed("gone", "gone-uid")];
        env.network_interfaces.seed(orphan).unwrap();
        let mut kept = nic("nic-2", "net", &["192.168.0.2"]);
        kept.spec.nat_claim_refs = vec![NATClaimRef {
            ip_family: IpFamily::IPv6,
            ..claimed("v6-gateway", "v6-uid")
        }];
        env.network_interfaces.seed(kept).unwrap();

        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None)], 64)).await;

        let table = env.nat_tables.object(&key("nat")).unwrap();
        assert_eq!(sections(&table).len(), 2);
        let uid = env.nat_gateways.object(&key("nat")).unwrap().metadata.uid.unwrap();
        let nic_1 = env.network_interfaces.object(&key("nic-1")).unwrap();
        assert_eq!(nic_1.spec.nat_claim_refs, vec![claimed("nat", &uid)]);
        // The claim of the other family is kept next to the new one
        let nic_2 = env.network_interfaces.object(&key("nic-2")).unwrap();
        assert_eq!(nic_2.spec.nat_claim_refs.len(), 2);
        assert_eq!(nic_2.spec.nat_claim(IpFamily::IPv6).unwrap().name, "v6-gateway");
    }

    #[tokio::test]
    async fn test_changing_ports_is_rejected() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.network_interfaces.seed(nic("nic-1", "net", &["192.168.0.1"])).unwrap();
        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None)], 64)).await;

        env.nat_gateways
            .patch(&key("nat"), &serde_json::json!({ "spec": { "portsPerNetworkInterface": 128 } }))
            .await
            .unwrap();
        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;

        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(allocated(&status.conditions), not_allocated(REASON_INVALID));
        assert!(env.events.reasons_for("nat").contains(&"InvalidSpec".to_string()));
        let table = env.nat_tables.object(&key("nat")).unwrap();
        assert_eq!(table.spec.ports_per_network_interface, 64);
    }

    #[tokio::test]
    async fn test_invalid_port_count_is_rejected() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_gateways.seed(nat_gateway("nat", "net", &[("a", None)], 1000)).unwrap();

        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;

        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(allocated(&status.conditions), not_allocated(REASON_INVALID));
        assert!(env.nat_tables.is_empty());
    }

    #[tokio::test]
    async fn test_removed_address_ip_is_pruned() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        gateway_with_addresses(&env, nat_gateway("nat", "net", &[("a", None), ("b", None)], 64)).await;
        assert!(env.ips.object(&key("nat-b")).is_some());

        env.nat_gateways
            .patch(&key("nat"), &serde_json::json!({ "spec": { "ips": [{ "name": "a" }] } }))
            .await
            .unwrap();
        settle(&NATGateways(env.reconciler.clone()), &key("nat")).await;

        let b = env.ips.object(&key("nat-b")).unwrap();
        assert!(b.metadata.deletion_timestamp.is_some());
        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(status.ips.len(), 1);
        assert_eq!(status.ips[0].name, "a");
    }
}
