//! Unit tests for NATGatewayAutoscaler reconciler

#[cfg(test)]
mod tests {
    use super::super::nat_autoscaler::NATGatewayAutoscalers;
    use crate::test_utils::*;
    use fabric_client::ObjectClient;

    fn ip_names(env: &TestEnv, gateway: &str) -> Vec<String> {
        env.nat_gateways
            .object(&key(gateway))
            .unwrap()
            .spec
            .ips
            .into_iter()
            .map(|ip| ip.name)
            .collect()
    }

    async fn set_gateway_status(env: &TestEnv, gateway: &str, used: i64, requested: i64) {
        env.nat_gateways
            .patch_status(
                &key(gateway),
                &serde_json::json!({ "status": { "usedNATIPs": used, "requestedNATIPs": requested } }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scales_up_to_fit_requested_interfaces() {
        // Setup: 32256 ports per interface gives two interfaces per address
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_gateways.seed(nat_gateway("nat", "net", &[], 32256)).unwrap();
        set_gateway_status(&env, "nat", 0, 5).await;
        env.nat_autoscalers.seed(autoscaler("scaler", "nat", None, Some(10))).unwrap();

        // Execute
        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        // Assert
        assert_eq!(ip_names(&env, "nat"), vec!["scaler-0", "scaler-1", "scaler-2"]);
        let status = env.nat_autoscalers.object(&key("scaler")).unwrap().status.unwrap();
        assert_eq!(status.desired_public_ips, Some(3));
    }

    #[tokio::test]
    async fn test_respects_bounds() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_gateways.seed(nat_gateway("nat", "net", &[], 32256)).unwrap();
        set_gateway_status(&env, "nat", 0, 100).await;
        env.nat_autoscalers.seed(autoscaler("scaler", "nat", Some(2), Some(4))).unwrap();

        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        assert_eq!(ip_names(&env, "nat").len(), 4);
    }

    #[tokio::test]
    async fn test_minimum_applies_without_demand() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_gateways.seed(nat_gateway("nat", "net", &[("manual", None)], 64)).unwrap();
        env.nat_autoscalers.seed(autoscaler("scaler", "nat", Some(2), None)).unwrap();

        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        assert_eq!(ip_names(&env, "nat"), vec!["manual", "scaler-0"]);
    }

    #[tokio::test]
    async fn test_scales_down_unused_addresses() {
        // Setup: three addresses, nothing placed
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_gateways
            .seed(nat_gateway("nat", "net", &[("a", None), ("b", None), ("c", None)], 32256))
            .unwrap();
        set_gateway_status(&env, "nat", 0, 0).await;
        env.nat_autoscalers.seed(autoscaler("scaler", "nat", Some(1), None)).unwrap();

        // Execute
        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        // Assert: later entries go first among equally loaded addresses
        assert_eq!(ip_names(&env, "nat"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_scale_down_keeps_placed_interfaces() {
        // Setup: the gateway places two interfaces on two addresses
        let env = TestEnv::new(&["203.0.113.0/24"]);
        for (name, ip) in [("nic-1", "192.168.0.1"), ("nic-2", "192.168.0.2"), ("nic-3", "192.168.0.3")] {
            env.network_interfaces.seed(nic(name, "net", &[ip])).unwrap();
        }
        env.nat_gateways
            .seed(nat_gateway("nat", "net", &[("a", None), ("b", None)], 32256))
            .unwrap();
        let gateways = super::super::nat_gateway::NATGateways(env.reconciler.clone());
        let ips = super::super::ip::IPs(env.reconciler.clone());
        settle(&gateways, &key("nat")).await;
        settle_managed(&ips, &key("nat-a")).await;
        settle_managed(&ips, &key("nat-b")).await;
        settle(&gateways, &key("nat")).await;
        let status = env.nat_gateways.object(&key("nat")).unwrap().status.unwrap();
        assert_eq!(status.used_nat_ips, 3);

        // Execute: the maximum drops to one address
        env.nat_autoscalers.seed(autoscaler("scaler", "nat", Some(1), Some(1))).unwrap();
        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        // Assert: removing either address would evict an interface
        assert_eq!(ip_names(&env, "nat"), vec!["a", "b"]);
        let status = env.nat_autoscalers.object(&key("scaler")).unwrap().status.unwrap();
        assert_eq!(status.desired_public_ips, Some(1));
    }

    #[tokio::test]
    async fn test_missing_gateway_is_ignored() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nat_autoscalers.seed(autoscaler("scaler", "missing", None, None)).unwrap();

        settle(&NATGatewayAutoscalers(env.reconciler.clone()), &key("scaler")).await;

        assert!(env.nat_autoscalers.object(&key("scaler")).unwrap().status.is_none());
    }
}
