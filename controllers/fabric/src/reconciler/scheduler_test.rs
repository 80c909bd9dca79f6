//! Unit tests for the instance scheduler

#[cfg(test)]
mod tests {
    use super::super::daemon_set::affinity_for;
    use super::super::scheduler::{Scheduler, fits_affinity, pick_node};
    use super::super::{ALL, INDEX_ALL};
    use crate::test_utils::*;
    use crds::{DaemonSet, Instance, LocalObjectReference, TopologySpreadConstraint};

    const ZONE: &str = "topology.kubernetes.io/zone";

    fn spread(ds: &DaemonSet, name: &str) -> Instance {
        let mut spec = instance_spec("net");
        spec.topology_spread_constraints = vec![TopologySpreadConstraint {
            max_skew: 1,
            topology_key: ZONE.to_string(),
            label_selector: None,
        }];
        let mut obj = instance(name, spec);
        obj.metadata.owner_references = Some(vec![owner_ref(ds)]);
        obj
    }

    fn node_ref(env: &TestEnv, name: &str) -> Option<String> {
        env.instances
            .object(&key(name))
            .unwrap()
            .spec
            .node_ref
            .map(|r| r.name)
    }

    #[tokio::test]
    async fn test_spread_across_zones() {
        // Setup: two nodes in zone a, one in zone b
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[(ZONE, "a")])).unwrap();
        env.nodes.seed(node("n2", &[(ZONE, "a")])).unwrap();
        env.nodes.seed(node("n3", &[(ZONE, "b")])).unwrap();
        let ds = env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        env.instances.seed(spread(&ds, "first")).unwrap();
        env.instances.seed(spread(&ds, "second")).unwrap();
        let scheduler = Scheduler(env.reconciler.clone());

        // Execute
        settle(&scheduler, &key("first")).await;
        settle(&scheduler, &key("second")).await;

        // Assert: ties go to the lowest node name, then the empty zone wins
        assert_eq!(node_ref(&env, "first").as_deref(), Some("n1"));
        assert_eq!(node_ref(&env, "second").as_deref(), Some("n3"));
    }

    #[tokio::test]
    async fn test_unschedulable_instance_waits_in_index() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        let mut cordoned = node("n1", &[]);
        cordoned.spec.unschedulable = true;
        env.nodes.seed(cordoned).unwrap();
        env.instances.seed(instance("waiting", instance_spec("net"))).unwrap();
        let scheduler = Scheduler(env.reconciler.clone());

        settle(&scheduler, &key("waiting")).await;

        assert_eq!(node_ref(&env, "waiting"), None);
        assert_eq!(
            env.reconciler.indexes.unscheduled.lookup(INDEX_ALL, ALL),
            vec![key("waiting")]
        );

        // A schedulable node shows up
        env.nodes.seed(node("n2", &[])).unwrap();
        settle(&scheduler, &key("waiting")).await;

        assert_eq!(node_ref(&env, "waiting").as_deref(), Some("n2"));
        assert!(env.reconciler.indexes.unscheduled.lookup(INDEX_ALL, ALL).is_empty());
    }

    #[tokio::test]
    async fn test_pinned_instance_is_left_alone() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        let mut spec = instance_spec("net");
        spec.node_ref = Some(LocalObjectReference::new("elsewhere"));
        env.instances.seed(instance("pinned", spec)).unwrap();

        settle(&Scheduler(env.reconciler.clone()), &key("pinned")).await;

        assert_eq!(node_ref(&env, "pinned").as_deref(), Some("elsewhere"));
    }

    #[test]
    fn test_affinity_filters_nodes() {
        let mut spec = instance_spec("net");
        spec.affinity = affinity_for(Some(&selector(&[("role", "edge")])));
        let obj = instance("i", spec);

        assert!(fits_affinity(&obj, &node("edge", &[("role", "edge")])));
        assert!(!fits_affinity(&obj, &node("core", &[("role", "core")])));
        assert!(fits_affinity(&instance("free", instance_spec("net")), &node("core", &[])));
    }

    #[test]
    fn test_nodes_without_topology_key_are_skipped() {
        let ds = DaemonSet {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                uid: Some("ds-uid".to_string()),
                ..meta("lb")
            },
            ..daemon_set("lb", None)
        };
        let nodes = vec![node("a-unlabelled", &[]), node("b-zoned", &[(ZONE, "a")])];

        let picked = pick_node(&spread(&ds, "i"), &nodes, &[]);

        assert_eq!(picked.and_then(|n| n.metadata.name.as_deref()), Some("b-zoned"));
    }
}
