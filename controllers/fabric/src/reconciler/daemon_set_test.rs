//! Unit tests for DaemonSet reconciler

#[cfg(test)]
mod tests {
    use super::super::daemon_set::{DaemonSets, affinity_for, instance_name};
    use super::super::scheduler::Scheduler;
    use crate::test_utils::*;
    use crds::{Instance, LocalObjectReference};
    use fabric_client::{ObjectClient, ObjectKey};

    fn instances(env: &TestEnv) -> Vec<Instance> {
        env.instances
            .objects()
            .into_iter()
            .filter(|i| i.metadata.deletion_timestamp.is_none())
            .collect()
    }

    fn nodes_of(env: &TestEnv) -> Vec<String> {
        let mut nodes: Vec<String> = instances(env)
            .iter()
            .filter_map(|i| i.spec.node_ref.as_ref().map(|r| r.name.clone()))
            .collect();
        nodes.sort();
        nodes
    }

    async fn schedule_all(env: &TestEnv) {
        let scheduler = Scheduler(env.reconciler.clone());
        for instance in instances(env) {
            settle(&scheduler, &ObjectKey::of(&instance)).await;
        }
    }

    #[tokio::test]
    async fn test_one_instance_per_eligible_node() {
        // Setup: three nodes, one of them outside the node selector
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[("role", "edge")])).unwrap();
        env.nodes.seed(node("n2", &[("role", "edge")])).unwrap();
        env.nodes.seed(node("n3", &[("role", "core")])).unwrap();
        env.daemon_sets
            .seed(daemon_set("lb", Some(selector(&[("role", "edge")]))))
            .unwrap();
        let daemon_sets = DaemonSets(env.reconciler.clone());

        // Execute
        settle(&daemon_sets, &key("lb")).await;

        // Assert: created unpinned, with an affinity for the scheduler
        let created = instances(&env);
        assert_eq!(created.len(), 2);
        for instance in &created {
            assert!(instance.spec.node_ref.is_none());
            assert_eq!(instance.spec.affinity, affinity_for(Some(&selector(&[("role", "edge")]))));
            assert_eq!(instance.metadata.labels.as_ref().unwrap()["app"], "lb");
        }

        schedule_all(&env).await;
        settle(&daemon_sets, &key("lb")).await;

        assert_eq!(nodes_of(&env), vec!["n1", "n2"]);
        let status = env.daemon_sets.object(&key("lb")).unwrap().status.unwrap();
        assert_eq!(status.desired_number_scheduled, 2);
        assert_eq!(status.current_number_scheduled, 2);
    }

    #[tokio::test]
    async fn test_new_node_gets_an_instance() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        let daemon_sets = DaemonSets(env.reconciler.clone());
        settle(&daemon_sets, &key("lb")).await;
        schedule_all(&env).await;

        env.nodes.seed(node("n2", &[])).unwrap();
        settle(&daemon_sets, &key("lb")).await;
        schedule_all(&env).await;

        assert_eq!(nodes_of(&env), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_instances_on_ineligible_nodes_are_deleted() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        env.nodes.seed(node("n2", &[])).unwrap();
        env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        let daemon_sets = DaemonSets(env.reconciler.clone());
        settle(&daemon_sets, &key("lb")).await;
        schedule_all(&env).await;

        // n2 is cordoned
        env.nodes
            .patch(&ObjectKey::cluster("n2"), &serde_json::json!({ "spec": { "unschedulable": true } }))
            .await
            .unwrap();
        settle(&daemon_sets, &key("lb")).await;

        assert_eq!(nodes_of(&env), vec!["n1"]);
        let status = env.daemon_sets.object(&key("lb")).unwrap().status.unwrap();
        assert_eq!(status.desired_number_scheduled, 1);
    }

    #[tokio::test]
    async fn test_duplicates_on_one_node_are_deleted() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        let ds = env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        for name in ["lb-dup-a", "lb-dup-b"] {
            let mut spec = ds.spec.template.spec.clone();
            spec.node_ref = Some(LocalObjectReference::new("n1"));
            let mut dup = labeled(instance(name, spec), &[("app", "lb")]);
            dup.metadata.owner_references = Some(vec![owner_ref(&ds)]);
            env.instances.seed(dup).unwrap();
        }

        settle(&DaemonSets(env.reconciler.clone()), &key("lb")).await;

        let remaining = instances(&env);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name.as_deref(), Some("lb-dup-a"));
    }

    #[tokio::test]
    async fn test_orphan_is_adopted() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        let ds = env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        let mut spec = ds.spec.template.spec.clone();
        spec.node_ref = Some(LocalObjectReference::new("n1"));
        env.instances
            .seed(labeled(instance("orphan", spec), &[("app", "lb")]))
            .unwrap();

        settle(&DaemonSets(env.reconciler.clone()), &key("lb")).await;

        let all = instances(&env);
        assert_eq!(all.len(), 1);
        let refs = all[0].metadata.owner_references.clone().unwrap();
        assert_eq!(refs[0].uid, ds.metadata.uid.unwrap());
    }

    #[tokio::test]
    async fn test_template_change_reaches_instances() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        env.daemon_sets.seed(daemon_set("lb", None)).unwrap();
        let daemon_sets = DaemonSets(env.reconciler.clone());
        settle(&daemon_sets, &key("lb")).await;
        schedule_all(&env).await;

        env.daemon_sets
            .patch(
                &key("lb"),
                &serde_json::json!({ "spec": { "template": { "spec": { "ips": ["203.0.113.99"] } } } }),
            )
            .await
            .unwrap();
        settle(&daemon_sets, &key("lb")).await;

        let instance = &instances(&env)[0];
        assert_eq!(instance.spec.ips, vec![addr("203.0.113.99")]);
        assert_eq!(instance.spec.node_ref, Some(LocalObjectReference::new("n1")));
    }

    #[tokio::test]
    async fn test_name_collision_bumps_count() {
        let env = TestEnv::new(&["203.0.113.0/24"]);
        env.nodes.seed(node("n1", &[])).unwrap();
        // Unrelated instance squatting on the first generated name
        env.instances
            .seed(instance(&instance_name("lb", "n1", 0), instance_spec("net")))
            .unwrap();
        env.daemon_sets.seed(daemon_set("lb", None)).unwrap();

        settle(&DaemonSets(env.reconciler.clone()), &key("lb")).await;

        let status = env.daemon_sets.object(&key("lb")).unwrap().status.unwrap();
        assert_eq!(status.collision_count, 1);
        assert!(env.instances.object(&key(&instance_name("lb", "n1", 1))).is_some());
    }

    #[test]
    fn test_empty_selector_has_no_affinity() {
        assert!(affinity_for(None).is_none());
        assert!(affinity_for(Some(&selector(&[]))).is_none());
    }
}
