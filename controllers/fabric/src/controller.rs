//! Controller wiring
//!
//! Builds the shared [`Reconciler`], one `kube_runtime` controller per
//! reconciler with the related watches feeding it, the requeue-on-release
//! loops, the orphan sweep and the health and metrics endpoints. Controllers
//! only start once the allocators are rehydrated and, with `--leader-elect`,
//! the lease is held.

use crate::config::Config;
use crate::error::ControllerError;
use crate::gc::run_gc;
use crate::reconciler::daemon_set::DaemonSets;
use crate::reconciler::load_balancer::LoadBalancers;
use crate::reconciler::nat_autoscaler::NATGatewayAutoscalers;
use crate::reconciler::nat_gateway::NATGateways;
use crate::reconciler::network::Networks;
use crate::reconciler::network_policy::NetworkPolicies;
use crate::reconciler::public_ip::PublicIPs;
use crate::reconciler::scheduler::Scheduler;
use crate::reconciler::virtual_ip::VirtualIPs;
use crate::reconciler::ip::IPs;
use crate::reconciler::{AllocKey, Clients, Reconciler, ip, public_ip, virtual_ip};
use crate::watcher;
use crds::{
    CONDITION_ALLOCATED, Condition, DaemonSet, IP, Instance, LoadBalancer, LoadBalancerRouting, NATGateway,
    NATGatewayAutoscaler, NATTable, Network, NetworkInterface, NetworkPolicy, NetworkPolicyRule, Node, PublicIP,
    REASON_PENDING, VirtualIP, find_condition,
};
use fabric_client::{ApiScope, KubeClient, KubeEventRecorder};
use fabric_runtime::{
    LeaderElector, ManagedReconciler, Metrics, PendingRequeue, ReleaseHandler, Runner, RuntimeError,
    run_released_loop, server,
};
use ipam::{IPSet, PublicIPAllocator, ReleasedReceiver, VNIAllocator};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Name of the leader lease and of the event reporter
const CONTROLLER_NAME: &str = "fabric-controller";

/// Kube client for `kubeconfig`, or the in-cluster / default one
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, ControllerError> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = ()>,
    K::Scope: ApiScope,
{
    <K::Scope as ApiScope>::api(client.clone(), namespace)
}

/// Whether an `Allocated` condition says the object waits for capacity
fn waiting_for_capacity(conditions: Option<&[Condition]>) -> bool {
    conditions
        .and_then(|c| find_condition(c, CONDITION_ALLOCATED))
        .is_some_and(|c| c.reason == REASON_PENDING)
}

/// Running controller tasks
struct Tasks {
    set: JoinSet<Result<(), ControllerError>>,
    client: Client,
    namespace: Option<String>,
    workers: usize,
    timeout: Duration,
    resync: Duration,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl Tasks {
    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ApiScope,
    {
        api(&self.client, self.namespace.as_deref())
    }

    /// Runner of `reconciler` for every `K` in the watched namespace
    fn runner<K, R>(&self, reconciler: R) -> Runner<K, R>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::Scope: ApiScope,
        R: fabric_runtime::Reconciler,
    {
        Runner::new(self.api::<K>(), Arc::new(reconciler))
            .concurrency(self.workers)
            .timeout(self.timeout)
            .resync(self.resync)
            .metrics(self.metrics.clone())
    }

    fn spawn<K, R>(&mut self, runner: Runner<K, R>)
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        R: fabric_runtime::Reconciler,
    {
        let cancel = self.cancel.clone();
        self.set.spawn(async move {
            runner.run(cancel).await;
            Ok(())
        });
    }
}

/// Run the fabric controller until `cancel` fires or a task fails
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), ControllerError> {
    let client = kube_client(config.kubeconfig.as_deref()).await?;
    let kube = KubeClient::new(client.clone());

    let (ip_allocator, ip_released) = PublicIPAllocator::new(IPSet::from_prefixes(&config.prefixes));
    let (vni_allocator, vni_released) = VNIAllocator::new(config.min_vni, config.max_vni)
        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;
    let ip_allocator = Arc::new(ip_allocator);
    let vni_allocator = Arc::new(vni_allocator);

    let mut reconciler = Reconciler::new(
        Clients::from_kube(&kube),
        Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME)),
        Arc::clone(&ip_allocator),
        Arc::clone(&vni_allocator),
        config.cluster_name.clone(),
    );
    let backing = match config.backing_kubeconfig.as_deref() {
        Some(path) => {
            let backing = kube_client(Some(path)).await?;
            reconciler = reconciler.with_backing(Arc::new(KubeClient::new(backing.clone())));
            info!(kubeconfig = %path.display(), "Proxying broker-annotated virtual IPs");
            Some(backing)
        }
        None => None,
    };
    let reconciler = Arc::new(reconciler);

    let metrics = Metrics::new().map_err(RuntimeError::from)?;
    let ready = CancellationToken::new();
    let mut tasks = Tasks {
        set: JoinSet::new(),
        client: client.clone(),
        namespace: config.namespace.clone(),
        workers: config.workers,
        timeout: config.reconcile_timeout(),
        resync: config.resync_period(),
        metrics: metrics.clone(),
        cancel: cancel.clone(),
    };

    for (addr, metrics) in [
        (config.health_probe_bind_address, None),
        (config.metrics_bind_address, Some(metrics.clone())),
    ] {
        let router = server::router(ready.clone(), metrics);
        let cancel = cancel.clone();
        tasks
            .set
            .spawn(async move { server::serve(addr, router, cancel).await.map_err(ControllerError::from) });
    }

    let leading = CancellationToken::new();
    if config.leader_elect {
        let identity = std::env::var("POD_NAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let elector = LeaderElector::new(
            Arc::new(kube.clone()),
            &config.leader_election_namespace,
            CONTROLLER_NAME,
            identity,
        );
        let (leading, cancel) = (leading.clone(), cancel.clone());
        tasks
            .set
            .spawn(async move { elector.run(leading, cancel).await.map_err(ControllerError::from) });
    } else {
        leading.cancel();
    }

    tokio::select! {
        () = cancel.cancelled() => return drain(tasks).await,
        () = leading.cancelled() => info!("Leading, starting reconcilers"),
        Some(result) = tasks.set.join_next() => return stop(tasks, result).await,
    }

    reconciler.rehydrate().await?;
    start_controllers(&mut tasks, &reconciler, backing.as_ref(), &config.cluster_name);
    start_released_loops(&mut tasks, &reconciler, ip_released, vni_released);
    {
        let (reconciler, cancel) = (Arc::clone(&reconciler), cancel.clone());
        let interval = config.gc_interval();
        tasks.set.spawn(async move {
            run_gc(reconciler, interval, cancel).await;
            Ok(())
        });
    }
    ready.cancel();
    info!("Fabric controller ready");

    tokio::select! {
        () = cancel.cancelled() => drain(tasks).await,
        Some(result) = tasks.set.join_next() => stop(tasks, result).await,
    }
}

fn start_controllers(tasks: &mut Tasks, reconciler: &Arc<Reconciler>, backing: Option<&Client>, cluster_name: &str) {
    let r = || Arc::clone(reconciler);

    tasks.spawn(tasks.runner::<PublicIP, _>(ManagedReconciler::new("publicip", Arc::new(PublicIPs(r())))));
    tasks.spawn(tasks.runner::<IP, _>(ManagedReconciler::new("ip", Arc::new(IPs(r())))));

    let mut virtual_ips = tasks.runner::<VirtualIP, _>(ManagedReconciler::new("virtualip", Arc::new(VirtualIPs(r()))));
    if let Some(backing) = backing {
        virtual_ips = virtual_ips.watches(
            Api::<IP>::all(backing.clone()),
            watcher::virtual_ips_pinning(cluster_name.to_string()),
        );
    }
    tasks.spawn(virtual_ips);

    let networks = tasks
        .runner::<Network, _>(ManagedReconciler::new("network", Arc::new(Networks(r()))))
        .watches(tasks.api::<Network>(), watcher::network_and_peers(r()));
    tasks.spawn(networks);

    let gateways = tasks
        .runner::<NATGateway, _>(NATGateways(r()))
        .watches(tasks.api::<NATGateway>(), watcher::gateways_sharing_network(r()))
        .owns(tasks.api::<NATTable>())
        .owns(tasks.api::<IP>())
        .watches(tasks.api::<NetworkInterface>(), watcher::gateways_of_interface(r()));
    tasks.spawn(gateways);

    let autoscalers = tasks
        .runner::<NATGatewayAutoscaler, _>(NATGatewayAutoscalers(r()))
        .watches(tasks.api::<NATGateway>(), watcher::autoscalers_of_gateway(r()));
    tasks.spawn(autoscalers);

    let load_balancers = tasks
        .runner::<LoadBalancer, _>(LoadBalancers(r()))
        .owns(tasks.api::<IP>())
        .owns(tasks.api::<DaemonSet>())
        .owns(tasks.api::<LoadBalancerRouting>())
        .watches(tasks.api::<NetworkInterface>(), watcher::load_balancers_of_interface(r()));
    tasks.spawn(load_balancers);

    let daemon_sets = tasks
        .runner::<DaemonSet, _>(DaemonSets(r()))
        .owns(tasks.api::<Instance>())
        .watches(tasks.api::<Node>(), watcher::all_daemon_sets(r()));
    tasks.spawn(daemon_sets);

    let scheduler = tasks
        .runner::<Instance, _>(Scheduler(r()))
        .watches(tasks.api::<Node>(), watcher::unscheduled_instances(r()));
    tasks.spawn(scheduler);

    let policies = tasks
        .runner::<NetworkPolicy, _>(NetworkPolicies(r()))
        .owns(tasks.api::<NetworkPolicyRule>())
        .watches(tasks.api::<NetworkInterface>(), watcher::policies_of_interface(r()));
    tasks.spawn(policies);
}

fn start_released_loops(
    tasks: &mut Tasks,
    reconciler: &Arc<Reconciler>,
    ip_released: ReleasedReceiver,
    vni_released: ReleasedReceiver,
) {
    let clients = &reconciler.clients;
    let ips: Arc<PublicIPAllocator<AllocKey>> = Arc::clone(&reconciler.ip_allocator);
    let vnis: Arc<VNIAllocator<AllocKey>> = Arc::clone(&reconciler.vni_allocator);

    let ip_handlers: Vec<Arc<dyn ReleaseHandler>> = vec![
        Arc::new(PendingRequeue::new(
            "publicip",
            Arc::clone(&clients.public_ips),
            |obj: &PublicIP| waiting_for_capacity(obj.status.as_ref().map(|s| s.conditions.as_slice())),
            {
                let ips = Arc::clone(&ips);
                move |obj: &PublicIP| ips.can_fit(&public_ip::address_request(&obj.spec))
            },
        )),
        Arc::new(PendingRequeue::new(
            "ip",
            Arc::clone(&clients.ips),
            |obj: &IP| waiting_for_capacity(obj.status.as_ref().map(|s| s.conditions.as_slice())),
            {
                let ips = Arc::clone(&ips);
                move |obj: &IP| ips.can_fit(&ip::address_request(obj))
            },
        )),
        Arc::new(PendingRequeue::new(
            "virtualip",
            Arc::clone(&clients.virtual_ips),
            |obj: &VirtualIP| virtual_ip::is_pending(obj.status.as_ref()) && virtual_ip::broker_reference(obj).is_none(),
            move |obj: &VirtualIP| ips.can_fit(&virtual_ip::address_request(obj)),
        )),
    ];
    let vni_handlers: Vec<Arc<dyn ReleaseHandler>> = vec![Arc::new(PendingRequeue::new(
        "network",
        Arc::clone(&clients.networks),
        |obj: &Network| waiting_for_capacity(obj.status.as_ref().map(|s| s.conditions.as_slice())),
        move |obj: &Network| vnis.can_fit(obj.spec.vni),
    ))];

    for (name, released, handlers) in [("publicip", ip_released, ip_handlers), ("vni", vni_released, vni_handlers)] {
        let cancel = tasks.cancel.clone();
        tasks.set.spawn(async move {
            run_released_loop(name, released, handlers, cancel).await;
            Ok(())
        });
    }
}

async fn stop(
    tasks: Tasks,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    tasks.cancel.cancel();
    let outcome = match result {
        Ok(Ok(())) => Err(ControllerError::TaskStopped("a controller task exited".to_string())),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(ControllerError::TaskStopped(format!("a controller task panicked: {e}"))),
    };
    if let Err(e) = &outcome {
        error!(error = %e, "Shutting down");
    }
    drain(tasks).await?;
    outcome
}

async fn drain(mut tasks: Tasks) -> Result<(), ControllerError> {
    tasks.cancel.cancel();
    while let Some(result) = tasks.set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task failed during shutdown"),
            Err(e) => error!(error = %e, "Task panicked during shutdown"),
        }
    }
    info!("Fabric controller stopped");
    Ok(())
}
