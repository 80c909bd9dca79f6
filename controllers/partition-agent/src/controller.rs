//! Agent wiring
//!
//! Connects to the fabric cluster and the partition's host cluster and, while
//! holding the partition's lease, runs the interface controller fed by
//! watches on both.

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::network_interface::NetworkInterfaces;
use crate::reconciler::{Clients, Reconciler};
use crate::watcher;
use crds::metalnet;
use crds::{LoadBalancer, LoadBalancerRouting, NATTable, Network, NetworkInterface, NetworkPolicyRule};
use fabric_client::{ApiScope, KubeClient};
use fabric_runtime::{LeaderElector, Metrics, Runner, RuntimeError, server};
use k8s_openapi::api::core::v1::Node as HostNode;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Resource};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, ControllerError> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Running agent tasks
struct Tasks {
    set: JoinSet<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

/// Run the partition agent until `cancel` fires or a task fails
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), ControllerError> {
    let fabric = kube_client(config.kubeconfig.as_deref()).await?;
    let host = kube_client(config.host_kubeconfig.as_deref()).await?;
    let fabric_kube = KubeClient::new(fabric.clone());
    let host_kube = KubeClient::new(host.clone());

    let reconciler = Arc::new(Reconciler::new(
        Clients::from_kube(&fabric_kube, &host_kube),
        config.partition_name.clone(),
        config.host_namespace.clone(),
    ));

    let metrics = Metrics::new().map_err(RuntimeError::from)?;
    let ready = CancellationToken::new();
    let mut tasks = Tasks {
        set: JoinSet::new(),
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
        let lease = format!("partition-agent-{}", config.partition_name);
        let elector = LeaderElector::new(
            Arc::new(fabric_kube.clone()),
            &config.leader_election_namespace,
            &lease,
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
        () = leading.cancelled() => info!("Leading, starting the interface controller"),
        Some(result) = tasks.set.join_next() => return stop(tasks, result).await,
    }

    let runner = interface_runner(&reconciler, &fabric, &host, &config)
        .concurrency(config.workers)
        .timeout(config.reconcile_timeout())
        .resync(config.resync_period())
        .metrics(metrics.clone());
    {
        let cancel = cancel.clone();
        tasks.set.spawn(async move {
            runner.run(cancel).await;
            Ok(())
        });
    }
    ready.cancel();
    info!(partition = %config.partition_name, "Partition agent ready");

    tokio::select! {
        () = cancel.cancelled() => drain(tasks).await,
        Some(result) = tasks.set.join_next() => stop(tasks, result).await,
    }
}

fn fabric_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = ()>,
    K::Scope: ApiScope,
{
    <K::Scope as ApiScope>::api(client.clone(), namespace)
}

/// Interface controller woken by the fabric objects a mirror is derived from,
/// the host nodes and the mirrors themselves
fn interface_runner(
    reconciler: &Arc<Reconciler>,
    fabric: &Client,
    host: &Client,
    config: &Config,
) -> Runner<NetworkInterface, NetworkInterfaces> {
    let r = || Arc::clone(reconciler);
    let namespace = config.namespace.as_deref();

    Runner::new(fabric_api::<NetworkInterface>(fabric, namespace), Arc::new(NetworkInterfaces(r())))
        .watches(fabric_api::<Network>(fabric, namespace), watcher::network_dependents(r()))
        .watches(fabric_api::<NATTable>(fabric, namespace), watcher::nat_table_targets)
        .watches(fabric_api::<LoadBalancerRouting>(fabric, namespace), watcher::routing_targets(r()))
        .watches(fabric_api::<LoadBalancer>(fabric, namespace), watcher::load_balancer_dependents(r()))
        .watches(fabric_api::<NetworkPolicyRule>(fabric, namespace), watcher::policy_targets(r()))
        .watches(Api::<HostNode>::all(host.clone()), watcher::host_node_dependents(r()))
        .watches(
            Api::<metalnet::NetworkInterface>::namespaced(host.clone(), &config.host_namespace),
            watcher::mirror_source(reconciler.source_labels.clone()),
        )
}

async fn stop(
    tasks: Tasks,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    tasks.cancel.cancel();
    let outcome = match result {
        Ok(Ok(())) => Err(ControllerError::TaskStopped("an agent task exited".to_string())),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(ControllerError::TaskStopped(format!("an agent task panicked: {e}"))),
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
    info!("Partition agent stopped");
    Ok(())
}
