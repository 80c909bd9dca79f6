//! Command-line configuration
//!
//! Every flag can also be set through the environment variable named after it.

use clap::Parser;
use ipnet::IpNet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Fabric controller flags
#[derive(Debug, Clone, Parser)]
#[command(name = "fabric-controller", version, about, long_about = None)]
pub struct Config {
    /// Address serving `/metrics`
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address serving `/healthz` and `/readyz`
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Only run reconcilers while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "fabric-system")]
    pub leader_election_namespace: String,

    /// Kubeconfig of the local cluster; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the backing cluster proxied virtual IPs are allocated in
    #[arg(long, env = "BACKING_KUBECONFIG")]
    pub backing_kubeconfig: Option<PathBuf>,

    /// Name of this cluster in broker owner references
    #[arg(long, env = "CLUSTER_NAME", default_value = "default")]
    pub cluster_name: String,

    /// Restrict watches to one namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Public IP pools, comma separated
    #[arg(long, env = "PREFIXES", value_delimiter = ',')]
    pub prefixes: Vec<IpNet>,

    /// Lowest allocatable VNI
    #[arg(long, env = "MIN_VNI", default_value_t = 1)]
    pub min_vni: i32,

    /// Highest allocatable VNI
    #[arg(long, env = "MAX_VNI", default_value_t = ipam::MAX_VNI)]
    pub max_vni: i32,

    /// Concurrent reconciles per controller
    #[arg(long, env = "WORKERS", default_value_t = fabric_runtime::controller::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Per-reconcile timeout in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT", default_value_t = 10)]
    pub reconcile_timeout: u64,

    /// Seconds before a settled object is reconciled again
    #[arg(long, env = "RESYNC_PERIOD", default_value_t = 300)]
    pub resync_period: u64,

    /// Seconds between orphan record sweeps
    #[arg(long, env = "GC_INTERVAL", default_value_t = 60)]
    pub gc_interval: u64,
}

impl Config {
    /// Per-reconcile timeout
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout)
    }

    /// Resync period
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period)
    }

    /// Orphan sweep interval
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval)
    }
}
