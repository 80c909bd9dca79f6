//! Command-line configuration
//!
//! Every flag can also be set through the environment variable named after it.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Partition agent flags
#[derive(Debug, Clone, Parser)]
#[command(name = "partition-agent", version, about, long_about = None)]
pub struct Config {
    /// Partition served by this agent; nodes are named `<partition>.<hostNode>`
    #[arg(long, env = "PARTITION_NAME")]
    pub partition_name: String,

    /// Address serving `/metrics`
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address serving `/healthz` and `/readyz`
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Only run the reconciler while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "fabric-system")]
    pub leader_election_namespace: String,

    /// Kubeconfig of the fabric cluster; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the partition's host cluster; in-cluster config when unset
    #[arg(long, env = "HOST_KUBECONFIG")]
    pub host_kubeconfig: Option<PathBuf>,

    /// Namespace of the dataplane mirrors in the host cluster
    #[arg(long, env = "HOST_NAMESPACE", default_value = "default")]
    pub host_namespace: String,

    /// Restrict fabric watches to one namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Concurrent interface reconciles
    #[arg(long, env = "WORKERS", default_value_t = fabric_runtime::controller::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Per-reconcile timeout in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT", default_value_t = 10)]
    pub reconcile_timeout: u64,

    /// Seconds before a settled interface is reconciled again
    #[arg(long, env = "RESYNC_PERIOD", default_value_t = 300)]
    pub resync_period: u64,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name_is_required() {
        assert!(Config::try_parse_from(["partition-agent"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["partition-agent", "--partition-name", "zone-a"]).unwrap();
        assert_eq!(config.partition_name, "zone-a");
        assert_eq!(config.host_namespace, "default");
        assert!(config.host_kubeconfig.is_none());
        assert_eq!(config.metrics_bind_address.port(), 8080);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(10));
    }
}
