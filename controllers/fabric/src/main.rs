//! Fabric Controller
//!
//! Allocation and scheduling core of the SDN control plane:
//! - PublicIP, IP, VirtualIP: public addresses from the configured prefixes
//! - Network: VNIs and peering status
//! - NATGateway, NATGatewayAutoscaler: NAT port sections per interface
//! - LoadBalancer, DaemonSet, Instance: load-balancer instances and their placement
//! - NetworkPolicy: policy rules per network
//!
//! Allocations are recorded in `IPAddress` and `NetworkID` objects and
//! rebuilt from them on startup.

mod config;
mod controller;
mod error;
mod gc;
mod reconciler;
mod rehydrate;
mod watcher;

#[cfg(test)]
mod test_utils;

use anyhow::Context;
use clap::Parser;
use config::Config;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    info!(
        cluster = %config.cluster_name,
        namespace = config.namespace.as_deref().unwrap_or("all namespaces"),
        prefixes = ?config.prefixes,
        vnis = ?(config.min_vni..=config.max_vni),
        leader_elect = config.leader_elect,
        "Starting Fabric Controller"
    );

    let cancel = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
            cancel.cancel();
        });
    }

    controller::run(config, cancel).await.context("fabric controller failed")?;
    Ok(())
}
