//! Partition Agent
//!
//! Runs next to one partition's host cluster and mirrors every fabric
//! `NetworkInterface` scheduled there into the metalnet dataplane
//! representation: VNI, addresses, NAT section, load-balancer targets and
//! firewall entries. The mirror's observed state flows back into the
//! interface status.

mod config;
mod controller;
mod error;
mod reconciler;
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
        partition = %config.partition_name,
        host_namespace = %config.host_namespace,
        namespace = config.namespace.as_deref().unwrap_or("all namespaces"),
        leader_elect = config.leader_elect,
        "Starting Partition Agent"
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

    controller::run(config, cancel).await.context("partition agent failed")?;
    Ok(())
}
