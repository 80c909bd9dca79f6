//! Partition agent error types.

use fabric_client::ClientError;
use fabric_runtime::{Retriable, RuntimeError};
use thiserror::Error;

/// Errors that can occur in the partition agent.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// API-server call failed, in either cluster
    #[error("API error: {0}")]
    Client(#[from] ClientError),

    /// Runtime failure (watch, server, leader election)
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Kubernetes client setup failed
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// A long-running agent task stopped unexpectedly
    #[error("Agent task stopped: {0}")]
    TaskStopped(String),
}

impl Retriable for ControllerError {
    fn is_retriable(&self) -> bool {
        match self {
            ControllerError::Client(e) => e.is_retriable(),
            ControllerError::Runtime(e) => e.is_retriable(),
            ControllerError::Kube(_) => true,
            ControllerError::Kubeconfig(_) | ControllerError::TaskStopped(_) => false,
        }
    }
}
