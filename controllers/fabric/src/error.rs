//! Controller-specific error types.
//!
//! Allocation outcomes that only need to be surfaced on the object status
//! (`NoSpaceLeft`, `AlreadyTaken`, ...) are handled inside the reconcilers and
//! never reach this type.

use fabric_client::ClientError;
use fabric_runtime::{Retriable, RuntimeError};
use ipam::{AllocationError, NatError};
use thiserror::Error;

/// Errors that can occur in the fabric controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// API-server call failed
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

    /// A long-running controller task stopped unexpectedly
    #[error("Controller task stopped: {0}")]
    TaskStopped(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Allocator rejected a request in a way the reconciler cannot surface
    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// NAT section bookkeeping failed
    #[error("NAT allocation failed: {0}")]
    Nat(#[from] NatError),

    /// Broker annotation could not be read or written
    #[error("Invalid broker reference: {0}")]
    BrokerReference(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Retriable for ControllerError {
    fn is_retriable(&self) -> bool {
        match self {
            ControllerError::Client(e) => e.is_retriable(),
            ControllerError::Runtime(e) => e.is_retriable(),
            ControllerError::Kube(_) => true,
            ControllerError::Kubeconfig(_)
            | ControllerError::TaskStopped(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::Allocation(_)
            | ControllerError::Nat(_)
            | ControllerError::BrokerReference(_)
            | ControllerError::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ControllerError::from(ClientError::Conflict("rv".to_string())).is_retriable());
        assert!(!ControllerError::from(ClientError::Invalid("spec".to_string())).is_retriable());
        assert!(!ControllerError::from(AllocationError::NoSpaceLeft).is_retriable());
        assert!(!ControllerError::InvalidConfig("prefixes".to_string()).is_retriable());
    }
}
