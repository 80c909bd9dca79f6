//! Runtime error types.

use fabric_client::ClientError;
use thiserror::Error;

/// Errors raised by the reconciliation runtime itself
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// API-server call failed
    #[error("API error: {0}")]
    Client(#[from] ClientError),

    /// Metrics registry rejected a collector or failed to encode
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Health or metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Leader election could not proceed
    #[error("Leader election failed: {0}")]
    LeaderElection(String),
}

/// Classifies reconcile errors for the controller's error policy.
///
/// Retriable errors are re-queued with per-object backoff; everything else is
/// logged and forgotten until the next watch event.
pub trait Retriable {
    /// Whether retrying the same reconcile can succeed
    fn is_retriable(&self) -> bool;
}

impl Retriable for ClientError {
    fn is_retriable(&self) -> bool {
        !self.is_invalid()
    }
}

impl Retriable for RuntimeError {
    fn is_retriable(&self) -> bool {
        match self {
            RuntimeError::Client(e) => e.is_retriable(),
            RuntimeError::LeaderElection(_) => true,
            RuntimeError::Metrics(_) | RuntimeError::Server(_) => false,
        }
    }
}
