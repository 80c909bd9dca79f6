//! Client errors

use thiserror::Error;

/// Errors returned by [`ObjectClient`](crate::ObjectClient) implementations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Object rejected by validation
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Any other Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client-side API misuse
    #[error("API error: {0}")]
    Api(String),
}

impl ClientError {
    /// `404`
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// `409` on update
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    /// `409` on create
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }

    /// `422`
    pub fn is_invalid(&self) -> bool {
        matches!(self, ClientError::Invalid(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(status) => match (status.code, status.reason.as_str()) {
                (404, _) => ClientError::NotFound(status.message.clone()),
                (409, "AlreadyExists") => ClientError::AlreadyExists(status.message.clone()),
                (409, _) => ClientError::Conflict(status.message.clone()),
                (422, _) => ClientError::Invalid(status.message.clone()),
                _ => ClientError::Kube(err),
            },
            _ => ClientError::Kube(err),
        }
    }
}
