//! ObjectClient trait for mocking
//!
//! This trait abstracts API-server access for one resource kind so that
//! reconcilers can be exercised against an in-memory store in unit tests.

use crate::error::ClientError;
use crate::key::ObjectKey;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Bounds shared by every resource kind handled through [`ObjectClient`]
pub trait FabricResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> FabricResource for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// API-server operations on one resource kind
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectClient<K: FabricResource>: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ClientError>;

    /// List objects, optionally restricted to a namespace and to exact label matches
    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError>;

    /// Create an object; `metadata.generateName` is honored
    async fn create(&self, obj: &K, dry_run: bool) -> Result<K, ClientError>;

    /// JSON merge patch of the main resource (status is ignored).
    ///
    /// A `metadata.resourceVersion` in the patch makes the write conditional.
    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, ClientError>;

    /// JSON merge patch of the status subresource
    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError>;

    /// Server-side apply of `obj` under `field_manager`, forcing conflicts
    async fn apply(&self, obj: &K, field_manager: &str) -> Result<K, ClientError>;

    /// Delete an object; finalizers turn this into setting `deletionTimestamp`
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;

    /// Delete, treating `NotFound` as success. Returns whether the object existed.
    async fn delete_if_exists(&self, key: &ObjectKey) -> Result<bool, ClientError> {
        match self.delete(key).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// List every object in every namespace
    async fn list_all(&self) -> Result<Vec<K>, ClientError> {
        self.list(None, &BTreeMap::new()).await
    }
}
