//! Kubernetes-backed [`ObjectClient`]

use crate::client::{FabricResource, ObjectClient};
use crate::error::ClientError;
use crate::key::ObjectKey;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use tracing::debug;

/// Field manager used for merge patches
pub const DEFAULT_FIELD_MANAGER: &str = "fabric-controller";

/// Builds an [`Api`] for a resource scope
pub trait ApiScope {
    /// `Api` for `namespace`, or across all namespaces
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl ApiScope for NamespaceResourceScope {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        }
    }
}

impl ApiScope for ClusterResourceScope {
    fn api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

/// [`ObjectClient`] talking to a Kubernetes API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("field_manager", &self.field_manager)
            .finish()
    }
}

impl KubeClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }

    /// Override the field manager used for create and merge patches
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: FabricResource,
        K::Scope: ApiScope,
    {
        <K::Scope as ApiScope>::api(self.client.clone(), namespace)
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl<K> ObjectClient<K> for KubeClient
where
    K: FabricResource,
    K::Scope: ApiScope,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ClientError> {
        Ok(self.api::<K>(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create(&self, obj: &K, dry_run: bool) -> Result<K, ClientError> {
        let params = PostParams {
            dry_run,
            field_manager: Some(self.field_manager.clone()),
        };
        let created = self
            .api::<K>(obj.meta().namespace.as_deref())
            .create(&params, obj)
            .await?;
        debug!(key = %ObjectKey::of(&created), dry_run, "Created object");
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, ClientError> {
        let params = PatchParams::default();
        Ok(self
            .api::<K>(key.namespace.as_deref())
            .patch(&key.name, &params, &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError> {
        let params = PatchParams::default();
        Ok(self
            .api::<K>(key.namespace.as_deref())
            .patch_status(&key.name, &params, &Patch::Merge(patch))
            .await?)
    }

    async fn apply(&self, obj: &K, field_manager: &str) -> Result<K, ClientError> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| ClientError::Api("apply requires metadata.name".to_string()))?;
        let params = PatchParams::apply(field_manager).force();
        Ok(self
            .api::<K>(obj.meta().namespace.as_deref())
            .patch(&name, &params, &Patch::Apply(obj))
            .await?)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.api::<K>(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await?;
        debug!(%key, "Deleted object");
        Ok(())
    }
}
