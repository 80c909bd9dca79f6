//! Finalizer and reconcile-request helpers
//!
//! Both are single merge patches carrying the observed `resourceVersion`, so
//! a concurrent writer turns them into a `Conflict` instead of a lost update.

use crds::ANNOTATION_RECONCILE_REQUEST;
use fabric_client::{ClientError, FabricResource, ObjectClient, ObjectKey};
use kube::Resource;
use serde_json::json;
use tracing::debug;

/// Whether `obj` carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Whether `obj` is being deleted
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Add `finalizer` to `obj`. Returns whether a write happened.
pub async fn ensure_finalizer<K: FabricResource>(
    client: &dyn ObjectClient<K>,
    obj: &K,
    finalizer: &str,
) -> Result<bool, ClientError> {
    if has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    client.patch(&ObjectKey::of(obj), &patch).await?;
    debug!(key = %ObjectKey::of(obj), finalizer, "Added finalizer");
    Ok(true)
}

/// Remove `finalizer` from `obj`. Returns whether a write happened.
///
/// An object that is already gone counts as done.
pub async fn remove_finalizer<K: FabricResource>(
    client: &dyn ObjectClient<K>,
    obj: &K,
    finalizer: &str,
) -> Result<bool, ClientError> {
    if !has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    let finalizers: Vec<&String> = obj
        .meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| *f != finalizer)
        .collect();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    match client.patch(&ObjectKey::of(obj), &patch).await {
        Ok(_) => {
            debug!(key = %ObjectKey::of(obj), finalizer, "Removed finalizer");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether `obj` carries the reconcile-request annotation
pub fn has_reconcile_request<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_RECONCILE_REQUEST))
}

/// Annotate the object behind `key` so that its watch fires again.
///
/// A missing object is ignored.
pub async fn request_reconcile<K: FabricResource>(
    client: &dyn ObjectClient<K>,
    key: &ObjectKey,
) -> Result<(), ClientError> {
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_RECONCILE_REQUEST: chrono::Utc::now().to_rfc3339(),
            }
        }
    });
    match client.patch(key, &patch).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Drop the reconcile-request annotation. Returns whether a write happened.
pub async fn clear_reconcile_request<K: FabricResource>(
    client: &dyn ObjectClient<K>,
    obj: &K,
) -> Result<bool, ClientError> {
    if !has_reconcile_request(obj) {
        return Ok(false);
    }
    let patch = json!({
        "metadata": {
            "annotations": { ANNOTATION_RECONCILE_REQUEST: null },
            "resourceVersion": obj.meta().resource_version,
        }
    });
    client.patch(&ObjectKey::of(obj), &patch).await?;
    Ok(true)
}
