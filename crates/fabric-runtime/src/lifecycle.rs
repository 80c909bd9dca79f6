//! Standard reconcile lifecycle of a managed resource
//!
//! 1. Fetch; a missing object runs [`Managed::gone`].
//! 2. Skip objects this controller does not handle.
//! 3. Deleting objects run [`Managed::cleanup`], then lose the finalizer
//!    unless the cleanup reported [`Cleanup::Blocked`].
//! 4. Otherwise ensure the finalizer, clear a reconcile request, and run
//!    [`Managed::apply`]. Each of the first two writes ends the pass with a
//!    requeue so the body always sees a fresh object.

use crate::action::{Action, requeue};
use crate::error::Retriable;
use crate::finalizer::{
    clear_reconcile_request, ensure_finalizer, has_finalizer, is_deleting, remove_finalizer,
};
use fabric_client::{ClientError, FabricResource, ObjectClient, ObjectKey};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`Managed::cleanup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Everything released; the finalizer may go
    Finished,
    /// Something still depends on the object; keep the finalizer
    Blocked,
}

/// A resource kind driven through [`reconcile_managed`]
#[async_trait::async_trait]
pub trait Managed: Send + Sync {
    /// Resource kind
    type Resource: FabricResource;
    /// Error of the type-specific hooks
    type Error: From<ClientError> + Send;

    /// Client for the resource kind
    fn client(&self) -> &dyn ObjectClient<Self::Resource>;

    /// Finalizer owned by this controller
    fn finalizer(&self) -> &str;

    /// Whether this controller handles `obj` (e.g. by `spec.type`)
    fn handles(&self, _obj: &Self::Resource) -> bool {
        true
    }

    /// The object behind `key` no longer exists
    async fn gone(&self, _key: &ObjectKey) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Release everything held for `obj`; runs before the finalizer is removed
    async fn cleanup(&self, obj: &Self::Resource) -> Result<Cleanup, Self::Error>;

    /// Type-specific body for a live object carrying the finalizer
    async fn apply(&self, obj: Self::Resource) -> Result<Action, Self::Error>;
}

/// Run the standard lifecycle for the object behind `key`.
pub async fn reconcile_managed<M>(managed: &M, key: &ObjectKey) -> Result<Action, M::Error>
where
    M: Managed + ?Sized,
{
    let client = managed.client();
    let Some(obj) = client.get(key).await? else {
        debug!(key = %key, "Object gone");
        managed.gone(key).await?;
        return Ok(Action::await_change());
    };

    if !managed.handles(&obj) {
        debug!(key = %key, "Not handled by this controller");
        return Ok(Action::await_change());
    }

    let finalizer = managed.finalizer();
    if is_deleting(&obj) {
        if !has_finalizer(&obj, finalizer) {
            return Ok(Action::await_change());
        }
        info!(key = %key, "Cleaning up deleted object");
        if managed.cleanup(&obj).await? == Cleanup::Blocked {
            debug!(key = %key, "Cleanup blocked, keeping finalizer");
            return Ok(Action::await_change());
        }
        remove_finalizer(client, &obj, finalizer).await?;
        return Ok(Action::await_change());
    }

    if ensure_finalizer(client, &obj, finalizer).await? {
        return Ok(requeue());
    }
    if clear_reconcile_request(client, &obj).await? {
        return Ok(requeue());
    }
    managed.apply(obj).await
}

/// [`Reconciler`](crate::controller::Reconciler) running [`reconcile_managed`] for `M`
pub struct ManagedReconciler<M> {
    name: String,
    managed: Arc<M>,
}

impl<M> std::fmt::Debug for ManagedReconciler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedReconciler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<M> ManagedReconciler<M> {
    /// Reconciler named `name` around `managed`
    pub fn new(name: impl Into<String>, managed: Arc<M>) -> Self {
        Self {
            name: name.into(),
            managed,
        }
    }
}

#[async_trait::async_trait]
impl<M> crate::controller::Reconciler for ManagedReconciler<M>
where
    M: Managed + 'static,
    M::Error: std::error::Error + Retriable + Sync + 'static,
{
    type Error = M::Error;

    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, M::Error> {
        reconcile_managed(self.managed.as_ref(), key).await
    }
}
