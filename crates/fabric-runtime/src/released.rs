//! Requeue-on-release loop
//!
//! Allocators signal through their released channel whenever capacity comes
//! back. The loop below wakes the registered handlers, each of which lists
//! its pending objects and annotates those whose request fits again.

use crate::error::RuntimeError;
use crate::finalizer::request_reconcile;
use fabric_client::{FabricResource, ObjectClient, ObjectKey};
use ipam::ReleasedReceiver;
use kube::Resource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-enqueues pending objects of one kind after a release
#[async_trait::async_trait]
pub trait ReleaseHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Request a reconcile of every pending object that fits now.
    ///
    /// Returns the number of objects annotated.
    async fn requeue_pending(&self) -> Result<usize, RuntimeError>;
}

type Predicate<K> = Box<dyn Fn(&K) -> bool + Send + Sync>;

/// [`ReleaseHandler`] over one resource kind driven by two predicates
pub struct PendingRequeue<K: FabricResource> {
    name: String,
    client: Arc<dyn ObjectClient<K>>,
    is_pending: Predicate<K>,
    can_fit: Predicate<K>,
}

impl<K: FabricResource> std::fmt::Debug for PendingRequeue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequeue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K: FabricResource> PendingRequeue<K> {
    /// Handler annotating objects for which both predicates hold
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ObjectClient<K>>,
        is_pending: impl Fn(&K) -> bool + Send + Sync + 'static,
        can_fit: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            is_pending: Box::new(is_pending),
            can_fit: Box::new(can_fit),
        }
    }
}

#[async_trait::async_trait]
impl<K: FabricResource> ReleaseHandler for PendingRequeue<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn requeue_pending(&self) -> Result<usize, RuntimeError> {
        let candidates: Vec<ObjectKey> = self
            .client
            .list_all()
            .await?
            .iter()
            .filter(|obj| obj.meta().deletion_timestamp.is_none())
            .filter(|obj| (self.is_pending)(obj) && (self.can_fit)(obj))
            .map(ObjectKey::of)
            .collect();
        for key in &candidates {
            debug!(handler = %self.name, key = %key, "Requesting reconcile after release");
            request_reconcile(self.client.as_ref(), key).await?;
        }
        Ok(candidates.len())
    }
}

/// Wake every handler on each (coalesced) release notification until
/// `cancel` fires or the allocator is dropped.
pub async fn run_released_loop(
    name: &str,
    mut released: ReleasedReceiver,
    handlers: Vec<Arc<dyn ReleaseHandler>>,
    cancel: CancellationToken,
) {
    info!(allocator = %name, "Starting released loop");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = released.recv() => {
                if received.is_none() {
                    break;
                }
                for handler in &handlers {
                    match handler.requeue_pending().await {
                        Ok(0) => {}
                        Ok(count) => {
                            info!(allocator = %name, handler = %handler.name(), count, "Requeued pending objects");
                        }
                        Err(e) => {
                            warn!(allocator = %name, handler = %handler.name(), error = %e, "Failed to requeue pending objects");
                        }
                    }
                }
            }
        }
    }
    info!(allocator = %name, "Released loop stopped");
}
