//! Fabric reconciliation runtime
//!
//! Building blocks shared by the fabric controllers: a [`Runner`] driving a
//! [`Reconciler`] from a `kube_runtime` controller with a timeout and
//! per-object backoff, the standard [`reconcile_managed`] lifecycle with
//! finalizers, the requeue-on-release loop, an [`IndexingMap`] for reverse
//! lookups, selector matching, source labels, health and metrics endpoints and
//! lease-based leader election.

pub mod action;
pub mod backoff;
pub mod controller;
pub mod error;
pub mod finalizer;
pub mod indexing;
pub mod leader;
pub mod lifecycle;
pub mod metrics;
pub mod released;
pub mod selectors;
pub mod server;
pub mod source;

pub use action::{Action, REQUEUE_DELAY, requeue};
pub use backoff::ExponentialBackoff;
pub use controller::{ReconcileError, Reconciler, Runner, object_ref};
pub use error::{Retriable, RuntimeError};
pub use finalizer::{
    clear_reconcile_request, ensure_finalizer, has_finalizer, has_reconcile_request, is_deleting,
    remove_finalizer, request_reconcile,
};
pub use indexing::{IndexingMap, ReverseMapIndex};
pub use leader::LeaderElector;
pub use lifecycle::{Cleanup, Managed, ManagedReconciler, reconcile_managed};
pub use metrics::Metrics;
pub use released::{PendingRequeue, ReleaseHandler, run_released_loop};
pub use selectors::{
    matches_label_selector, matches_node_selector, matches_node_selector_term,
    matches_optional_selector,
};
pub use source::{SOURCE_LABEL_PREFIX, SourceLabels};
