//! Fabric API client
//!
//! Thin abstraction over the Kubernetes API server used by the fabric
//! controllers. Reconcilers talk to [`ObjectClient`] trait objects so that
//! they can run against the real API server ([`KubeClient`]) or against an
//! in-memory store in unit tests (`MemoryClient`, behind the `test-util`
//! feature).
//!
//! Events go through the [`EventRecorder`] trait for the same reason.

pub mod client;
pub mod error;
pub mod events;
pub mod key;
pub mod kube_client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use client::{FabricResource, ObjectClient};
pub use error::ClientError;
pub use events::{EventKind, EventRecorder, FabricEvent, KubeEventRecorder};
pub use key::ObjectKey;
pub use kube_client::{ApiScope, KubeClient};
#[cfg(any(test, feature = "test-util"))]
pub use events::MemoryEventRecorder;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryClient, merge_patch};
