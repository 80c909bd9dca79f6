//! Kubernetes events

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Informational
    Normal,
    /// Needs attention
    Warning,
}

/// Event attached to an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricEvent {
    /// Severity
    pub kind: EventKind,
    /// CamelCase reason, e.g. `FailedAllocatingPublicIP`
    pub reason: String,
    /// Human readable note
    pub note: String,
    /// Action being taken, e.g. `Allocate`
    pub action: String,
}

impl FabricEvent {
    /// Normal event
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }

    /// Warning event
    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }
}

/// Publishes events; failures are logged, never returned
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish `event` on `object`
    async fn publish(&self, object: &ObjectReference, event: FabricEvent);
}

/// Recorder backed by the events API
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// Recorder reporting as `controller`
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, object: &ObjectReference, event: FabricEvent) {
        let ev = Event {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.note.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, object).await {
            warn!(
                reason = %event.reason,
                object = ?object.name,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryEventRecorder;

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Recorder keeping events in memory for assertions
    #[derive(Debug, Clone, Default)]
    pub struct MemoryEventRecorder {
        events: Arc<Mutex<Vec<(ObjectReference, FabricEvent)>>>,
    }

    impl MemoryEventRecorder {
        /// Empty recorder
        pub fn new() -> Self {
            Self::default()
        }

        /// Every recorded event
        pub fn events(&self) -> Vec<(ObjectReference, FabricEvent)> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Reasons of events recorded for the object named `name`
        pub fn reasons_for(&self, name: &str) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|(object, _)| object.name.as_deref() == Some(name))
                .map(|(_, event)| event.reason)
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl EventRecorder for MemoryEventRecorder {
        async fn publish(&self, object: &ObjectReference, event: FabricEvent) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((object.clone(), event));
        }
    }
}
