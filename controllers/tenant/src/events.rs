//! Kubernetes Event recording for reconcilers.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Publishes audit events against reconciled objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// `controller_name` is reported as the event's reporting component
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons shown in `kubectl get events`
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const UPDATED: &str = "Updated";
    pub const DELETED: &str = "Deleted";
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// A child object owned by the reconciled object could not be created
    pub const FAILED_CREATE_SUB_RESOURCE: &str = "FailedCreateSubResource";
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    pub const FAILED_DELETE: &str = "FailedDelete";
    pub const UNKNOWN_ERROR: &str = "UnknownError";
}

/// Event actions
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CLEANUP: &str = "Cleanup";
}

#[cfg(test)]
pub use recording::{RecordedEvent, RecordingEventPublisher};

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::Mutex;

    /// One captured event
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub object: String,
        pub warning: bool,
        pub reason: String,
    }

    /// Captures events in memory for assertions
    #[derive(Debug, Default)]
    pub struct RecordingEventPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventPublisher {
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn reasons(&self) -> Vec<String> {
            self.events().into_iter().map(|e| e.reason).collect()
        }

        pub fn clear(&self) {
            self.events.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEventPublisher {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.events.lock().unwrap().push(RecordedEvent {
                object: resource_ref.name.clone().unwrap_or_default(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
            });
        }
    }
}
