//! Kubernetes Event recording for the snapshot controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SnapshotReady")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
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
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Snapshot
    /// Content record created
    pub const CONTENT_CREATED: &str = "SuccessfulVirtualMachineSnapshotContentCreate";
    /// Storage-level snapshot created
    pub const VOLUME_SNAPSHOT_CREATED: &str = "SuccessfulVolumeSnapshotCreate";
    /// Storage-level snapshot vanished after creation
    pub const VOLUME_SNAPSHOT_MISSING: &str = "VolumeSnapshotMissing";
    /// Guest filesystems could not be frozen
    pub const FREEZE_SKIPPED: &str = "FreezeSkipped";
    /// Snapshot failure deadline exceeded
    pub const SNAPSHOT_DEADLINE_EXCEEDED: &str = "SnapshotDeadlineExceeded";

    // Restore
    /// Restore finished
    pub const RESTORE_COMPLETE: &str = "VirtualMachineRestoreComplete";
    /// Restore hit an error
    pub const RESTORE_ERROR: &str = "VirtualMachineRestoreError";
    /// Restore target is running
    pub const RESTORE_TARGET_NOT_READY: &str = "RestoreTargetNotReady";
    /// DataVolume for a restored volume could not be created
    pub const RESTORE_DATA_VOLUME_CREATE_ERROR: &str = "RestoreDataVolumeCreateError";

    // Clone
    /// Clone source does not exist yet
    pub const SOURCE_DOES_NOT_EXIST: &str = "SourceDoesNotExist";
    /// Clone source uses backend storage
    pub const SOURCE_WITH_BACKEND_STORAGE_INVALID: &str = "SourceWithBackendStorageInvalid";
    /// Clone source has volumes that cannot be snapshotted
    pub const VM_VOLUME_SNAPSHOTS_INVALID: &str = "VMVolumeSnapshotsInvalid";
    /// Intermediate snapshot created
    pub const SNAPSHOT_CREATED: &str = "SnapshotCreated";
    /// Intermediate snapshot ready
    pub const SNAPSHOT_READY: &str = "SnapshotReady";
    /// Intermediate snapshot vanished
    pub const SNAPSHOT_DELETED: &str = "SnapshotDeleted";
    /// Restore created
    pub const RESTORE_CREATED: &str = "RestoreCreated";
    /// Restore could not be created
    pub const RESTORE_CREATION_FAILED: &str = "RestoreCreationFailed";
    /// Restore complete
    pub const RESTORE_READY: &str = "RestoreReady";
    /// Target VM observed
    pub const TARGET_VM_CREATED: &str = "TargetVMCreated";
    /// Every restored claim is bound, intermediates removed
    pub const PVC_BOUND: &str = "PVCBound";
    /// Clone failed permanently
    pub const CLONE_FAILED: &str = "CloneFailed";
    /// Clone succeeded
    pub const CLONE_SUCCEEDED: &str = "CloneSucceeded";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Object creation
    pub const CREATE: &str = "Create";
    /// Guest filesystem freeze
    pub const FREEZE: &str = "Freeze";
    /// Target stop request
    pub const STOP: &str = "Stop";
    /// Object deletion
    pub const DELETE: &str = "Delete";
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::{RecordedEvent, RecordingEventPublisher};

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// An event captured by [`RecordingEventPublisher`]
    #[derive(Clone, Debug, PartialEq)]
    pub struct RecordedEvent {
        /// `namespace/name` of the object
        pub object: String,
        /// Whether the event is a warning
        pub warning: bool,
        /// Reason string
        pub reason: String,
        /// Note text
        pub note: Option<String>,
    }

    /// Publisher that keeps every event for later assertions
    #[derive(Default)]
    pub struct RecordingEventPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventPublisher {
        /// Every event published so far
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().clone()
        }

        /// Reasons of every event published so far
        pub fn reasons(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.reason.clone()).collect()
        }

        /// Whether an event with this reason was published
        pub fn has_reason(&self, reason: &str) -> bool {
            self.events.lock().iter().any(|e| e.reason == reason)
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
            note: Option<String>,
        ) {
            self.events.lock().push(RecordedEvent {
                object: format!(
                    "{}/{}",
                    resource_ref.namespace.as_deref().unwrap_or_default(),
                    resource_ref.name.as_deref().unwrap_or_default()
                ),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}
