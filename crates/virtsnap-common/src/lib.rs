//! Common types for the VM snapshot controllers: resources, cluster access,
//! errors and utilities

#![warn(missing_docs)]

pub mod client;
pub mod context;
pub mod crd;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod kube_utils;
pub mod settings;
pub mod telemetry;

pub use client::{KubeVirtClient, VirtClient};
pub use context::{default_error_policy, ControllerContext};
pub use error::{Error, Result};
pub use settings::ControllerSettings;

/// Finalizer keeping a snapshot alive until its content is cleaned up
pub const SNAPSHOT_FINALIZER: &str = "snapshot.kubevirt.io/vmsnapshot-protection";

/// Finalizer on snapshot contents, also set on a locked source VM
pub const CONTENT_FINALIZER: &str = "snapshot.kubevirt.io/vmsnapshotcontent-protection";

/// Finalizer on restores and their target VM while the restore runs
pub const RESTORE_FINALIZER: &str = "restore.kubevirt.io/vmrestore-protection";

/// Annotation marking volumes and claims created by a restore
pub const RESTORE_NAME_ANNOTATION: &str = "restore.kubevirt.io/name";

/// Annotation on a restore target naming the last restore applied, as `<name>-<uid>`
pub const LAST_RESTORE_ANNOTATION: &str = "restore.kubevirt.io/lastRestoreUID";

/// Annotation telling CDI a claim already holds the data for a DataVolume
pub const POPULATED_FOR_ANNOTATION: &str = "cdi.kubevirt.io/storage.populatedFor";

/// Annotation telling CDI a DataVolume needs no import
pub const PRE_POPULATED_ANNOTATION: &str = "cdi.kubevirt.io/storage.prePopulated";

/// Label on restored volumes naming the snapshot source VM
pub const SOURCE_VM_NAME_LABEL: &str = "restore.kubevirt.io/source-vm-name";

/// Label on restored volumes naming the snapshot source namespace
pub const SOURCE_VM_NAMESPACE_LABEL: &str = "restore.kubevirt.io/source-vm-namespace";

/// Label on claims holding persistent TPM or EFI state for a VM
pub const PERSISTENT_STATE_LABEL: &str = "persistent-state-for";

/// Label marking a superseded backend storage claim for garbage collection
pub const BACKEND_CLEANUP_LABEL: &str = "restore.kubevirt.io/backend-storage-cleanup";

/// Label on storage snapshots naming the source VM
pub const SNAPSHOT_SOURCE_NAME_LABEL: &str = "snapshot.kubevirt.io/source-vm-name";

/// Label on storage snapshots naming the source namespace
pub const SNAPSHOT_SOURCE_NAMESPACE_LABEL: &str = "snapshot.kubevirt.io/source-vm-namespace";

/// Volume name under which a VM's backend storage claim is snapshotted
pub const BACKEND_STORAGE_VOLUME: &str = "persistent-state-for";
