//! VirtualMachineSnapshot and VirtualMachineSnapshotContent resources
//!
//! A snapshot is the user-facing request; its content is the durable record
//! of the captured VM spec and the storage-level snapshot of every included
//! volume.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, TypedLocalObjectReference};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, OperationError};
use super::virtualmachine::VirtualMachineSpec;
use crate::kube_utils::parse_duration;

/// Phase of a VirtualMachineSnapshot
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SnapshotPhase {
    /// No phase computed yet, or an unrecognized state
    #[default]
    Unknown,
    /// Source locked and volumes being snapshotted
    InProgress,
    /// Content is ready to use
    Succeeded,
    /// Failure deadline exceeded
    Failed,
    /// Deletion requested while in progress
    Deleting,
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// What happens to the content when the snapshot is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Delete content and storage snapshots
    #[default]
    Delete,
    /// Keep a ready content after the snapshot is gone
    Retain,
}

/// Signals captured while the snapshot was taken
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Indication {
    /// The VM was running
    Online,
    /// The guest agent was connected, filesystems could be frozen
    GuestAgent,
    /// No guest agent, the snapshot is only crash consistent
    NoGuestAgent,
}

/// Volumes included in and excluded from a snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolumesLists {
    /// Snapshotted volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<String>,

    /// Volumes skipped because they cannot be snapshotted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

/// Status of a VirtualMachineSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    /// Current phase
    #[serde(default)]
    pub phase: SnapshotPhase,

    /// Whether the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// UID of the source VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uid: Option<String>,

    /// Point in time the volumes were captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Name of the content record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,

    /// Signals captured during the snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indications: Vec<Indication>,

    /// Included and excluded volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<SnapshotVolumesLists>,

    /// Last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Specification for a VirtualMachineSnapshot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineSnapshot",
    plural = "virtualmachinesnapshots",
    shortname = "vmsnapshot",
    namespaced,
    status = "VirtualMachineSnapshotStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"SourceKind","type":"string","jsonPath":".spec.source.kind"}"#,
    printcolumn = r#"{"name":"SourceName","type":"string","jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    /// Object to snapshot
    pub source: TypedLocalObjectReference,

    /// Content handling on deletion, `Delete` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    /// Time allowed before the snapshot fails (`"5m"`, `"1h30m"`, `"0s"` for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_deadline: Option<String>,
}

impl VirtualMachineSnapshot {
    /// Current status or the empty default
    pub fn status_or_default(&self) -> VirtualMachineSnapshotStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Whether the snapshot failed
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == SnapshotPhase::Failed)
    }

    /// Whether the snapshot succeeded
    pub fn is_succeeded(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == SnapshotPhase::Succeeded)
    }

    /// Whether the snapshot is ready to be restored from
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Whether an error is recorded
    pub fn has_error(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.error.is_some())
    }

    /// Still working towards a ready content
    pub fn is_progressing(&self) -> bool {
        !self.has_error() && !self.is_ready() && !self.is_failed() && !self.is_succeeded()
    }

    /// Effective deletion policy
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }

    /// Failure deadline, `None` when unlimited
    ///
    /// An unset or unparseable deadline falls back to `default`; an explicit
    /// zero disables the deadline.
    pub fn failure_deadline(&self, default: Duration) -> Option<Duration> {
        let deadline = match self.spec.failure_deadline.as_deref() {
            Some(raw) => parse_duration(raw).unwrap_or(default),
            None => default,
        };
        (!deadline.is_zero()).then_some(deadline)
    }
}

/// Claim captured alongside a volume backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimTemplate {
    /// Identity, labels and annotations of the original claim
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Original claim spec
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// One snapshotted volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    /// VM volume name
    pub volume_name: String,

    /// Captured claim
    pub persistent_volume_claim: PersistentVolumeClaimTemplate,

    /// Storage-level snapshot name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

impl VolumeBackup {
    /// Name of the original claim
    pub fn claim_name(&self) -> &str {
        self.persistent_volume_claim
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
    }
}

/// VM captured in a content record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVirtualMachine {
    /// Name, namespace, UID, labels and annotations of the source VM
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// VM spec at snapshot time
    #[serde(default)]
    pub spec: VirtualMachineSpec,
}

/// Source captured in a content record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Captured VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<SnapshotVirtualMachine>,
}

/// Status of one storage-level snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotState {
    /// Storage-level snapshot name
    pub volume_snapshot_name: String,

    /// When it was cut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Whether it can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Restore size hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<Quantity>,

    /// Driver error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Status of a VirtualMachineSnapshotContent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    /// When every storage snapshot was cut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Whether every storage snapshot is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,

    /// Per storage-snapshot status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_status: Vec<VolumeSnapshotState>,
}

/// Specification for a VirtualMachineSnapshotContent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineSnapshotContent",
    plural = "virtualmachinesnapshotcontents",
    shortname = "vmsnapshotcontent",
    namespaced,
    status = "VirtualMachineSnapshotContentStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"CreationTime","type":"date","jsonPath":".status.creationTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    /// Snapshot this content belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,

    /// Captured source
    #[serde(default)]
    pub source: SourceSpec,

    /// Snapshotted volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

impl VirtualMachineSnapshotContent {
    /// Whether every storage snapshot is ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Captured VM, if the source was a VM
    pub fn snapshot_vm(&self) -> Option<&SnapshotVirtualMachine> {
        self.spec.source.virtual_machine.as_ref()
    }
}
