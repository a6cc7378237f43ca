//! VirtualMachineRestore Custom Resource Definition
//!
//! A restore re-materializes a VM and its volumes from a ready snapshot onto
//! an existing or new target VM.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{has_condition, Condition, ConditionStatus, ConditionType};

/// What to do when the target VM is running
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetReadinessPolicy {
    /// Wait until the target is stopped, however long it takes
    WaitEventually,
    /// Stop the target
    StopTarget,
    /// Wait for the grace period, then fail
    #[default]
    WaitGracePeriodAndFail,
    /// Fail right away
    FailImmediate,
}

/// How restored claims are named
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VolumeRestorePolicy {
    /// New `restore-<uid>-<volume>` claims
    #[default]
    RandomizeNames,
    /// Overwrite the original claims
    InPlace,
}

/// Who owns restored claims once the target is written
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VolumeOwnershipPolicy {
    /// The target VM owns restored claims and DataVolumes
    #[default]
    #[serde(rename = "VM")]
    Vm,
    /// Restored claims stay unowned
    None,
}

/// Per-volume override of the restored claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestoreOverride {
    /// VM volume the override applies to
    pub volume_name: String,

    /// Claim name to restore into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_name: Option<String>,

    /// Extra labels for the restored claim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for the restored claim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// One restored volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestore {
    /// VM volume name
    pub volume_name: String,

    /// Restored claim name
    pub persistent_volume_claim: String,

    /// Storage-level snapshot restored from
    pub volume_snapshot_name: String,

    /// DataVolume adopting the restored claim, for template-backed volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_name: Option<String>,

    /// Ownership moves to the target VM once it is written
    #[serde(default)]
    pub owned_by_target: bool,
}

/// Status of a VirtualMachineRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreStatus {
    /// Whether the restore finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,

    /// When the restore finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<DateTime<Utc>>,

    /// Restored volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restores: Vec<VolumeRestore>,

    /// DataVolumes to delete once the target is written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_data_volumes: Vec<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Specification for a VirtualMachineRestore
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineRestore",
    plural = "virtualmachinerestores",
    shortname = "vmrestore",
    namespaced,
    status = "VirtualMachineRestoreStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"TargetKind","type":"string","jsonPath":".spec.target.kind"}"#,
    printcolumn = r#"{"name":"TargetName","type":"string","jsonPath":".spec.target.name"}"#,
    printcolumn = r#"{"name":"Complete","type":"boolean","jsonPath":".status.complete"}"#,
    printcolumn = r#"{"name":"RestoreTime","type":"date","jsonPath":".status.restoreTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreSpec {
    /// VM to restore onto, created when missing
    pub target: TypedLocalObjectReference,

    /// Snapshot to restore from
    pub virtual_machine_snapshot_name: String,

    /// JSON patches applied to a newly created target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,

    /// Handling of a running target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_readiness_policy: Option<TargetReadinessPolicy>,

    /// Claim naming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_restore_policy: Option<VolumeRestorePolicy>,

    /// Ownership of restored claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ownership_policy: Option<VolumeOwnershipPolicy>,

    /// Per-volume overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_restore_overrides: Vec<VolumeRestoreOverride>,
}

impl VirtualMachineRestore {
    /// Whether the restore finished
    pub fn is_complete(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.complete)
            .unwrap_or(false)
    }

    /// Whether the restore failed permanently
    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            has_condition(&s.conditions, ConditionType::Failure, ConditionStatus::True)
        })
    }

    /// Neither complete nor failed
    pub fn is_progressing(&self) -> bool {
        !self.is_complete() && !self.is_failed()
    }

    /// Effective readiness policy
    pub fn readiness_policy(&self) -> TargetReadinessPolicy {
        self.spec.target_readiness_policy.unwrap_or_default()
    }

    /// Effective claim naming policy
    pub fn volume_restore_policy(&self) -> VolumeRestorePolicy {
        self.spec.volume_restore_policy.unwrap_or_default()
    }

    /// Effective ownership policy
    pub fn volume_ownership_policy(&self) -> VolumeOwnershipPolicy {
        self.spec.volume_ownership_policy.unwrap_or_default()
    }

    /// Override for a volume, if any
    pub fn override_for(&self, volume_name: &str) -> Option<&VolumeRestoreOverride> {
        self.spec
            .volume_restore_overrides
            .iter()
            .find(|o| o.volume_name == volume_name)
    }
}
