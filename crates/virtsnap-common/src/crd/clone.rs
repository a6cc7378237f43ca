//! VirtualMachineClone Custom Resource Definition
//!
//! A clone composes a snapshot and a restore to produce an independent copy
//! of a VM, rewriting identity fields on the way.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Phase of a VirtualMachineClone
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClonePhase {
    /// Nothing created yet
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Waiting for the intermediate snapshot
    SnapshotInProgress,
    /// Waiting for the restore
    RestoreInProgress,
    /// Waiting for the target VM to appear
    CreatingTargetVM,
    /// Target VM exists
    Succeeded,
    /// Failed permanently
    Failed,
}

impl ClonePhase {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            Self::SnapshotInProgress => write!(f, "SnapshotInProgress"),
            Self::RestoreInProgress => write!(f, "RestoreInProgress"),
            Self::CreatingTargetVM => write!(f, "CreatingTargetVM"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a VirtualMachineClone
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCloneStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClonePhase,

    /// Snapshot used as clone material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    /// Restore producing the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_name: Option<String>,

    /// Target VM name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Specification for a VirtualMachineClone
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clone.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineClone",
    plural = "virtualmachineclones",
    shortname = "vmclone",
    namespaced,
    status = "VirtualMachineCloneStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"SourceVirtualMachine","type":"string","jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"TargetVirtualMachine","type":"string","jsonPath":".spec.target.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCloneSpec {
    /// VM or snapshot to clone
    pub source: TypedLocalObjectReference,

    /// Target VM, a name is generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TypedLocalObjectReference>,

    /// Annotation keys to keep; `*` wildcards, `!` negates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotation_filters: Vec<String>,

    /// Label keys to keep; `*` wildcards, `!` negates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<String>,

    /// New MAC address per interface name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_mac_addresses: BTreeMap<String, String>,

    /// New SMBIOS serial
    #[serde(
        default,
        rename = "newSMBiosSerial",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_smbios_serial: Option<String>,

    /// Extra JSON patches for the target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
}

impl VirtualMachineClone {
    /// Current phase
    pub fn phase(&self) -> ClonePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
