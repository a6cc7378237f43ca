//! VirtualMachine and VirtualMachineInstance resources (`kubevirt.io/v1`)
//!
//! These resources are owned by the virtualization platform. Only the fields
//! the snapshot controllers read or rewrite are modeled; everything else is
//! carried through `extra` so read-modify-write cycles stay lossless.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::storage::DataVolumeSpec;

/// Unmodeled fields preserved verbatim
pub type Extra = BTreeMap<String, Value>;

/// How a VM's instance is kept running
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RunStrategy {
    /// Always keep an instance running
    Always,
    /// Restart the instance only after failures
    RerunOnFailure,
    /// Controlled manually through start/stop requests
    Manual,
    /// Keep the VM stopped
    #[default]
    Halted,
    /// Run once to completion
    Once,
    /// Wait as a migration receiver
    WaitAsReceiver,
}

/// Reference to an instance type or preference, optionally pinned to a revision
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMatcher {
    /// Name of the instance type or preference
    pub name: String,

    /// Kind of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// ControllerRevision holding the captured object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Template for a DataVolume owned by the VM
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeTemplateSpec {
    /// Template metadata; the name becomes the DataVolume name
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// DataVolume spec
    #[serde(default)]
    pub spec: DataVolumeSpec,
}

impl DataVolumeTemplateSpec {
    /// Name of the DataVolume created from this template
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Template for the VM's instances
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplateSpec {
    /// Instance metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Instance spec
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

/// Desired state of a VirtualMachine
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Legacy run switch, superseded by `runStrategy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    /// Run strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<RunStrategy>,

    /// Instance type reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instancetype: Option<RevisionMatcher>,

    /// Preference reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<RevisionMatcher>,

    /// DataVolumes created alongside the VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplateSpec>,

    /// Instance template
    #[serde(default)]
    pub template: VirtualMachineInstanceTemplateSpec,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Per-volume snapshot capability reported on the VM
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotCapability {
    /// Volume name
    pub name: String,

    /// Whether the volume can be snapshotted
    pub enabled: bool,

    /// Why the volume cannot be snapshotted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Observed state of a VirtualMachine
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Snapshot currently holding the VM lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_in_progress: Option<String>,

    /// Restore currently restoring onto the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_in_progress: Option<String>,

    /// Snapshot capability per volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_statuses: Vec<VolumeSnapshotCapability>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl VirtualMachine {
    /// Effective run strategy, honoring the legacy `running` switch
    pub fn run_strategy(&self) -> RunStrategy {
        match (self.spec.run_strategy, self.spec.running) {
            (Some(strategy), _) => strategy,
            (None, Some(true)) => RunStrategy::Always,
            _ => RunStrategy::Halted,
        }
    }

    /// Volumes declared in the instance template
    pub fn volumes(&self) -> &[Volume] {
        &self.spec.template.spec.volumes
    }

    /// Whether the VM keeps persistent state in a backend-storage claim
    pub fn needs_backend_storage(&self) -> bool {
        self.spec.needs_backend_storage()
    }

    /// Snapshot lock holder, if any
    pub fn snapshot_in_progress(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.snapshot_in_progress.as_deref())
    }

    /// Restore lock holder, if any
    pub fn restore_in_progress(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.restore_in_progress.as_deref())
    }
}

impl VirtualMachineSpec {
    /// Whether a persistent TPM or persistent EFI variable store is requested
    pub fn needs_backend_storage(&self) -> bool {
        let domain = &self.template.spec.domain;
        let tpm = domain
            .devices
            .tpm
            .as_ref()
            .and_then(|t| t.persistent)
            .unwrap_or(false);
        let efi = domain
            .firmware
            .as_ref()
            .and_then(|f| f.bootloader.as_ref())
            .and_then(|b| b.efi.as_ref())
            .and_then(|e| e.persistent)
            .unwrap_or(false);
        tpm || efi
    }
}

/// Spec of a VirtualMachineInstance
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Domain (hardware) definition
    #[serde(default)]
    pub domain: DomainSpec,

    /// Volumes attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Hardware definition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Devices attached to the domain
    #[serde(default)]
    pub devices: Devices,

    /// Firmware settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Devices attached to the domain
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    /// TPM device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<Tpm>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Network interface
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface name
    pub name: String,

    /// Fixed MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Disk device
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Disk name, matches a volume name
    pub name: String,

    #[serde(flatten)]
    pub extra: Extra,
}

/// TPM device
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tpm {
    /// Keep TPM state across restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Firmware settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
    /// Firmware UUID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// SMBIOS serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Bootloader settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Bootloader settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Bootloader {
    /// EFI bootloader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<Efi>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// EFI bootloader
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Efi {
    /// Keep EFI variables across restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A volume in the instance template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,

    /// PersistentVolumeClaim source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,

    /// DataVolume source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,

    /// Memory dump target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dump: Option<ClaimVolumeSource>,

    /// Other volume sources (container disks, cloud-init, ...)
    #[serde(flatten)]
    pub extra: Extra,
}

impl Volume {
    /// Volume backed by a PersistentVolumeClaim
    pub fn from_claim(name: impl Into<String>, claim_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistent_volume_claim: Some(ClaimVolumeSource {
                claim_name: claim_name.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Volume backed by a DataVolume
    pub fn from_data_volume(name: impl Into<String>, data_volume: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_volume: Some(DataVolumeSource {
                name: data_volume.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Claim backing this volume, for snapshot-capable sources only
    ///
    /// DataVolumes share their name with the claim they populate. Memory
    /// dumps are excluded.
    pub fn claim_name(&self) -> Option<&str> {
        if let Some(pvc) = &self.persistent_volume_claim {
            return Some(&pvc.claim_name);
        }
        self.data_volume.as_ref().map(|dv| dv.name.as_str())
    }
}

/// Claim-backed volume source
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    /// Claim name
    pub claim_name: String,

    #[serde(flatten)]
    pub extra: Extra,
}

/// DataVolume-backed volume source
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// DataVolume name
    pub name: String,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Instance condition as reported by the runtime
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,
}

/// Observed state of a VirtualMachineInstance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Lifecycle phase (Pending, Scheduling, Running, Succeeded, Failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Guest filesystem freeze state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_freeze_status: Option<String>,

    /// Runtime conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<InstanceCondition>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Condition set on an instance while the guest agent is connected
pub const AGENT_CONNECTED_CONDITION: &str = "AgentConnected";
/// `fsFreezeStatus` value of a frozen guest
pub const FS_FROZEN: &str = "frozen";

impl VirtualMachineInstance {
    /// Whether the guest agent is connected
    pub fn has_guest_agent(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == AGENT_CONNECTED_CONDITION && c.status == "True")
        })
    }

    /// Whether the guest filesystems are frozen
    pub fn is_frozen(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.fs_freeze_status.as_deref())
            == Some(FS_FROZEN)
    }

    /// Whether the instance has terminated
    pub fn is_final(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }
}
