//! Resource definitions used by the snapshot controllers
//!
//! Snapshot, content, restore and clone are owned by these controllers;
//! VirtualMachine, VirtualMachineInstance, DataVolume and the volume snapshot
//! types belong to other components and are modeled partially.

mod clone;
mod restore;
mod snapshot;
mod storage;
mod types;
mod virtualmachine;

pub use clone::{ClonePhase, VirtualMachineClone, VirtualMachineCloneSpec, VirtualMachineCloneStatus};
pub use restore::{
    TargetReadinessPolicy, VirtualMachineRestore, VirtualMachineRestoreSpec,
    VirtualMachineRestoreStatus, VolumeOwnershipPolicy, VolumeRestore, VolumeRestoreOverride,
    VolumeRestorePolicy,
};
pub use snapshot::{
    DeletionPolicy, Indication, PersistentVolumeClaimTemplate, SnapshotPhase,
    SnapshotVirtualMachine, SnapshotVolumesLists, SourceSpec, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentSpec,
    VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotSpec, VirtualMachineSnapshotStatus,
    VolumeBackup, VolumeSnapshotState,
};
pub use storage::{
    DataVolume, DataVolumePhase, DataVolumeSpec, DataVolumeStatus, VolumeSnapshot,
    VolumeSnapshotClass, VolumeSnapshotError, VolumeSnapshotSource, VolumeSnapshotSpec,
    VolumeSnapshotStatus, DEFAULT_SNAPSHOT_CLASS_ANNOTATION,
};
pub use types::{
    find_condition, has_condition, update_condition, Condition, ConditionStatus, ConditionType,
    OperationError,
};
pub use virtualmachine::{
    Bootloader, ClaimVolumeSource, DataVolumeSource, DataVolumeTemplateSpec, Devices, Disk,
    DomainSpec, Efi, Extra, Firmware, InstanceCondition, Interface, RevisionMatcher, RunStrategy,
    Tpm, VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VirtualMachineInstanceTemplateSpec, VirtualMachineSpec,
    VirtualMachineStatus, Volume, VolumeSnapshotCapability,
    AGENT_CONNECTED_CONDITION, FS_FROZEN,
};

/// API group of the VM resources
pub const KUBEVIRT_GROUP: &str = "kubevirt.io";
/// Kind name of a VirtualMachine
pub const VIRTUAL_MACHINE_KIND: &str = "VirtualMachine";
/// Kind name of a VirtualMachineSnapshot
pub const VIRTUAL_MACHINE_SNAPSHOT_KIND: &str = "VirtualMachineSnapshot";
/// API group of snapshots and restores
pub const SNAPSHOT_GROUP: &str = "snapshot.kubevirt.io";
