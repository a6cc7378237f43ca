//! Secondary watch mappers
//!
//! Each function maps a changed dependent to the primary objects that must
//! be reconciled again. The primaries are looked up in the controller's own
//! reflector store, passed in as a slice.

use std::sync::Arc;

use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use virtsnap_common::crd::{
    VirtualMachineClone, VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VIRTUAL_MACHINE_KIND,
};
use virtsnap_common::kube_utils::annotation;
use virtsnap_common::RESTORE_NAME_ANNOTATION;

fn same_namespace<K: Resource>(a: &K, b: &impl Resource) -> bool {
    a.meta().namespace == b.meta().namespace
}

fn refs<K>(objects: impl Iterator<Item = Arc<K>>) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    objects.map(|obj| ObjectRef::from_obj(obj.as_ref())).collect()
}

/// Snapshots whose source is the VM (or instance) named `vm`
pub fn snapshots_for_vm(
    vm: &impl Resource,
    snapshots: &[Arc<VirtualMachineSnapshot>],
) -> Vec<ObjectRef<VirtualMachineSnapshot>> {
    let name = vm.meta().name.as_deref().unwrap_or_default();
    refs(
        snapshots
            .iter()
            .filter(|s| same_namespace(s.as_ref(), vm))
            .filter(|s| {
                s.spec.source.kind == VIRTUAL_MACHINE_KIND && s.spec.source.name == name
            })
            .cloned(),
    )
}

/// The snapshot a content belongs to
pub fn snapshot_for_content(
    content: &VirtualMachineSnapshotContent,
) -> Option<ObjectRef<VirtualMachineSnapshot>> {
    let name = content.spec.virtual_machine_snapshot_name.as_deref()?;
    let namespace = content.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// The content recorded in a snapshot's status
pub fn content_for_snapshot(
    snapshot: &VirtualMachineSnapshot,
) -> Option<ObjectRef<VirtualMachineSnapshotContent>> {
    let name = snapshot
        .status
        .as_ref()?
        .virtual_machine_snapshot_content_name
        .as_deref()?;
    let namespace = snapshot.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Restores targeting the VM (or instance) named `vm`
pub fn restores_for_target(
    vm: &impl Resource,
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let name = vm.meta().name.as_deref().unwrap_or_default();
    refs(
        restores
            .iter()
            .filter(|r| same_namespace(r.as_ref(), vm) && r.spec.target.name == name)
            .cloned(),
    )
}

/// The restore that created a claim or data volume
pub fn restore_for_volume(volume: &impl Resource) -> Option<ObjectRef<VirtualMachineRestore>> {
    let meta = volume.meta();
    let name = annotation(meta, RESTORE_NAME_ANNOTATION)?;
    let namespace = meta.namespace.as_deref()?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Restores reading from the snapshot
pub fn restores_for_snapshot(
    snapshot: &VirtualMachineSnapshot,
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let name = snapshot.name_any();
    refs(
        restores
            .iter()
            .filter(|r| {
                same_namespace(r.as_ref(), snapshot) && r.spec.virtual_machine_snapshot_name == name
            })
            .cloned(),
    )
}

/// Clones whose source or target is the VM named `vm`
pub fn clones_for_vm(
    vm: &impl Resource,
    clones: &[Arc<VirtualMachineClone>],
) -> Vec<ObjectRef<VirtualMachineClone>> {
    let name = vm.meta().name.as_deref().unwrap_or_default();
    refs(
        clones
            .iter()
            .filter(|c| same_namespace(c.as_ref(), vm))
            .filter(|c| {
                let source =
                    c.spec.source.kind == VIRTUAL_MACHINE_KIND && c.spec.source.name == name;
                let target = c.spec.target.as_ref().is_some_and(|t| t.name == name);
                source || target
            })
            .cloned(),
    )
}
