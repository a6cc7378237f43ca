//! Per-volume snapshot capability reported on VirtualMachine status

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use virtsnap_common::crd::{VirtualMachine, Volume, VolumeSnapshotCapability};
use virtsnap_common::{ControllerContext, Result, VirtClient};

use crate::storage::{volume_snapshot_class, volume_storage_class};

/// Reconcile the `volumeSnapshotStatuses` of a VirtualMachine
#[instrument(skip(vm, ctx), fields(vm = %vm.name_any(), namespace = %vm.namespace().unwrap_or_default()))]
pub async fn reconcile(vm: Arc<VirtualMachine>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let mut capabilities = Vec::with_capacity(vm.volumes().len());
    for volume in vm.volumes() {
        capabilities.push(capability(ctx.kube.as_ref(), &vm, volume).await);
    }

    let current = vm
        .status
        .as_ref()
        .map(|s| s.volume_snapshot_statuses.as_slice())
        .unwrap_or_default();
    if current == capabilities.as_slice() {
        return Ok(Action::await_change());
    }

    debug!(volumes = capabilities.len(), "updating volume snapshot capabilities");
    let mut updated = (*vm).clone();
    updated
        .status
        .get_or_insert_with(Default::default)
        .volume_snapshot_statuses = capabilities;
    ctx.kube.update_vm_status(&updated).await?;
    Ok(Action::await_change())
}

async fn capability(
    kube: &dyn VirtClient,
    vm: &VirtualMachine,
    volume: &Volume,
) -> VolumeSnapshotCapability {
    let disabled = |reason: String| VolumeSnapshotCapability {
        name: volume.name.clone(),
        enabled: false,
        reason: Some(reason),
    };

    let supported = volume.persistent_volume_claim.is_some()
        || volume.data_volume.is_some()
        || volume.memory_dump.is_some();
    if !supported {
        return disabled(format!(
            "Snapshot is not supported for this volumeSource type [{}]",
            volume.name
        ));
    }

    let storage_class = match volume_storage_class(kube, vm, volume).await {
        Ok(Some(sc)) => sc,
        Ok(None) => String::new(),
        Err(e) => return disabled(e.to_string()),
    };

    match volume_snapshot_class(kube, &storage_class).await {
        Ok(Some(_)) => VolumeSnapshotCapability {
            name: volume.name.clone(),
            enabled: true,
            reason: None,
        },
        Ok(None) => disabled(format!(
            "No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [{storage_class}] [{}]",
            volume.name
        )),
        Err(e) => disabled(e.to_string()),
    }
}
