//! Restored volumes
//!
//! The set of [`VolumeRestore`] records is planned once and persisted before
//! any claim is created. Each record names the claim a backed-up volume is
//! restored into; claims are then provisioned from the storage-level
//! snapshot and must all be bound before the target is written.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    TypedObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use virtsnap_common::crd::{
    SnapshotVirtualMachine, VirtualMachine, VirtualMachineRestore, VirtualMachineRestoreStatus,
    VirtualMachineSnapshotContent, VolumeBackup, VolumeOwnershipPolicy, VolumeRestore,
    VolumeRestorePolicy, VolumeSnapshot,
};
use virtsnap_common::kube_utils::{
    annotation, controller_of, controller_owner_ref, is_deleting, label, parse_quantity,
    set_annotation, set_controller, set_label,
};
use virtsnap_common::{
    ControllerContext, Error, Result, BACKEND_CLEANUP_LABEL, BACKEND_STORAGE_VOLUME,
    PERSISTENT_STATE_LABEL, PRE_POPULATED_ANNOTATION, RESTORE_NAME_ANNOTATION,
    SOURCE_VM_NAMESPACE_LABEL, SOURCE_VM_NAME_LABEL,
};

/// Provisioning annotations that must not be copied onto a restored claim
const DROPPED_ANNOTATION_PREFIXES: &[&str] = &[
    "pv.kubernetes.io",
    "volume.beta.kubernetes.io",
    "cdi.kubevirt.io",
    "volume.kubernetes.io",
    "k8s.io/CloneRequest",
    "k8s.io/CloneOf",
];

const STORAGE: &str = "storage";

/// Default name of the claim a volume is restored into
pub fn restore_claim_name(restore: &VirtualMachineRestore, volume_name: &str) -> String {
    format!(
        "restore-{}-{volume_name}",
        restore.metadata.uid.as_deref().unwrap_or_default()
    )
}

/// Destination claim of a backed-up volume
///
/// An explicit override wins, then the in-place policy reuses the original
/// claim name, otherwise the generated name is used.
pub fn destination_claim(restore: &VirtualMachineRestore, backup: &VolumeBackup) -> String {
    if let Some(name) = restore
        .override_for(&backup.volume_name)
        .and_then(|o| o.restore_name.clone())
    {
        return name;
    }
    match restore.volume_restore_policy() {
        VolumeRestorePolicy::InPlace if !backup.claim_name().is_empty() => {
            backup.claim_name().to_string()
        }
        _ => restore_claim_name(restore, &backup.volume_name),
    }
}

/// Whether a volume of the captured VM is backed by one of its DataVolume templates
pub fn template_backed(vm: &SnapshotVirtualMachine, volume_name: &str) -> bool {
    vm.spec
        .template
        .spec
        .volumes
        .iter()
        .filter(|v| v.name == volume_name)
        .filter_map(|v| v.data_volume.as_ref())
        .any(|dv| vm.spec.data_volume_templates.iter().any(|t| t.name() == dv.name))
}

/// Volumes of the captured VM that are never restored
fn excluded_volumes(content: &VirtualMachineSnapshotContent) -> BTreeSet<String> {
    content
        .snapshot_vm()
        .map(|vm| {
            vm.spec
                .template
                .spec
                .volumes
                .iter()
                .filter(|v| v.memory_dump.is_some())
                .map(|v| v.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Compute the full set of restore records
///
/// Records already present in `existing` are kept unchanged.
pub fn plan_volume_restores(
    restore: &VirtualMachineRestore,
    existing: &[VolumeRestore],
    content: &VirtualMachineSnapshotContent,
) -> Result<Vec<VolumeRestore>> {
    let excluded = excluded_volumes(content);
    let mut records = Vec::with_capacity(content.spec.volume_backups.len());
    for backup in &content.spec.volume_backups {
        if excluded.contains(&backup.volume_name) {
            continue;
        }
        if let Some(record) = existing.iter().find(|r| r.volume_name == backup.volume_name) {
            records.push(record.clone());
            continue;
        }

        let volume_snapshot_name = backup.volume_snapshot_name.clone().ok_or_else(|| {
            Error::internal(format!(
                "VolumeSnapshotName missing for volume {}",
                backup.volume_name
            ))
        })?;
        let from_template = content
            .snapshot_vm()
            .is_some_and(|vm| template_backed(vm, &backup.volume_name));
        let claim = destination_claim(restore, backup);
        records.push(VolumeRestore {
            volume_name: backup.volume_name.clone(),
            // a restored template volume keeps claim and DataVolume names equal
            data_volume_name: from_template.then(|| claim.clone()),
            persistent_volume_claim: claim,
            volume_snapshot_name,
            owned_by_target: restore.volume_ownership_policy() == VolumeOwnershipPolicy::Vm
                && !from_template,
        });
    }
    Ok(records)
}

fn larger_size(requested: Option<&Quantity>, restore_size: Option<&Quantity>) -> Option<Quantity> {
    match (requested, restore_size) {
        (Some(req), Some(hint)) => match (parse_quantity(req), parse_quantity(hint)) {
            (Some(a), Some(b)) if b > a => Some(hint.clone()),
            _ => Some(req.clone()),
        },
        (None, hint) => hint.cloned(),
        (req, None) => req.cloned(),
    }
}

/// Claim restoring one volume from its storage-level snapshot
pub fn restore_claim(
    restore: &VirtualMachineRestore,
    record: &VolumeRestore,
    backup: &VolumeBackup,
    volume_snapshot: &VolumeSnapshot,
    source_vm: &ObjectMeta,
) -> Result<PersistentVolumeClaim> {
    let source = &backup.persistent_volume_claim;

    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    if record.volume_name == BACKEND_STORAGE_VOLUME {
        // relabeled once the target points at it
        labels.remove(PERSISTENT_STATE_LABEL);
    }
    let mut annotations: BTreeMap<String, String> = source
        .metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| !DROPPED_ANNOTATION_PREFIXES.iter().any(|p| k.starts_with(p)))
        .collect();
    if let Some(o) = restore.override_for(&record.volume_name) {
        labels.extend(o.labels.clone());
        annotations.extend(o.annotations.clone());
    }
    labels.insert(
        SOURCE_VM_NAME_LABEL.to_string(),
        source_vm.name.clone().unwrap_or_default(),
    );
    labels.insert(
        SOURCE_VM_NAMESPACE_LABEL.to_string(),
        source_vm.namespace.clone().unwrap_or_default(),
    );
    annotations.insert(RESTORE_NAME_ANNOTATION.to_string(), restore.name_any());

    let mut resources = source.spec.resources.clone().unwrap_or_default();
    let restore_size = volume_snapshot
        .status
        .as_ref()
        .and_then(|s| s.restore_size.as_ref());
    let requests = resources.requests.get_or_insert_with(BTreeMap::new);
    if let Some(size) = larger_size(requests.get(STORAGE), restore_size) {
        requests.insert(STORAGE.to_string(), size);
    }

    let api_group = VolumeSnapshot::group(&()).to_string();
    let kind = VolumeSnapshot::kind(&()).to_string();
    let owner_references = match restore.volume_ownership_policy() {
        VolumeOwnershipPolicy::Vm => Some(vec![controller_owner_ref(restore)?]),
        VolumeOwnershipPolicy::None => None,
    };

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(record.persistent_volume_claim.clone()),
            namespace: restore.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references,
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: source.spec.access_modes.clone(),
            resources: Some(VolumeResourceRequirements {
                limits: resources.limits,
                requests: resources.requests,
            }),
            storage_class_name: source.spec.storage_class_name.clone(),
            volume_mode: source.spec.volume_mode.clone(),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some(api_group.clone()),
                kind: kind.clone(),
                name: record.volume_snapshot_name.clone(),
            }),
            data_source_ref: Some(TypedObjectReference {
                api_group: Some(api_group),
                kind,
                name: record.volume_snapshot_name.clone(),
                namespace: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn claim_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending")
}

/// Persist the restore records, then provision their claims
///
/// Returns `true` while work is outstanding: the record set changed, a claim
/// was created or deleted, or a claim is still waiting to bind.
pub async fn reconcile_volume_restores(
    restore: &VirtualMachineRestore,
    status: &mut VirtualMachineRestoreStatus,
    content: &VirtualMachineSnapshotContent,
    ctx: &Arc<ControllerContext>,
) -> Result<bool> {
    let records = plan_volume_restores(restore, &status.restores, content)?;
    if records != status.restores {
        debug!(volumes = records.len(), "recording volume restores");
        status.restores = records;
        return Ok(true);
    }

    let namespace = restore.namespace().unwrap_or_default();
    let source_vm = content
        .snapshot_vm()
        .map(|vm| vm.metadata.clone())
        .unwrap_or_default();
    let mut created = false;
    let mut waiting = false;

    for record in &status.restores {
        let backup = content
            .spec
            .volume_backups
            .iter()
            .find(|b| b.volume_name == record.volume_name)
            .ok_or_else(|| {
                Error::internal(format!(
                    "volume backup for volume {} not found",
                    record.volume_name
                ))
            })?;
        let claim = record.persistent_volume_claim.as_str();

        let Some(pvc) = ctx.kube.get_pvc(&namespace, claim).await? else {
            let volume_snapshot = ctx
                .kube
                .get_volume_snapshot(&namespace, &record.volume_snapshot_name)
                .await?
                .ok_or_else(|| {
                    Error::internal(format!(
                        "missing volumeSnapshot {}",
                        record.volume_snapshot_name
                    ))
                })?;
            let pvc = restore_claim(restore, record, backup, &volume_snapshot, &source_vm)?;
            ctx.kube.create_pvc(&pvc).await?;
            info!(claim, volume = %record.volume_name, "created restore claim");
            created = true;
            continue;
        };

        if is_deleting(&pvc.metadata) {
            waiting = true;
            continue;
        }

        let restored_here = annotation(&pvc.metadata, RESTORE_NAME_ANNOTATION)
            == Some(restore.name_any().as_str());
        if restore.volume_restore_policy() == VolumeRestorePolicy::InPlace
            && claim == backup.claim_name()
            && !restored_here
        {
            release_original_claim(&pvc, ctx).await?;
            waiting = true;
            continue;
        }

        match claim_phase(&pvc) {
            "Bound" => {}
            "Pending" => {
                if binds_immediately(&pvc, ctx).await? {
                    waiting = true;
                }
            }
            phase => {
                return Err(Error::internal(format!(
                    "PVC {namespace}/{claim} in status {phase:?}"
                )))
            }
        }
    }
    Ok(created || waiting)
}

/// Delete an original claim so it can be re-created from the snapshot
///
/// A DataVolume owning the claim is marked pre-populated first so it does
/// not import into the replacement.
async fn release_original_claim(
    pvc: &PersistentVolumeClaim,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let namespace = pvc.namespace().unwrap_or_default();
    let dv_name = controller_of(&pvc.metadata)
        .filter(|r| r.kind == "DataVolume")
        .map(|r| r.name.clone())
        .unwrap_or_else(|| pvc.name_any());

    if let Some(mut dv) = ctx.kube.get_data_volume(&namespace, &dv_name).await? {
        if set_annotation(&mut dv.metadata, PRE_POPULATED_ANNOTATION, "true") {
            ctx.kube.update_data_volume(&dv).await?;
        }
    }

    info!(claim = %pvc.name_any(), "deleting original claim for in-place restore");
    ctx.kube.delete_pvc(&namespace, &pvc.name_any()).await
}

/// Whether a pending claim is expected to bind without a consumer
async fn binds_immediately(pvc: &PersistentVolumeClaim, ctx: &Arc<ControllerContext>) -> Result<bool> {
    let Some(class_name) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) else {
        return Ok(true);
    };
    let class = ctx
        .kube
        .get_storage_class(class_name)
        .await?
        .ok_or_else(|| Error::internal(format!("StorageClass {class_name} does not exist")))?;
    Ok(class
        .volume_binding_mode
        .as_deref()
        .is_none_or(|mode| mode == "Immediate"))
}

/// Hand restored claims over to the target VM
///
/// Records flagged `owned_by_target` get the VM as controller and lose the
/// flag. Returns whether any record changed.
pub async fn transfer_ownership(
    status: &mut VirtualMachineRestoreStatus,
    vm: &VirtualMachine,
    ctx: &Arc<ControllerContext>,
) -> Result<bool> {
    let namespace = vm.namespace().unwrap_or_default();
    let owner = controller_owner_ref(vm)?;
    let mut changed = false;
    for record in status.restores.iter_mut().filter(|r| r.owned_by_target) {
        if let Some(mut pvc) = ctx
            .kube
            .get_pvc(&namespace, &record.persistent_volume_claim)
            .await?
        {
            if set_controller(&mut pvc.metadata, owner.clone()) {
                ctx.kube.update_pvc(&pvc).await?;
                debug!(claim = %record.persistent_volume_claim, vm = %vm.name_any(), "claim handed to target");
            }
        }
        record.owned_by_target = false;
        changed = true;
    }
    Ok(changed)
}

/// Swap the backend storage claim of the target VM for the restored one
///
/// The superseded claim loses the persistent-state label and is marked for
/// cleanup; the restored claim is labeled for the target.
pub async fn reconcile_backend_storage(
    status: &VirtualMachineRestoreStatus,
    vm: &VirtualMachine,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let Some(record) = status
        .restores
        .iter()
        .find(|r| r.volume_name == BACKEND_STORAGE_VOLUME)
    else {
        return Ok(());
    };
    let namespace = vm.namespace().unwrap_or_default();
    let vm_name = vm.name_any();
    let restored = record.persistent_volume_claim.as_str();

    let selector = format!("{PERSISTENT_STATE_LABEL}={vm_name}");
    for mut pvc in ctx.kube.list_pvcs(&namespace, &selector).await? {
        if pvc.name_any() == restored {
            continue;
        }
        if let Some(labels) = pvc.metadata.labels.as_mut() {
            labels.remove(PERSISTENT_STATE_LABEL);
        }
        set_label(&mut pvc.metadata, BACKEND_CLEANUP_LABEL, "true");
        ctx.kube.update_pvc(&pvc).await?;
        info!(claim = %pvc.name_any(), "marked superseded backend storage for cleanup");
    }

    if let Some(mut pvc) = ctx.kube.get_pvc(&namespace, restored).await? {
        if label(&pvc.metadata, PERSISTENT_STATE_LABEL) != Some(vm_name.as_str()) {
            set_label(&mut pvc.metadata, PERSISTENT_STATE_LABEL, &vm_name);
            ctx.kube.update_pvc(&pvc).await?;
        }
    }
    Ok(())
}
