//! VirtualMachineClone reconciliation
//!
//! A clone never touches storage itself. It snapshots the source VM (or
//! takes an existing snapshot), restores that snapshot onto a new VM with
//! identity-rewriting patches, and removes its intermediate objects once the
//! restored claims are bound. Each stage persists its phase before the next
//! one starts so an interrupted pass resumes where it stopped.

use std::sync::Arc;

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use virtsnap_common::crd::{
    update_condition, ClonePhase, Condition, ConditionStatus, VirtualMachine,
    VirtualMachineClone, VirtualMachineCloneStatus, VirtualMachineRestore,
    VirtualMachineRestoreSpec, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotSpec, KUBEVIRT_GROUP, VIRTUAL_MACHINE_KIND,
    VIRTUAL_MACHINE_SNAPSHOT_KIND,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{controller_owner_ref, is_deleting};
use virtsnap_common::{ControllerContext, Error, Result};

use crate::fsm::transition;
use crate::patches::clone_patches;

const STILL_PROCESSING: &str = "Still processing";
const CLONE_SUCCEEDED: &str = "Clone succeeded";
const CLONE_FAILED: &str = "Clone failed";

/// Name of the snapshot a clone takes of its source VM
pub fn snapshot_name(clone: &VirtualMachineClone) -> String {
    format!("tmp-snapshot-{}", clone.uid().unwrap_or_default())
}

/// Name of the restore producing the clone's target
pub fn restore_name(clone: &VirtualMachineClone) -> String {
    format!("tmp-restore-{}", clone.uid().unwrap_or_default())
}

/// Target VM name, generated when the clone leaves it empty
pub fn target_name(clone: &VirtualMachineClone) -> String {
    clone
        .spec
        .target
        .as_ref()
        .map(|t| t.name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("clone-{}", clone.uid().unwrap_or_default()))
}

/// Whether the clone snapshots a live VM rather than reusing a snapshot
pub fn clones_vm(clone: &VirtualMachineClone) -> bool {
    clone.spec.source.kind == VIRTUAL_MACHINE_KIND
}

enum Source {
    VirtualMachine(VirtualMachine),
    Snapshot(VirtualMachineSnapshot),
}

/// Reconcile a VirtualMachineClone
#[instrument(skip(clone, ctx), fields(clone = %clone.name_any(), namespace = %clone.namespace().unwrap_or_default(), phase = %clone.phase()))]
pub async fn reconcile(
    clone: Arc<VirtualMachineClone>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    // intermediates go with the clone through their owner references
    if is_deleting(&clone.metadata) {
        return Ok(Action::await_change());
    }

    let mut clone = (*clone).clone();
    match clone.phase() {
        ClonePhase::Failed => return Ok(Action::await_change()),
        ClonePhase::Succeeded => return clean_up(&mut clone, &ctx).await,
        _ => {}
    }

    if clone.phase() == ClonePhase::Unset || snapshot_of(&clone).is_none() {
        if let Some(action) = start(&mut clone, &ctx).await? {
            return Ok(action);
        }
    }

    if matches!(
        clone.phase(),
        ClonePhase::SnapshotInProgress | ClonePhase::RestoreInProgress
    ) {
        if let Some(action) = drive_snapshot_and_restore(&mut clone, &ctx).await? {
            return Ok(action);
        }
    }

    if clone.phase() == ClonePhase::CreatingTargetVM {
        let namespace = clone.namespace().unwrap_or_default();
        let target = clone
            .status
            .as_ref()
            .and_then(|s| s.target_name.clone())
            .unwrap_or_else(|| target_name(&clone));
        if ctx.kube.get_vm(&namespace, &target).await?.is_none() {
            debug!(target = %target, "waiting for target VM");
            return Ok(Action::requeue(ctx.settings.requeue_in_progress));
        }

        publish(
            &clone,
            &ctx,
            EventType::Normal,
            reasons::TARGET_VM_CREATED,
            format!("created target VM {target}"),
        )
        .await;
        advance(&mut clone, &ctx, ClonePhase::Succeeded, |_| {}).await?;
        info!(target = %target, "clone succeeded");
        publish(
            &clone,
            &ctx,
            EventType::Normal,
            reasons::CLONE_SUCCEEDED,
            format!("clone {} succeeded", clone.name_any()),
        )
        .await;
        return clean_up(&mut clone, &ctx).await;
    }

    Ok(Action::await_change())
}

fn snapshot_of(clone: &VirtualMachineClone) -> Option<&str> {
    clone.status.as_ref().and_then(|s| s.snapshot_name.as_deref())
}

fn restore_of(clone: &VirtualMachineClone) -> Option<&str> {
    clone.status.as_ref().and_then(|s| s.restore_name.as_deref())
}

/// Validate the source and pick the snapshot to clone from
///
/// Returns an action when the clone has to wait or failed.
async fn start(
    clone: &mut VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
) -> Result<Option<Action>> {
    let source = match resolve_source(clone, ctx).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            let source = &clone.spec.source;
            publish(
                clone,
                ctx,
                EventType::Normal,
                reasons::SOURCE_DOES_NOT_EXIST,
                format!("source {} {} does not exist", source.kind, source.name),
            )
            .await;
            return Ok(Some(Action::requeue(ctx.settings.requeue_in_progress)));
        }
        Err(e) if !e.is_retryable() => {
            return fail(clone, ctx, None, e.to_string()).await.map(Some)
        }
        Err(e) => return Err(e),
    };

    let snapshot = match source {
        Source::Snapshot(snapshot) => snapshot.name_any(),
        Source::VirtualMachine(vm) => {
            if vm.needs_backend_storage() {
                return fail(
                    clone,
                    ctx,
                    Some(reasons::SOURCE_WITH_BACKEND_STORAGE_INVALID),
                    format!(
                        "source VM {} uses backend storage, which cannot be cloned",
                        vm.name_any()
                    ),
                )
                .await
                .map(Some);
            }
            if let Some(message) = unsnapshottable_volumes(&vm) {
                warn!(%message, "source VM cannot be snapshotted yet");
                publish(
                    clone,
                    ctx,
                    EventType::Warning,
                    reasons::VM_VOLUME_SNAPSHOTS_INVALID,
                    message,
                )
                .await;
                return Ok(Some(Action::requeue(ctx.settings.requeue_in_progress)));
            }
            create_snapshot(clone, &vm, ctx).await?
        }
    };

    advance(clone, ctx, ClonePhase::SnapshotInProgress, |status| {
        status.snapshot_name = Some(snapshot)
    })
    .await?;
    Ok(None)
}

async fn resolve_source(
    clone: &VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
) -> Result<Option<Source>> {
    let namespace = clone.namespace().unwrap_or_default();
    let source = &clone.spec.source;
    match source.kind.as_str() {
        VIRTUAL_MACHINE_KIND => Ok(ctx
            .kube
            .get_vm(&namespace, &source.name)
            .await?
            .map(Source::VirtualMachine)),
        VIRTUAL_MACHINE_SNAPSHOT_KIND => Ok(ctx
            .kube
            .get_snapshot(&namespace, &source.name)
            .await?
            .map(Source::Snapshot)),
        kind => Err(Error::validation(format!(
            "clone source kind {kind} is not supported"
        ))),
    }
}

/// Describe the volumes that keep a VM from being snapshotted, if any
///
/// Volumes without a reported capability count as not yet known.
fn unsnapshottable_volumes(vm: &VirtualMachine) -> Option<String> {
    let statuses = vm
        .status
        .as_ref()
        .map(|s| s.volume_snapshot_statuses.as_slice())
        .unwrap_or_default();

    let mut unknown = Vec::new();
    let mut disabled = Vec::new();
    for volume in vm.volumes() {
        match statuses.iter().find(|s| s.name == volume.name) {
            None => unknown.push(volume.name.as_str()),
            Some(status) if !status.enabled => disabled.push(volume.name.as_str()),
            Some(_) => {}
        }
    }

    if !disabled.is_empty() {
        Some(format!("VM volumes {disabled:?} do not support snapshots"))
    } else if !unknown.is_empty() {
        Some(format!("VM volume snapshot capability not reported yet for {unknown:?}"))
    } else {
        None
    }
}

async fn create_snapshot(
    clone: &VirtualMachineClone,
    vm: &VirtualMachine,
    ctx: &Arc<ControllerContext>,
) -> Result<String> {
    let name = snapshot_name(clone);
    let mut snapshot = VirtualMachineSnapshot::new(
        &name,
        VirtualMachineSnapshotSpec {
            source: TypedLocalObjectReference {
                api_group: Some(KUBEVIRT_GROUP.to_string()),
                kind: VIRTUAL_MACHINE_KIND.to_string(),
                name: vm.name_any(),
            },
            ..Default::default()
        },
    );
    snapshot.metadata.namespace = clone.namespace();
    snapshot.metadata.owner_references = Some(vec![controller_owner_ref(clone)?]);

    match ctx.kube.create_snapshot(&snapshot).await {
        Ok(_) => {
            info!(snapshot = %name, "created clone snapshot");
            publish(
                clone,
                ctx,
                EventType::Normal,
                reasons::SNAPSHOT_CREATED,
                format!("created snapshot {name}"),
            )
            .await;
        }
        Err(e) if e.is_already_exists() => {
            debug!(snapshot = %name, "clone snapshot already exists")
        }
        Err(e) => return Err(e),
    }
    Ok(name)
}

/// Wait for the snapshot, create the restore, then wait for the restore
async fn drive_snapshot_and_restore(
    clone: &mut VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
) -> Result<Option<Action>> {
    let namespace = clone.namespace().unwrap_or_default();
    let name = snapshot_of(clone).unwrap_or_default().to_string();
    let Some(snapshot) = ctx.kube.get_snapshot(&namespace, &name).await? else {
        return fail(
            clone,
            ctx,
            Some(reasons::SNAPSHOT_DELETED),
            format!("snapshot {name} was deleted before the clone finished"),
        )
        .await
        .map(Some);
    };

    if clone.phase() == ClonePhase::SnapshotInProgress {
        if snapshot.is_failed() {
            return fail(clone, ctx, None, format!("snapshot {name} failed"))
                .await
                .map(Some);
        }
        if !snapshot.is_ready() {
            debug!(snapshot = %name, "waiting for snapshot");
            return Ok(Some(Action::requeue(ctx.settings.requeue_in_progress)));
        }
        publish(
            clone,
            ctx,
            EventType::Normal,
            reasons::SNAPSHOT_READY,
            format!("snapshot {name} is ready"),
        )
        .await;
        if let Some(action) = start_restore(clone, &snapshot, ctx).await? {
            return Ok(Some(action));
        }
    }

    let restore_name = restore_of(clone).unwrap_or_default().to_string();
    let Some(restore) = ctx.kube.get_restore(&namespace, &restore_name).await? else {
        return fail(clone, ctx, None, format!("restore {restore_name} does not exist"))
            .await
            .map(Some);
    };
    if restore.is_failed() {
        return fail(clone, ctx, None, format!("restore {restore_name} failed"))
            .await
            .map(Some);
    }
    if !restore.is_complete() {
        debug!(restore = %restore_name, "waiting for restore");
        return Ok(Some(Action::requeue(ctx.settings.requeue_in_progress)));
    }

    publish(
        clone,
        ctx,
        EventType::Normal,
        reasons::RESTORE_READY,
        format!("restore {restore_name} is complete"),
    )
    .await;
    advance(clone, ctx, ClonePhase::CreatingTargetVM, |_| {}).await?;
    Ok(None)
}

/// Create the restore for a ready snapshot
async fn start_restore(
    clone: &mut VirtualMachineClone,
    snapshot: &VirtualMachineSnapshot,
    ctx: &Arc<ControllerContext>,
) -> Result<Option<Action>> {
    let content = snapshot_content(snapshot, ctx).await?;
    if !clones_vm(clone) {
        if let Err(reason) = check_content(&content) {
            return fail(clone, ctx, None, reason).await.map(Some);
        }
    }
    let Some(source_vm) = content.snapshot_vm() else {
        return fail(
            clone,
            ctx,
            None,
            format!("snapshot content {} holds no VM", content.name_any()),
        )
        .await
        .map(Some);
    };
    let patches = match clone_patches(&clone.spec, source_vm) {
        Ok(patches) => patches,
        Err(e) => return fail(clone, ctx, None, e.to_string()).await.map(Some),
    };

    let name = restore_name(clone);
    let target = target_name(clone);
    let mut restore = VirtualMachineRestore::new(
        &name,
        VirtualMachineRestoreSpec {
            target: TypedLocalObjectReference {
                api_group: Some(KUBEVIRT_GROUP.to_string()),
                kind: VIRTUAL_MACHINE_KIND.to_string(),
                name: target.clone(),
            },
            virtual_machine_snapshot_name: snapshot.name_any(),
            patches,
            ..Default::default()
        },
    );
    restore.metadata.namespace = clone.namespace();
    restore.metadata.owner_references = Some(vec![controller_owner_ref(&*clone)?]);

    match ctx.kube.create_restore(&restore).await {
        Ok(_) => {
            info!(restore = %name, target = %target, "created clone restore");
            publish(
                clone,
                ctx,
                EventType::Normal,
                reasons::RESTORE_CREATED,
                format!("created restore {name}"),
            )
            .await;
        }
        Err(e) if e.is_already_exists() => {
            debug!(restore = %name, "clone restore already exists")
        }
        Err(e) => {
            publish(
                clone,
                ctx,
                EventType::Warning,
                reasons::RESTORE_CREATION_FAILED,
                format!("failed to create restore {name}: {e}"),
            )
            .await;
            return Err(e);
        }
    }

    advance(clone, ctx, ClonePhase::RestoreInProgress, |status| {
        status.restore_name = Some(name);
        status.target_name = Some(target);
    })
    .await?;
    Ok(None)
}

async fn snapshot_content(
    snapshot: &VirtualMachineSnapshot,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineSnapshotContent> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let name = snapshot
        .status
        .as_ref()
        .and_then(|s| s.virtual_machine_snapshot_content_name.clone())
        .ok_or_else(|| {
            Error::internal(format!("snapshot {} has no content yet", snapshot.name_any()))
        })?;
    ctx.kube
        .get_content(&namespace, &name)
        .await?
        .ok_or_else(|| {
            Error::internal(format!("snapshot content {namespace}/{name} does not exist"))
        })
}

/// A user-provided snapshot must hold every disk of a VM without backend storage
fn check_content(content: &VirtualMachineSnapshotContent) -> std::result::Result<(), String> {
    let name = content.name_any();
    if content.spec.virtual_machine_snapshot_name.is_none() {
        return Err(format!("snapshot content {name} does not name its snapshot"));
    }
    let Some(vm) = content.snapshot_vm() else {
        return Err(format!("snapshot content {name} holds no VM"));
    };
    if vm.spec.needs_backend_storage() {
        return Err(format!(
            "snapshot content {name} VM uses backend storage, which cannot be cloned"
        ));
    }
    let missing: Vec<&str> = vm
        .spec
        .template
        .spec
        .volumes
        .iter()
        .filter(|v| v.persistent_volume_claim.is_some() || v.data_volume.is_some())
        .filter(|v| !content.spec.volume_backups.iter().any(|b| b.volume_name == v.name))
        .map(|v| v.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("snapshot content {name} misses volumes {missing:?}"));
    }
    Ok(())
}

/// Delete the restore and the clone's own snapshot once every restored claim is bound
async fn clean_up(
    clone: &mut VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
) -> Result<Action> {
    let namespace = clone.namespace().unwrap_or_default();
    let restore = restore_of(clone).map(str::to_string);
    // a snapshot the clone was given belongs to the user
    let snapshot = if clones_vm(clone) {
        snapshot_of(clone).map(str::to_string)
    } else {
        None
    };
    if restore.is_none() && snapshot.is_none() {
        return Ok(Action::await_change());
    }

    if let Some(name) = restore.as_deref() {
        if let Some(existing) = ctx.kube.get_restore(&namespace, name).await? {
            let claims = existing
                .status
                .as_ref()
                .map(|s| s.restores.as_slice())
                .unwrap_or_default();
            for record in claims {
                let claim = &record.persistent_volume_claim;
                let bound = match ctx.kube.get_pvc(&namespace, claim).await? {
                    Some(pvc) => {
                        pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
                    }
                    None => true,
                };
                if !bound {
                    debug!(claim = %claim, "waiting for restored claim to bind");
                    return Ok(Action::requeue(ctx.settings.requeue_in_progress));
                }
            }
            if !claims.is_empty() {
                publish(
                    clone,
                    ctx,
                    EventType::Normal,
                    reasons::PVC_BOUND,
                    "all restored PVCs are bound".to_string(),
                )
                .await;
            }
        }
        info!(restore = %name, "deleting clone restore");
        ctx.kube.delete_restore(&namespace, name).await?;
    }
    if let Some(name) = snapshot.as_deref() {
        info!(snapshot = %name, "deleting clone snapshot");
        ctx.kube.delete_snapshot(&namespace, name).await?;
    }

    let status = clone.status.get_or_insert_with(Default::default);
    status.restore_name = None;
    if snapshot.is_some() {
        status.snapshot_name = None;
    }
    *clone = ctx.kube.update_clone_status(clone).await?;
    Ok(Action::await_change())
}

/// Move to `to`, apply `update` and persist the status
async fn advance(
    clone: &mut VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
    to: ClonePhase,
    update: impl FnOnce(&mut VirtualMachineCloneStatus),
) -> Result<()> {
    let status = clone.status.get_or_insert_with(Default::default);
    update(status);
    transition(status, to)?;
    set_conditions(status, None);
    debug!(phase = %to, "clone phase");
    *clone = ctx.kube.update_clone_status(clone).await?;
    Ok(())
}

fn set_conditions(status: &mut VirtualMachineCloneStatus, failure: Option<&str>) {
    let (progressing, ready, reason) = match status.phase {
        ClonePhase::Succeeded => (ConditionStatus::False, ConditionStatus::True, CLONE_SUCCEEDED),
        ClonePhase::Failed => (ConditionStatus::False, ConditionStatus::False, CLONE_FAILED),
        _ => (ConditionStatus::True, ConditionStatus::False, STILL_PROCESSING),
    };
    update_condition(
        &mut status.conditions,
        Condition::progressing(progressing, reason),
        true,
    );
    update_condition(&mut status.conditions, Condition::ready(ready, reason), true);
    if let Some(failure) = failure {
        update_condition(
            &mut status.conditions,
            Condition::failure(ConditionStatus::True, failure),
            true,
        );
    }
}

/// Fail the clone permanently
async fn fail(
    clone: &mut VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
    reason: Option<&str>,
    message: String,
) -> Result<Action> {
    warn!(%message, "clone failed");
    if let Some(reason) = reason {
        publish(clone, ctx, EventType::Warning, reason, message.clone()).await;
    }
    publish(clone, ctx, EventType::Warning, reasons::CLONE_FAILED, message.clone()).await;

    let status = clone.status.get_or_insert_with(Default::default);
    transition(status, ClonePhase::Failed)?;
    set_conditions(status, Some(&message));
    *clone = ctx.kube.update_clone_status(clone).await?;
    Ok(Action::await_change())
}

async fn publish(
    clone: &VirtualMachineClone,
    ctx: &Arc<ControllerContext>,
    type_: EventType,
    reason: &str,
    message: String,
) {
    ctx.events
        .publish(&clone.object_ref(&()), type_, reason, actions::RECONCILE, Some(message))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use virtsnap_common::crd::{
        ConditionType, Interface, SnapshotVirtualMachine, SourceSpec, Tpm,
        VirtualMachineCloneSpec, VirtualMachineRestoreStatus, VirtualMachineSnapshotContentSpec,
        VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotStatus, VirtualMachineSpec,
        VirtualMachineStatus, Volume, VolumeBackup, VolumeRestore, VolumeSnapshotCapability,
    };
    use virtsnap_common::events::RecordingEventPublisher;
    use virtsnap_common::fake::FakeCluster;
    use virtsnap_common::kube_utils::is_controlled_by;
    use virtsnap_common::ControllerSettings;

    const NS: &str = "default";
    const CLONE_UID: &str = "clone-uid";
    const SNAPSHOT: &str = "tmp-snapshot-clone-uid";
    const RESTORE: &str = "tmp-restore-clone-uid";
    const CONTENT: &str = "vmsnapshot-content-snap";

    // =========================================================================
    // Harness
    // =========================================================================

    struct Harness {
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingEventPublisher>,
        ctx: Arc<ControllerContext>,
    }

    impl Harness {
        fn new() -> Self {
            let cluster = Arc::new(FakeCluster::new());
            let events = Arc::new(RecordingEventPublisher::default());
            let ctx = Arc::new(ControllerContext::from_parts(
                cluster.clone(),
                events.clone(),
                ControllerSettings::default(),
            ));
            Self {
                cluster,
                events,
                ctx,
            }
        }

        async fn pass(&self) -> Result<Action> {
            reconcile(Arc::new(self.clone_obj()), self.ctx.clone()).await
        }

        fn clone_obj(&self) -> VirtualMachineClone {
            self.cluster.get(NS, "testclone").unwrap()
        }

        fn phase(&self) -> ClonePhase {
            self.clone_obj().phase()
        }

        fn status(&self) -> VirtualMachineCloneStatus {
            self.clone_obj().status.unwrap_or_default()
        }

        fn seed_clone(
            &self,
            source: TypedLocalObjectReference,
            configure: impl FnOnce(&mut VirtualMachineClone),
        ) {
            let mut clone = VirtualMachineClone::new(
                "testclone",
                VirtualMachineCloneSpec {
                    source,
                    target: Some(vm_ref("vm-b")),
                    ..Default::default()
                },
            );
            clone.metadata.namespace = Some(NS.into());
            clone.metadata.uid = Some(CLONE_UID.into());
            configure(&mut clone);
            self.cluster.seed(clone);
        }

        fn seed_vm(&self, name: &str, configure: impl FnOnce(&mut VirtualMachine)) {
            let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
            vm.metadata.namespace = Some(NS.into());
            configure(&mut vm);
            self.cluster.seed(vm);
        }

        /// A snapshot named `name` with a content holding `source`
        fn seed_snapshot(
            &self,
            name: &str,
            ready: bool,
            source: SnapshotVirtualMachine,
            backups: Vec<VolumeBackup>,
        ) {
            let mut snap = VirtualMachineSnapshot::new(
                name,
                VirtualMachineSnapshotSpec {
                    source: vm_ref("vm-a"),
                    ..Default::default()
                },
            );
            snap.metadata.namespace = Some(NS.into());
            snap.status = Some(VirtualMachineSnapshotStatus {
                ready_to_use: Some(ready),
                virtual_machine_snapshot_content_name: Some(CONTENT.into()),
                ..Default::default()
            });
            self.cluster.seed(snap);

            let mut content = VirtualMachineSnapshotContent::new(
                CONTENT,
                VirtualMachineSnapshotContentSpec {
                    virtual_machine_snapshot_name: Some(name.into()),
                    source: SourceSpec {
                        virtual_machine: Some(source),
                    },
                    volume_backups: backups,
                },
            );
            content.metadata.namespace = Some(NS.into());
            content.status = Some(VirtualMachineSnapshotContentStatus {
                ready_to_use: Some(ready),
                ..Default::default()
            });
            self.cluster.seed(content);
        }

        fn seed_restore(&self, complete: bool, claims: &[&str]) {
            let mut restore = VirtualMachineRestore::new(
                RESTORE,
                VirtualMachineRestoreSpec {
                    target: vm_ref("vm-b"),
                    virtual_machine_snapshot_name: SNAPSHOT.into(),
                    ..Default::default()
                },
            );
            restore.metadata.namespace = Some(NS.into());
            restore.status = Some(VirtualMachineRestoreStatus {
                complete: Some(complete),
                restores: claims
                    .iter()
                    .map(|claim| VolumeRestore {
                        volume_name: "disk1".into(),
                        persistent_volume_claim: claim.to_string(),
                        volume_snapshot_name: "vs".into(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            });
            self.cluster.seed(restore);
        }

        fn seed_claim(&self, name: &str, phase: &str) {
            self.cluster.seed(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(name.into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                status: Some(PersistentVolumeClaimStatus {
                    phase: Some(phase.into()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        fn gone_or_deleting<K>(&self, name: &str) -> bool
        where
            K: Resource<DynamicType = ()> + serde::de::DeserializeOwned,
        {
            self.cluster
                .get::<K>(NS, name)
                .is_none_or(|obj| is_deleting(obj.meta()))
        }
    }

    fn vm_ref(name: &str) -> TypedLocalObjectReference {
        TypedLocalObjectReference {
            api_group: Some(KUBEVIRT_GROUP.into()),
            kind: VIRTUAL_MACHINE_KIND.into(),
            name: name.into(),
        }
    }

    fn snapshot_ref(name: &str) -> TypedLocalObjectReference {
        TypedLocalObjectReference {
            api_group: Some("snapshot.kubevirt.io".into()),
            kind: VIRTUAL_MACHINE_SNAPSHOT_KIND.into(),
            name: name.into(),
        }
    }

    fn in_phase(
        phase: ClonePhase,
        snapshot: Option<&str>,
        restore: Option<&str>,
    ) -> impl FnOnce(&mut VirtualMachineClone) {
        let snapshot = snapshot.map(str::to_string);
        let restore = restore.map(str::to_string);
        move |clone| {
            clone.status = Some(VirtualMachineCloneStatus {
                phase,
                snapshot_name: snapshot,
                restore_name: restore,
                target_name: Some("vm-b".into()),
                ..Default::default()
            })
        }
    }

    fn source_vm() -> SnapshotVirtualMachine {
        let mut vm = SnapshotVirtualMachine {
            metadata: ObjectMeta {
                name: Some("vm-a".into()),
                namespace: Some(NS.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        vm.spec.template.spec.domain.devices.interfaces = vec![Interface {
            name: "default".into(),
            mac_address: Some("DE-AD-00-00-BE-00".into()),
            ..Default::default()
        }];
        vm.spec.template.spec.volumes = vec![Volume::from_claim("disk1", "pvc-1")];
        vm
    }

    fn backup(volume: &str) -> VolumeBackup {
        VolumeBackup {
            volume_name: volume.into(),
            volume_snapshot_name: Some(format!("vs-{volume}")),
            ..Default::default()
        }
    }

    // =========================================================================
    // Source validation
    // =========================================================================

    #[tokio::test]
    async fn missing_source_vm_waits_in_unset() {
        let h = Harness::new();
        h.seed_clone(vm_ref("vm-a"), |_| {});

        let action = h.pass().await.unwrap();

        assert_eq!(action, Action::requeue(h.ctx.settings.requeue_in_progress));
        assert!(h.events.has_reason(reasons::SOURCE_DOES_NOT_EXIST));
        assert_eq!(h.phase(), ClonePhase::Unset);
    }

    #[tokio::test]
    async fn missing_source_snapshot_waits_in_unset() {
        let h = Harness::new();
        h.seed_clone(snapshot_ref("snap"), |_| {});

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::SOURCE_DOES_NOT_EXIST));
        assert_eq!(h.phase(), ClonePhase::Unset);
    }

    #[tokio::test]
    async fn backend_storage_source_fails() {
        let h = Harness::new();
        h.seed_vm("vm-a", |vm| {
            vm.spec.template.spec.domain.devices.tpm = Some(Tpm {
                persistent: Some(true),
                ..Default::default()
            })
        });
        h.seed_clone(vm_ref("vm-a"), |_| {});

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::SOURCE_WITH_BACKEND_STORAGE_INVALID));
        assert!(h.events.has_reason(reasons::CLONE_FAILED));
        assert_eq!(h.phase(), ClonePhase::Failed);
        let status = h.status();
        let failure = status
            .conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Failure)
            .unwrap();
        assert!(failure.reason.contains("backend storage"));
    }

    #[tokio::test]
    async fn volumes_without_capability_block_the_snapshot() {
        let h = Harness::new();
        h.seed_vm("vm-a", |vm| {
            vm.spec.template.spec.volumes = vec![Volume::from_data_volume("disk0", "testdv")];
        });
        h.seed_clone(vm_ref("vm-a"), |_| {});

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::VM_VOLUME_SNAPSHOTS_INVALID));
        assert_eq!(h.phase(), ClonePhase::Unset);
        assert!(h.cluster.get::<VirtualMachineSnapshot>(NS, SNAPSHOT).is_none());
    }

    #[tokio::test]
    async fn disabled_volumes_are_named() {
        let h = Harness::new();
        h.seed_vm("vm-a", |vm| {
            vm.spec.template.spec.volumes = vec![Volume::from_data_volume("disk0", "testdv")];
            vm.status = Some(VirtualMachineStatus {
                volume_snapshot_statuses: vec![VolumeSnapshotCapability {
                    name: "disk0".into(),
                    enabled: false,
                    reason: None,
                }],
                ..Default::default()
            });
        });
        h.seed_clone(vm_ref("vm-a"), |_| {});

        h.pass().await.unwrap();

        let event = h
            .events
            .events()
            .into_iter()
            .find(|e| e.reason == reasons::VM_VOLUME_SNAPSHOTS_INVALID)
            .unwrap();
        assert!(event.note.unwrap().contains("disk0"));
        assert_eq!(h.phase(), ClonePhase::Unset);
    }

    #[tokio::test]
    async fn unknown_source_kind_fails() {
        let h = Harness::new();
        h.seed_clone(
            TypedLocalObjectReference {
                api_group: None,
                kind: "Pod".into(),
                name: "p".into(),
            },
            |_| {},
        );

        h.pass().await.unwrap();

        assert_eq!(h.phase(), ClonePhase::Failed);
    }

    // =========================================================================
    // Snapshot and restore stages
    // =========================================================================

    #[tokio::test]
    async fn creates_owned_snapshot_of_source_vm() {
        for phase in [ClonePhase::Unset, ClonePhase::SnapshotInProgress] {
            let h = Harness::new();
            h.seed_vm("vm-a", |_| {});
            h.seed_clone(vm_ref("vm-a"), in_phase(phase, None, None));

            h.pass().await.unwrap();

            let snapshot: VirtualMachineSnapshot = h.cluster.get(NS, SNAPSHOT).unwrap();
            assert_eq!(snapshot.spec.source.kind, VIRTUAL_MACHINE_KIND);
            assert_eq!(snapshot.spec.source.name, "vm-a");
            assert!(is_controlled_by(&snapshot.metadata, CLONE_UID));
            assert!(h.events.has_reason(reasons::SNAPSHOT_CREATED));
            assert_eq!(h.phase(), ClonePhase::SnapshotInProgress);
            assert_eq!(h.status().snapshot_name.as_deref(), Some(SNAPSHOT));
        }
    }

    #[tokio::test]
    async fn existing_snapshot_is_adopted_without_event() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_snapshot(SNAPSHOT, false, source_vm(), vec![]);
        h.seed_clone(vm_ref("vm-a"), |_| {});

        h.pass().await.unwrap();

        assert!(!h.events.has_reason(reasons::SNAPSHOT_CREATED));
        assert_eq!(h.phase(), ClonePhase::SnapshotInProgress);
    }

    #[tokio::test]
    async fn unready_snapshot_is_awaited() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_snapshot(SNAPSHOT, false, source_vm(), vec![backup("disk1")]);
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::SnapshotInProgress, Some(SNAPSHOT), None),
        );

        h.pass().await.unwrap();

        assert!(h.events.events().is_empty());
        assert_eq!(h.phase(), ClonePhase::SnapshotInProgress);
        assert!(h.cluster.get::<VirtualMachineRestore>(NS, RESTORE).is_none());
    }

    #[tokio::test]
    async fn ready_snapshot_creates_patched_restore() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_clone(vm_ref("vm-a"), |clone| {
            in_phase(ClonePhase::SnapshotInProgress, Some(SNAPSHOT), None)(clone);
            clone
                .spec
                .new_mac_addresses
                .insert("default".into(), "DE-AD-00-00-BE-01".into());
        });

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::SNAPSHOT_READY));
        assert!(h.events.has_reason(reasons::RESTORE_CREATED));
        assert_eq!(h.phase(), ClonePhase::RestoreInProgress);
        let restore: VirtualMachineRestore = h.cluster.get(NS, RESTORE).unwrap();
        assert_eq!(restore.spec.virtual_machine_snapshot_name, SNAPSHOT);
        assert_eq!(restore.spec.target.name, "vm-b");
        assert!(is_controlled_by(&restore.metadata, CLONE_UID));
        assert_eq!(
            restore.spec.patches,
            vec![
                r#"{"op":"add","path":"/spec/template/spec/domain/devices/interfaces/0/macAddress","value":"DE-AD-00-00-BE-01"}"#
                    .to_string()
            ]
        );
        let status = h.status();
        assert_eq!(status.restore_name.as_deref(), Some(RESTORE));
        assert_eq!(status.target_name.as_deref(), Some("vm-b"));
    }

    #[tokio::test]
    async fn target_name_is_generated_when_unset() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_clone(vm_ref("vm-a"), |clone| {
            in_phase(ClonePhase::SnapshotInProgress, Some(SNAPSHOT), None)(clone);
            clone.spec.target = None;
        });

        h.pass().await.unwrap();

        let restore: VirtualMachineRestore = h.cluster.get(NS, RESTORE).unwrap();
        assert_eq!(restore.spec.target.name, "clone-clone-uid");
        assert_eq!(h.status().target_name.as_deref(), Some("clone-clone-uid"));
    }

    #[tokio::test]
    async fn incomplete_restore_is_awaited() {
        let h = Harness::new();
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_restore(false, &[]);
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::RestoreInProgress, Some(SNAPSHOT), Some(RESTORE)),
        );

        h.pass().await.unwrap();

        assert!(h.events.events().is_empty());
        assert_eq!(h.phase(), ClonePhase::RestoreInProgress);
    }

    #[tokio::test]
    async fn complete_restore_waits_for_target_vm() {
        let h = Harness::new();
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_restore(true, &[]);
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::RestoreInProgress, Some(SNAPSHOT), Some(RESTORE)),
        );

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::RESTORE_READY));
        assert_eq!(h.phase(), ClonePhase::CreatingTargetVM);
    }

    #[tokio::test]
    async fn snapshot_deleted_before_restore_completes_fails() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_restore(false, &[]);
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::RestoreInProgress, Some(SNAPSHOT), Some(RESTORE)),
        );

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::SNAPSHOT_DELETED));
        assert_eq!(h.phase(), ClonePhase::Failed);
    }

    // =========================================================================
    // Completion and clean-up
    // =========================================================================

    #[tokio::test]
    async fn target_vm_completes_clone_and_removes_intermediates() {
        let h = Harness::new();
        h.seed_vm("vm-a", |_| {});
        h.seed_vm("vm-b", |_| {});
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_restore(true, &[]);
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::CreatingTargetVM, Some(SNAPSHOT), Some(RESTORE)),
        );

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::TARGET_VM_CREATED));
        assert!(h.events.has_reason(reasons::CLONE_SUCCEEDED));
        assert_eq!(h.phase(), ClonePhase::Succeeded);
        assert!(h.gone_or_deleting::<VirtualMachineRestore>(RESTORE));
        assert!(h.gone_or_deleting::<VirtualMachineSnapshot>(SNAPSHOT));
        let status = h.status();
        assert_eq!(status.snapshot_name, None);
        assert_eq!(status.restore_name, None);
        assert_eq!(status.target_name.as_deref(), Some("vm-b"));
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Ready)
            .unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn intermediates_stay_until_claims_are_bound() {
        let h = Harness::new();
        h.seed_snapshot(SNAPSHOT, true, source_vm(), vec![backup("disk1")]);
        h.seed_restore(true, &["restore-pvc"]);
        h.seed_claim("restore-pvc", "Pending");
        h.seed_clone(
            vm_ref("vm-a"),
            in_phase(ClonePhase::Succeeded, Some(SNAPSHOT), Some(RESTORE)),
        );

        h.pass().await.unwrap();
        assert!(h.events.events().is_empty());
        assert!(h.cluster.get::<VirtualMachineRestore>(NS, RESTORE).is_some());
        assert!(h.cluster.get::<VirtualMachineSnapshot>(NS, SNAPSHOT).is_some());

        h.cluster
            .modify::<PersistentVolumeClaim>(NS, "restore-pvc", |pvc| {
                pvc.status = Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".into()),
                    ..Default::default()
                })
            });
        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::PVC_BOUND));
        assert!(h.gone_or_deleting::<VirtualMachineRestore>(RESTORE));
        assert!(h.gone_or_deleting::<VirtualMachineSnapshot>(SNAPSHOT));
        assert_eq!(h.phase(), ClonePhase::Succeeded);
    }

    #[tokio::test]
    async fn finished_clone_is_left_alone() {
        let h = Harness::new();
        h.seed_clone(vm_ref("vm-a"), in_phase(ClonePhase::Succeeded, None, None));
        let writes = h.cluster.writes();

        h.pass().await.unwrap();

        assert_eq!(h.cluster.writes(), writes);
        assert!(h.events.events().is_empty());
    }

    // =========================================================================
    // Snapshot source
    // =========================================================================

    #[tokio::test]
    async fn snapshot_source_goes_straight_to_restore() {
        let h = Harness::new();
        h.seed_snapshot("snap", true, source_vm(), vec![backup("disk1")]);
        h.seed_clone(snapshot_ref("snap"), |_| {});

        h.pass().await.unwrap();

        assert!(h.cluster.get::<VirtualMachineSnapshot>(NS, SNAPSHOT).is_none());
        assert_eq!(h.phase(), ClonePhase::RestoreInProgress);
        let restore: VirtualMachineRestore = h.cluster.get(NS, RESTORE).unwrap();
        assert_eq!(restore.spec.virtual_machine_snapshot_name, "snap");
    }

    #[tokio::test]
    async fn snapshot_source_missing_a_volume_fails() {
        let h = Harness::new();
        let mut vm = source_vm();
        vm.spec
            .template
            .spec
            .volumes
            .push(Volume::from_data_volume("vol1", "dv1"));
        h.seed_snapshot("snap", true, vm, vec![backup("disk1")]);
        h.seed_clone(snapshot_ref("snap"), |_| {});

        h.pass().await.unwrap();

        assert!(h.events.has_reason(reasons::CLONE_FAILED));
        assert_eq!(h.phase(), ClonePhase::Failed);
        assert!(h.cluster.get::<VirtualMachineRestore>(NS, RESTORE).is_none());
    }

    #[tokio::test]
    async fn snapshot_source_with_backend_storage_fails() {
        let h = Harness::new();
        let mut vm = source_vm();
        vm.spec.template.spec.domain.devices.tpm = Some(Tpm {
            persistent: Some(true),
            ..Default::default()
        });
        h.seed_snapshot("snap", true, vm, vec![backup("disk1")]);
        h.seed_clone(snapshot_ref("snap"), |_| {});

        h.pass().await.unwrap();

        assert_eq!(h.phase(), ClonePhase::Failed);
    }

    #[tokio::test]
    async fn user_snapshot_survives_clean_up() {
        let h = Harness::new();
        h.seed_snapshot("snap", true, source_vm(), vec![backup("disk1")]);
        h.seed_restore(true, &[]);
        h.seed_clone(
            snapshot_ref("snap"),
            in_phase(ClonePhase::Succeeded, Some("snap"), Some(RESTORE)),
        );

        h.pass().await.unwrap();

        assert!(h.gone_or_deleting::<VirtualMachineRestore>(RESTORE));
        let snapshot: VirtualMachineSnapshot = h.cluster.get(NS, "snap").unwrap();
        assert!(!is_deleting(&snapshot.metadata));
        assert_eq!(h.status().snapshot_name.as_deref(), Some("snap"));
    }
}
