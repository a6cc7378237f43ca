//! VirtualMachineRestore reconciliation
//!
//! A restore advances one stage per pass and persists its status between
//! stages: claim the target, wait for it to be ready, plan and provision the
//! restored claims, write the target, then hand the claims over and
//! complete. Anything unexpected is reported on the status and retried.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use virtsnap_common::crd::{
    update_condition, Condition, ConditionStatus, TargetReadinessPolicy, VirtualMachineRestore,
    VirtualMachineRestoreStatus, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{
    add_finalizer, format_duration, has_finalizer, is_deleting, remove_finalizer,
};
use virtsnap_common::{ControllerContext, Error, Result, RESTORE_FINALIZER};

use crate::target::{resolve_target, RestoreTarget};
use crate::volumes::reconcile_volume_restores;

const OPERATION_FAILED: &str = "Operation failed";
const OPERATION_COMPLETE: &str = "Operation complete";

/// Reconcile a VirtualMachineRestore
#[instrument(skip(restore, ctx), fields(restore = %restore.name_any(), namespace = %restore.namespace().unwrap_or_default()))]
pub async fn reconcile(
    restore: Arc<VirtualMachineRestore>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    if restore.status.is_none() {
        debug!("initializing status");
        let mut initialized = (*restore).clone();
        initialized.status = Some(VirtualMachineRestoreStatus {
            complete: Some(false),
            conditions: vec![
                Condition::progressing(ConditionStatus::True, "Initializing VirtualMachineRestore"),
                Condition::ready(ConditionStatus::False, "Initializing VirtualMachineRestore"),
            ],
            ..Default::default()
        });
        ctx.kube.update_restore_status(&initialized).await?;
        return Ok(Action::await_change());
    }

    if is_deleting(&restore.metadata) {
        return handle_deletion(&restore, &ctx).await;
    }
    if !restore.is_progressing() {
        return Ok(Action::await_change());
    }

    let mut target = match resolve_target(&restore, &ctx).await {
        Ok(target) => target,
        Err(e) if !e.is_retryable() => return fail(&restore, &ctx, e.to_string()).await,
        Err(e) => return Err(e),
    };

    let mut restore = (*restore).clone();
    let mut changed = false;
    if restore
        .metadata
        .owner_references
        .as_ref()
        .is_none_or(|refs| refs.is_empty())
    {
        changed |= target.own(&mut restore.metadata)?;
    }
    changed |= add_finalizer(&mut restore.metadata, RESTORE_FINALIZER);
    if changed {
        restore = ctx.kube.update_restore(&restore).await?;
    }

    if !target.ready() {
        return target_not_ready(&restore, &target, &ctx).await;
    }

    let snapshot = match source_snapshot(&restore, &ctx).await {
        Ok(snapshot) => snapshot,
        Err(e) => return update_error(&restore, &ctx, e).await,
    };

    if target.exists() && !target.restored() {
        let source_uid = snapshot.status.as_ref().and_then(|s| s.source_uid.as_deref());
        if source_uid.is_some_and(|uid| target.uid() != Some(uid)) {
            return fail(
                &restore,
                &ctx,
                "restore source and restore target are different but restore target already exists"
                    .to_string(),
            )
            .await;
        }
    }

    target.update_restore_in_progress().await?;

    let content = match snapshot_content(&snapshot, &ctx).await {
        Ok(content) => content,
        Err(e) => return update_error(&restore, &ctx, e).await,
    };

    let mut status = restore.status.clone().unwrap_or_default();
    match reconcile_volume_restores(&restore, &mut status, &content, &ctx).await {
        Ok(true) => {
            return in_progress(&restore, status, "Creating new PVCs", "Waiting for new PVCs", &ctx)
                .await
        }
        Ok(false) => {}
        Err(e) => return update_error(&restore, &ctx, e).await,
    }

    match target.reconcile(&mut status, &content).await {
        Ok(true) => {
            return in_progress(
                &restore,
                status,
                "Updating target spec",
                "Waiting for target update",
                &ctx,
            )
            .await
        }
        Ok(false) => {}
        Err(e) => return update_error(&restore, &ctx, e).await,
    }

    target.adopt_volumes(&mut status).await?;
    delete_obsolete_data_volumes(&restore, &status, &ctx).await?;
    target.update_done_restore().await?;

    info!("restore complete");
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Normal,
            reasons::RESTORE_COMPLETE,
            actions::RECONCILE,
            Some(format!(
                "Successfully completed VirtualMachineRestore {}",
                restore.name_any()
            )),
        )
        .await;

    status.complete = Some(true);
    status.restore_time = Some(Utc::now());
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::False, OPERATION_COMPLETE),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::True, OPERATION_COMPLETE),
        true,
    );
    write_status(&restore, status, &ctx).await?;
    Ok(Action::await_change())
}

/// Release the target, then drop the finalizer
async fn handle_deletion(
    restore: &VirtualMachineRestore,
    ctx: &Arc<ControllerContext>,
) -> Result<Action> {
    if !has_finalizer(&restore.metadata, RESTORE_FINALIZER) {
        return Ok(Action::await_change());
    }

    match resolve_target(restore, ctx).await {
        Ok(mut target) if target.exists() => target.update_done_restore().await?,
        Ok(_) => {}
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => debug!(error = %e, "target cannot be resolved, nothing to release"),
    }

    let mut status = restore.status.clone().unwrap_or_default();
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::False, "VM restore is deleting"),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::False, "VM restore is deleting"),
        true,
    );
    let mut current = write_status(restore, status, ctx).await?;

    // status first: dropping the last finalizer may remove the object
    if remove_finalizer(&mut current.metadata, RESTORE_FINALIZER) {
        info!("removing restore finalizer");
        ctx.kube.update_restore(&current).await?;
    }
    Ok(Action::await_change())
}

/// Apply the readiness policy to a target that still runs
async fn target_not_ready(
    restore: &VirtualMachineRestore,
    target: &impl RestoreTarget,
    ctx: &Arc<ControllerContext>,
) -> Result<Action> {
    debug!(policy = ?restore.readiness_policy(), "restore target not ready");
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Normal,
            reasons::RESTORE_TARGET_NOT_READY,
            actions::RECONCILE,
            Some("Restore target VMI still exists".to_string()),
        )
        .await;

    let mut status = restore.status.clone().unwrap_or_default();
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::False, "Waiting for target to be ready"),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::False, "Waiting for target to be ready"),
        true,
    );

    let mut requeue = ctx.settings.requeue_in_progress;
    let mut failure = None;
    match restore.readiness_policy() {
        TargetReadinessPolicy::WaitEventually => {}
        TargetReadinessPolicy::StopTarget => {
            if let Err(e) = target.stop().await {
                return update_error(restore, ctx, e).await;
            }
        }
        TargetReadinessPolicy::WaitGracePeriodAndFail => {
            let grace = ctx.settings.default_grace_period;
            let created = restore
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now);
            let elapsed = (Utc::now() - created).to_std().unwrap_or_default();
            match grace.checked_sub(elapsed) {
                Some(left) if !left.is_zero() => requeue = left,
                _ => {
                    failure = Some(format!(
                        "Restore target failed to be ready within {}",
                        format_duration(grace)
                    ))
                }
            }
        }
        TargetReadinessPolicy::FailImmediate => {
            failure = Some("Restore target not ready".to_string());
        }
    }

    if let Some(reason) = failure.as_ref() {
        warn!(%reason, "restore failed");
        mark_failed(&mut status, reason);
    }
    write_status(restore, status, ctx).await?;
    if failure.is_some() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(requeue))
    }
}

async fn source_snapshot(
    restore: &VirtualMachineRestore,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineSnapshot> {
    let namespace = restore.namespace().unwrap_or_default();
    let name = &restore.spec.virtual_machine_snapshot_name;
    let snapshot = ctx
        .kube
        .get_snapshot(&namespace, name)
        .await?
        .ok_or_else(|| Error::internal(format!("VMSnapshot {namespace}/{name} does not exist")))?;
    if snapshot.is_failed() {
        return Err(Error::internal(format!(
            "VMSnapshot {namespace}/{name} failed and is invalid to use"
        )));
    }
    if !snapshot.is_ready() {
        return Err(Error::internal(format!("VMSnapshot {namespace}/{name} not ready")));
    }
    Ok(snapshot)
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
            Error::internal(format!(
                "no snapshot content name in {namespace}/{}",
                snapshot.name_any()
            ))
        })?;
    let content = ctx
        .kube
        .get_content(&namespace, &name)
        .await?
        .ok_or_else(|| {
            Error::internal(format!("VMSnapshotContent {namespace}/{name} does not exist"))
        })?;
    if !content.is_ready() {
        return Err(Error::internal(format!("VMSnapshotContent {namespace}/{name} not ready")));
    }
    Ok(content)
}

/// Delete DataVolumes whose templates the restore removed from the target
async fn delete_obsolete_data_volumes(
    restore: &VirtualMachineRestore,
    status: &VirtualMachineRestoreStatus,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let namespace = restore.namespace().unwrap_or_default();
    for name in &status.deleted_data_volumes {
        if ctx.kube.get_data_volume(&namespace, name).await?.is_some() {
            info!(data_volume = %name, "deleting DataVolume dropped by restore");
            ctx.kube.delete_data_volume(&namespace, name).await?;
        }
    }
    Ok(())
}

fn mark_failed(status: &mut VirtualMachineRestoreStatus, reason: &str) {
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::False, OPERATION_FAILED),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::failure(ConditionStatus::True, reason),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::False, OPERATION_FAILED),
        true,
    );
}

/// Fail the restore permanently
async fn fail(
    restore: &VirtualMachineRestore,
    ctx: &Arc<ControllerContext>,
    reason: String,
) -> Result<Action> {
    warn!(%reason, "restore failed");
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Warning,
            reasons::RESTORE_ERROR,
            actions::RECONCILE,
            Some(format!("VirtualMachineRestore encountered error {reason}")),
        )
        .await;
    let mut status = restore.status.clone().unwrap_or_default();
    mark_failed(&mut status, &reason);
    write_status(restore, status, ctx).await?;
    Ok(Action::await_change())
}

/// Report an error on the status and hand it back for retry
async fn update_error(
    restore: &VirtualMachineRestore,
    ctx: &Arc<ControllerContext>,
    error: Error,
) -> Result<Action> {
    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Warning,
            reasons::RESTORE_ERROR,
            actions::RECONCILE,
            Some(format!("VirtualMachineRestore encountered error {error}")),
        )
        .await;
    let mut status = restore.status.clone().unwrap_or_default();
    let reason = error.to_string();
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::False, reason.as_str()),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::False, reason.as_str()),
        true,
    );
    write_status(restore, status, ctx).await?;
    Err(error)
}

async fn in_progress(
    restore: &VirtualMachineRestore,
    mut status: VirtualMachineRestoreStatus,
    progressing: &str,
    ready: &str,
    ctx: &Arc<ControllerContext>,
) -> Result<Action> {
    update_condition(
        &mut status.conditions,
        Condition::progressing(ConditionStatus::True, progressing),
        true,
    );
    update_condition(
        &mut status.conditions,
        Condition::ready(ConditionStatus::False, ready),
        true,
    );
    write_status(restore, status, ctx).await?;
    Ok(Action::requeue(ctx.settings.requeue_in_progress))
}

/// Write `status` if it differs from the stored one
async fn write_status(
    restore: &VirtualMachineRestore,
    status: VirtualMachineRestoreStatus,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineRestore> {
    if restore.status.as_ref() == Some(&status) {
        return Ok(restore.clone());
    }
    let mut updated = restore.clone();
    updated.status = Some(status);
    ctx.kube.update_restore_status(&updated).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        TypedLocalObjectReference,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use virtsnap_common::crd::{
        DataVolume, DataVolumePhase, DataVolumeStatus, DataVolumeTemplateSpec,
        PersistentVolumeClaimTemplate, RunStrategy, SnapshotVirtualMachine, SourceSpec,
        VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceSpec,
        VirtualMachineRestoreSpec, VirtualMachineSnapshotContentSpec,
        VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotSpec,
        VirtualMachineSnapshotStatus, VirtualMachineSpec, Volume, VolumeBackup,
        VolumeRestorePolicy, VolumeSnapshot, VIRTUAL_MACHINE_KIND,
    };
    use virtsnap_common::events::RecordingEventPublisher;
    use virtsnap_common::fake::FakeCluster;
    use virtsnap_common::kube_utils::{annotation, controller_owner_ref, is_controlled_by};
    use virtsnap_common::{
        ControllerSettings, LAST_RESTORE_ANNOTATION, POPULATED_FOR_ANNOTATION,
        PRE_POPULATED_ANNOTATION, RESTORE_NAME_ANNOTATION,
    };

    const NS: &str = "default";
    const CONTENT: &str = "vmsnapshot-content-snap-uid";

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
            reconcile(Arc::new(self.restore()), self.ctx.clone()).await
        }

        fn restore(&self) -> VirtualMachineRestore {
            self.cluster.get(NS, "r1").unwrap()
        }

        fn bind(&self, claim: &str) {
            self.cluster
                .modify::<PersistentVolumeClaim>(NS, claim, |pvc| {
                    pvc.status = Some(PersistentVolumeClaimStatus {
                        phase: Some("Bound".into()),
                        ..Default::default()
                    })
                });
        }

        fn progressing_reason(&self) -> String {
            self.restore()
                .status
                .unwrap()
                .conditions
                .into_iter()
                .find(|c| c.type_ == virtsnap_common::crd::ConditionType::Progressing)
                .map(|c| c.reason)
                .unwrap_or_default()
        }

        /// Source VM `vm-a` with one claim, and a ready snapshot of it
        fn seed_snapshot(&self, source: SnapshotVirtualMachine, backups: Vec<VolumeBackup>) -> String {
            let mut vm = VirtualMachine::new("vm-a", source.spec.clone());
            vm.metadata.namespace = Some(NS.into());
            let vm = self.cluster.seed(vm);
            let vm_uid = vm.metadata.uid.clone().unwrap();

            let mut snap = VirtualMachineSnapshot::new(
                "snap",
                VirtualMachineSnapshotSpec {
                    source: TypedLocalObjectReference {
                        api_group: Some("kubevirt.io".into()),
                        kind: VIRTUAL_MACHINE_KIND.into(),
                        name: "vm-a".into(),
                    },
                    ..Default::default()
                },
            );
            snap.metadata.namespace = Some(NS.into());
            snap.status = Some(VirtualMachineSnapshotStatus {
                ready_to_use: Some(true),
                source_uid: Some(vm_uid.clone()),
                virtual_machine_snapshot_content_name: Some(CONTENT.into()),
                ..Default::default()
            });
            self.cluster.seed(snap);

            for backup in &backups {
                let name = backup.volume_snapshot_name.clone().unwrap();
                let mut vs = VolumeSnapshot::new(&name, Default::default());
                vs.metadata.namespace = Some(NS.into());
                self.cluster.seed(vs);
            }

            let mut content = VirtualMachineSnapshotContent::new(
                CONTENT,
                VirtualMachineSnapshotContentSpec {
                    virtual_machine_snapshot_name: Some("snap".into()),
                    source: SourceSpec {
                        virtual_machine: Some(source),
                    },
                    volume_backups: backups,
                },
            );
            content.metadata.namespace = Some(NS.into());
            content.status = Some(VirtualMachineSnapshotContentStatus {
                ready_to_use: Some(true),
                ..Default::default()
            });
            self.cluster.seed(content);
            vm_uid
        }

        fn seed_restore(&self, target: &str, configure: impl FnOnce(&mut VirtualMachineRestoreSpec)) {
            let mut spec = VirtualMachineRestoreSpec {
                target: TypedLocalObjectReference {
                    api_group: Some("kubevirt.io".into()),
                    kind: VIRTUAL_MACHINE_KIND.into(),
                    name: target.into(),
                },
                virtual_machine_snapshot_name: "snap".into(),
                ..Default::default()
            };
            configure(&mut spec);
            let mut restore = VirtualMachineRestore::new("r1", spec);
            restore.metadata.namespace = Some(NS.into());
            restore.metadata.uid = Some("r1-uid".into());
            self.cluster.seed(restore);
        }
    }

    fn claim_source_vm() -> SnapshotVirtualMachine {
        let mut vm = SnapshotVirtualMachine {
            metadata: ObjectMeta {
                name: Some("vm-a".into()),
                namespace: Some(NS.into()),
                labels: Some([("app".to_string(), "db".to_string())].into()),
                ..Default::default()
            },
            spec: VirtualMachineSpec {
                run_strategy: Some(RunStrategy::Always),
                ..Default::default()
            },
        };
        vm.spec.template.spec.volumes = vec![Volume::from_claim("disk1", "pvc-1")];
        vm
    }

    fn backup(volume: &str, claim: &str) -> VolumeBackup {
        VolumeBackup {
            volume_name: volume.into(),
            persistent_volume_claim: PersistentVolumeClaimTemplate {
                metadata: ObjectMeta {
                    name: Some(claim.into()),
                    namespace: Some(NS.into()),
                    ..Default::default()
                },
                spec: PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".into()]),
                    ..Default::default()
                },
            },
            volume_snapshot_name: Some(format!("vmsnapshot-snap-uid-volume-{volume}")),
        }
    }

    fn seed_claim(cluster: &FakeCluster, name: &str) {
        cluster.seed(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NS.into()),
                ..Default::default()
            },
            spec: Some(Default::default()),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        });
    }

    fn seed_vmi(cluster: &FakeCluster, name: &str) {
        let mut vmi = VirtualMachineInstance::new(name, VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some(NS.into());
        cluster.seed(vmi);
    }

    // =========================================================================
    // Full restores
    // =========================================================================

    #[tokio::test]
    async fn initializes_status() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        h.seed_restore("vm-a", |_| {});

        h.pass().await.unwrap();

        let restore = h.restore();
        assert_eq!(restore.status.as_ref().unwrap().complete, Some(false));
        assert_eq!(h.progressing_reason(), "Initializing VirtualMachineRestore");
        assert!(restore.is_progressing());
    }

    #[tokio::test]
    async fn in_place_restore_recreates_the_original_claim() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_claim(&h.cluster, "pvc-1");
        h.seed_restore("vm-a", |spec| {
            spec.volume_restore_policy = Some(VolumeRestorePolicy::InPlace)
        });

        h.pass().await.unwrap();
        h.pass().await.unwrap();
        let restore = h.restore();
        assert!(has_finalizer(&restore.metadata, RESTORE_FINALIZER));
        let records = &restore.status.as_ref().unwrap().restores;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].persistent_volume_claim, "pvc-1");
        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), Some("r1"));

        // original claim goes away first
        h.pass().await.unwrap();
        assert!(h.cluster.get::<PersistentVolumeClaim>(NS, "pvc-1").is_none());

        h.pass().await.unwrap();
        let pvc: PersistentVolumeClaim = h.cluster.get(NS, "pvc-1").unwrap();
        assert_eq!(annotation(&pvc.metadata, RESTORE_NAME_ANNOTATION), Some("r1"));
        assert_eq!(
            pvc.spec.as_ref().unwrap().data_source.as_ref().unwrap().name,
            "vmsnapshot-snap-uid-volume-disk1"
        );

        // unbound claim holds the restore back
        h.pass().await.unwrap();
        assert_eq!(h.progressing_reason(), "Creating new PVCs");
        h.bind("pvc-1");

        h.pass().await.unwrap();
        assert_eq!(h.progressing_reason(), "Updating target spec");
        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();
        assert_eq!(
            annotation(&vm.metadata, LAST_RESTORE_ANNOTATION),
            Some("r1-r1-uid")
        );
        assert_eq!(vm.spec.run_strategy, Some(RunStrategy::Halted));

        let action = h.pass().await.unwrap();
        assert_eq!(action, Action::await_change());
        let restore = h.restore();
        assert!(restore.is_complete());
        assert!(restore.status.as_ref().unwrap().restore_time.is_some());
        assert!(!restore.status.as_ref().unwrap().restores[0].owned_by_target);
        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), None);
        let pvc: PersistentVolumeClaim = h.cluster.get(NS, "pvc-1").unwrap();
        assert!(is_controlled_by(&pvc.metadata, vm.metadata.uid.as_deref().unwrap()));
        assert!(h.events.has_reason(reasons::RESTORE_COMPLETE));

        let writes = h.cluster.writes();
        h.pass().await.unwrap();
        assert_eq!(h.cluster.writes(), writes, "completed restore is left alone");
    }

    #[tokio::test]
    async fn restore_to_new_vm_uses_generated_claim_names() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_claim(&h.cluster, "pvc-1");
        h.seed_restore("vm-b", |_| {});

        for _ in 0..3 {
            h.pass().await.unwrap();
        }
        let claim = "restore-r1-uid-disk1";
        assert!(h.cluster.get::<PersistentVolumeClaim>(NS, "pvc-1").is_some());
        h.bind(claim);

        h.pass().await.unwrap();
        let vm: VirtualMachine = h.cluster.get(NS, "vm-b").unwrap();
        assert_eq!(vm.volumes()[0].claim_name(), Some(claim));
        assert_eq!(vm.labels()["app"], "db");
        assert_eq!(vm.spec.run_strategy, Some(RunStrategy::Halted));

        h.pass().await.unwrap();
        let restore = h.restore();
        assert!(restore.is_complete());
        assert!(is_controlled_by(
            &restore.metadata,
            vm.metadata.uid.as_deref().unwrap()
        ));
        let pvc: PersistentVolumeClaim = h.cluster.get(NS, claim).unwrap();
        assert!(is_controlled_by(&pvc.metadata, vm.metadata.uid.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn template_volumes_come_back_as_prepopulated_data_volumes() {
        let h = Harness::new();
        let mut source = claim_source_vm();
        source.spec.data_volume_templates = vec![DataVolumeTemplateSpec {
            metadata: ObjectMeta {
                name: Some("dv-root".into()),
                ..Default::default()
            },
            ..Default::default()
        }];
        source.spec.template.spec.volumes = vec![Volume::from_data_volume("root", "dv-root")];
        h.seed_snapshot(source, vec![backup("root", "dv-root")]);
        h.seed_restore("vm-b", |_| {});

        for _ in 0..3 {
            h.pass().await.unwrap();
        }
        let name = "restore-r1-uid-root";
        h.bind(name);

        h.pass().await.unwrap();
        assert_eq!(h.progressing_reason(), "Updating target spec");
        let dv: DataVolume = h.cluster.get(NS, name).unwrap();
        assert_eq!(annotation(&dv.metadata, PRE_POPULATED_ANNOTATION), Some("true"));
        assert_eq!(annotation(&dv.metadata, RESTORE_NAME_ANNOTATION), Some("r1"));
        let pvc: PersistentVolumeClaim = h.cluster.get(NS, name).unwrap();
        assert_eq!(annotation(&pvc.metadata, POPULATED_FOR_ANNOTATION), Some(name));
        assert!(pvc.metadata.owner_references.is_none());

        // importing DataVolume holds the target back
        h.pass().await.unwrap();
        assert!(h.cluster.get::<VirtualMachine>(NS, "vm-b").is_none());
        h.cluster.modify::<DataVolume>(NS, name, |dv| {
            dv.status = Some(DataVolumeStatus {
                phase: DataVolumePhase::Succeeded,
                ..Default::default()
            })
        });

        h.pass().await.unwrap();
        let vm: VirtualMachine = h.cluster.get(NS, "vm-b").unwrap();
        assert_eq!(vm.spec.data_volume_templates[0].name(), name);
        assert_eq!(vm.volumes()[0].data_volume.as_ref().unwrap().name, name);

        h.pass().await.unwrap();
        assert!(h.restore().is_complete());
    }

    #[tokio::test]
    async fn in_place_template_restore_leaves_the_disk_with_its_data_volume() {
        let h = Harness::new();
        let mut source = claim_source_vm();
        source.spec.data_volume_templates = vec![DataVolumeTemplateSpec {
            metadata: ObjectMeta {
                name: Some("dv-root".into()),
                ..Default::default()
            },
            ..Default::default()
        }];
        source.spec.template.spec.volumes = vec![Volume::from_data_volume("root", "dv-root")];
        h.seed_snapshot(source, vec![backup("root", "dv-root")]);
        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();

        let mut dv = DataVolume::new("dv-root", Default::default());
        dv.metadata.namespace = Some(NS.into());
        dv.metadata.owner_references = Some(vec![controller_owner_ref(&vm).unwrap()]);
        dv.status = Some(DataVolumeStatus {
            phase: DataVolumePhase::Succeeded,
            ..Default::default()
        });
        let dv = h.cluster.seed(dv);
        seed_claim(&h.cluster, "dv-root");
        h.cluster.modify::<PersistentVolumeClaim>(NS, "dv-root", |pvc| {
            pvc.metadata.owner_references = Some(vec![controller_owner_ref(&dv).unwrap()]);
        });
        h.seed_restore("vm-a", |spec| {
            spec.volume_restore_policy = Some(VolumeRestorePolicy::InPlace)
        });

        for _ in 0..10 {
            if h.restore().is_complete() {
                break;
            }
            h.pass().await.unwrap();
            let restored = h
                .cluster
                .get::<PersistentVolumeClaim>(NS, "dv-root")
                .is_some_and(|pvc| annotation(&pvc.metadata, RESTORE_NAME_ANNOTATION).is_some());
            if restored {
                h.bind("dv-root");
            }
        }
        assert!(h.restore().is_complete());

        let dv: DataVolume = h.cluster.get(NS, "dv-root").unwrap();
        assert_eq!(annotation(&dv.metadata, PRE_POPULATED_ANNOTATION), Some("true"));
        assert!(is_controlled_by(&dv.metadata, vm.metadata.uid.as_deref().unwrap()));
        let pvc: PersistentVolumeClaim = h.cluster.get(NS, "dv-root").unwrap();
        assert_eq!(annotation(&pvc.metadata, RESTORE_NAME_ANNOTATION), Some("r1"));
        assert_eq!(annotation(&pvc.metadata, POPULATED_FOR_ANNOTATION), Some("dv-root"));
        assert!(is_controlled_by(&pvc.metadata, dv.metadata.uid.as_deref().unwrap()));

        h.cluster.modify::<VirtualMachineRestore>(NS, "r1", |r| {
            r.metadata.deletion_timestamp = Some(Time(Utc::now()));
        });
        h.pass().await.unwrap();
        assert!(h.cluster.get::<VirtualMachineRestore>(NS, "r1").is_none());

        let pvc: PersistentVolumeClaim = h.cluster.get(NS, "dv-root").unwrap();
        let owners = pvc.metadata.owner_references.unwrap_or_default();
        assert!(
            owners.iter().all(|o| o.uid != "r1-uid"),
            "restored disk must not be collected with the restore"
        );
        assert!(h.cluster.get::<DataVolume>(NS, "dv-root").is_some());
    }

    // =========================================================================
    // Refusals and failures
    // =========================================================================

    #[tokio::test]
    async fn unrelated_existing_target_is_refused() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        let mut other = VirtualMachine::new("vm-other", VirtualMachineSpec::default());
        other.metadata.namespace = Some(NS.into());
        h.cluster.seed(other);
        h.seed_restore("vm-other", |_| {});

        h.pass().await.unwrap();
        let action = h.pass().await.unwrap();

        assert_eq!(action, Action::await_change());
        let restore = h.restore();
        assert!(restore.is_failed());
        assert!(h.cluster.list::<PersistentVolumeClaim>().is_empty());
        assert!(h.events.has_reason(reasons::RESTORE_ERROR));
        let vm: VirtualMachine = h.cluster.get(NS, "vm-other").unwrap();
        assert_eq!(vm.restore_in_progress(), None);
    }

    #[tokio::test]
    async fn running_target_fails_after_grace_period() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_vmi(&h.cluster, "vm-a");
        h.seed_restore("vm-a", |_| {});
        h.cluster.modify::<VirtualMachineRestore>(NS, "r1", |r| {
            r.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::minutes(10)));
        });

        h.pass().await.unwrap();
        h.pass().await.unwrap();

        let restore = h.restore();
        assert!(restore.is_failed());
        let failure = restore
            .status
            .unwrap()
            .conditions
            .into_iter()
            .find(|c| c.type_ == virtsnap_common::crd::ConditionType::Failure)
            .unwrap();
        assert_eq!(failure.reason, "Restore target failed to be ready within 300s");
        assert!(h.cluster.calls().is_empty());
        assert!(h.events.has_reason(reasons::RESTORE_TARGET_NOT_READY));
    }

    #[tokio::test]
    async fn running_target_within_grace_period_is_polled() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_vmi(&h.cluster, "vm-a");
        h.seed_restore("vm-a", |_| {});

        h.pass().await.unwrap();
        let action = h.pass().await.unwrap();

        assert_ne!(action, Action::await_change());
        assert!(!h.restore().is_failed());
        assert_eq!(h.progressing_reason(), "Waiting for target to be ready");
    }

    #[tokio::test]
    async fn stop_target_policy_stops_the_vm() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_claim(&h.cluster, "pvc-1");
        seed_vmi(&h.cluster, "vm-a");
        h.seed_restore("vm-a", |spec| {
            spec.target_readiness_policy = Some(TargetReadinessPolicy::StopTarget)
        });

        h.pass().await.unwrap();
        h.pass().await.unwrap();
        assert_eq!(h.cluster.calls(), vec!["stop default/vm-a".to_string()]);

        h.pass().await.unwrap();
        assert_eq!(h.progressing_reason(), "Creating new PVCs");
    }

    #[tokio::test]
    async fn fail_immediate_policy_fails_right_away() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_vmi(&h.cluster, "vm-a");
        h.seed_restore("vm-a", |spec| {
            spec.target_readiness_policy = Some(TargetReadinessPolicy::FailImmediate)
        });

        h.pass().await.unwrap();
        h.pass().await.unwrap();
        assert!(h.restore().is_failed());
    }

    #[tokio::test]
    async fn missing_snapshot_is_reported_and_retried() {
        let h = Harness::new();
        h.seed_restore("vm-b", |spec| spec.virtual_machine_snapshot_name = "gone".into());

        h.pass().await.unwrap();
        let err = h.pass().await.unwrap_err();

        assert_eq!(err.to_string(), "VMSnapshot default/gone does not exist");
        assert!(err.is_retryable());
        assert_eq!(h.progressing_reason(), "VMSnapshot default/gone does not exist");
        assert!(h.events.has_reason(reasons::RESTORE_ERROR));
    }

    #[tokio::test]
    async fn invalid_patch_fails_validation() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        h.seed_restore("vm-b", |spec| spec.patches = vec!["{not json".into()]);

        for _ in 0..3 {
            h.pass().await.unwrap();
        }
        h.bind("restore-r1-uid-disk1");

        let err = h.pass().await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(h.progressing_reason().starts_with("validation error:"));
        assert!(h.cluster.get::<VirtualMachine>(NS, "vm-b").is_none());
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    #[tokio::test]
    async fn deletion_releases_target_then_finalizer() {
        let h = Harness::new();
        h.seed_snapshot(claim_source_vm(), vec![backup("disk1", "pvc-1")]);
        seed_claim(&h.cluster, "pvc-1");
        h.seed_restore("vm-a", |_| {});
        h.pass().await.unwrap();
        h.pass().await.unwrap();
        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), Some("r1"));

        h.cluster.modify::<VirtualMachineRestore>(NS, "r1", |r| {
            r.metadata.deletion_timestamp = Some(Time(Utc::now()));
        });
        h.pass().await.unwrap();

        let vm: VirtualMachine = h.cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), None);
        assert!(h.cluster.get::<VirtualMachineRestore>(NS, "r1").is_none());
    }

    // =========================================================================
    // Interactions
    // =========================================================================

    fn mock_ctx(kube: virtsnap_common::client::MockVirtClient) -> Arc<ControllerContext> {
        Arc::new(ControllerContext::from_parts(
            Arc::new(kube),
            Arc::new(RecordingEventPublisher::default()),
            ControllerSettings::default(),
        ))
    }

    fn bare_restore() -> VirtualMachineRestore {
        let mut restore = VirtualMachineRestore::new(
            "r1",
            VirtualMachineRestoreSpec {
                target: TypedLocalObjectReference {
                    api_group: Some("kubevirt.io".into()),
                    kind: VIRTUAL_MACHINE_KIND.into(),
                    name: "vm-a".into(),
                },
                virtual_machine_snapshot_name: "snap".into(),
                ..Default::default()
            },
        );
        restore.metadata.namespace = Some(NS.into());
        restore
    }

    #[tokio::test]
    async fn completed_restore_never_touches_the_cluster() {
        // no expectations: any call panics
        let ctx = mock_ctx(virtsnap_common::client::MockVirtClient::new());
        let mut restore = bare_restore();
        restore.status = Some(VirtualMachineRestoreStatus {
            complete: Some(true),
            ..Default::default()
        });

        let action = reconcile(Arc::new(restore), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn first_pass_only_writes_status() {
        let mut kube = virtsnap_common::client::MockVirtClient::new();
        kube.expect_update_restore_status()
            .times(1)
            .withf(|r| r.status.as_ref().is_some_and(|s| s.complete == Some(false)))
            .returning(|r| Ok(r.clone()));
        let ctx = mock_ctx(kube);

        let action = reconcile(Arc::new(bare_restore()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
