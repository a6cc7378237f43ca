//! Restore targets
//!
//! [`RestoreTarget`] is what the restore reconciler drives: readiness, the
//! restore-in-progress marker, and writing the restored object. The only
//! implementation restores onto a VirtualMachine, creating it when missing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use virtsnap_common::crd::{
    ClaimVolumeSource, DataVolume, DataVolumeTemplateSpec, RunStrategy, SnapshotVirtualMachine,
    VirtualMachine, VirtualMachineInstance, VirtualMachineRestore, VirtualMachineRestoreStatus,
    VirtualMachineSnapshotContent, VirtualMachineSpec, VolumeRestore, VIRTUAL_MACHINE_KIND,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{
    annotation, controller_of, controller_owner_ref, is_controlled_by, json_patch,
    resource_version_test, set_annotation, set_controller,
};
use virtsnap_common::{
    ControllerContext, Error, Result, LAST_RESTORE_ANNOTATION, POPULATED_FOR_ANNOTATION,
    PRE_POPULATED_ANNOTATION, RESTORE_NAME_ANNOTATION,
};

use crate::revisions::{claim_revisions, restore_revisions};
use crate::volumes::{reconcile_backend_storage, transfer_ownership};

/// Object a restore writes into
#[async_trait]
pub trait RestoreTarget: Send + Sync {
    /// Whether the target object exists
    fn exists(&self) -> bool;

    /// UID of the existing target
    fn uid(&self) -> Option<&str>;

    /// Whether the target can be restored onto now
    fn ready(&self) -> bool;

    /// Whether this restore already wrote the target
    fn restored(&self) -> bool;

    /// Point the restore's owner reference at the target
    ///
    /// Returns whether `meta` changed.
    fn own(&self, meta: &mut ObjectMeta) -> Result<bool>;

    /// Ask the target to stop
    async fn stop(&self) -> Result<()>;

    /// Set the restore-in-progress marker
    async fn update_restore_in_progress(&mut self) -> Result<()>;

    /// Clear the restore-in-progress marker
    async fn update_done_restore(&mut self) -> Result<()>;

    /// Restore data volumes and write the target
    ///
    /// Returns `true` while the target is still being written.
    async fn reconcile(
        &mut self,
        status: &mut VirtualMachineRestoreStatus,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<bool>;

    /// Hand restored claims to the written target
    async fn adopt_volumes(&mut self, status: &mut VirtualMachineRestoreStatus) -> Result<bool>;
}

/// Resolve the target named by a restore
pub async fn resolve_target(
    restore: &VirtualMachineRestore,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineTarget> {
    let target = &restore.spec.target;
    if target.kind != VIRTUAL_MACHINE_KIND {
        return Err(Error::validation(format!(
            "unknown target {}/{}",
            target.kind, target.name
        )));
    }
    let namespace = restore.namespace().unwrap_or_default();
    let vm = ctx.kube.get_vm(&namespace, &target.name).await?;
    let vmi = ctx.kube.get_vmi(&namespace, &target.name).await?;
    Ok(VirtualMachineTarget {
        vm,
        vmi,
        restore: restore.clone(),
        ctx: ctx.clone(),
    })
}

/// Spec of the restored VM
///
/// Volumes are pointed at their restored claims or DataVolumes, memory dumps
/// are dropped and the VM is halted.
pub fn restored_spec(source: &VirtualMachineSpec, restores: &[VolumeRestore]) -> VirtualMachineSpec {
    let mut spec = source.clone();
    let by_volume: BTreeMap<&str, &VolumeRestore> = restores
        .iter()
        .map(|r| (r.volume_name.as_str(), r))
        .collect();

    let renamed: BTreeMap<String, String> = spec
        .template
        .spec
        .volumes
        .iter()
        .filter_map(|v| {
            let dv = v.data_volume.as_ref()?;
            let new_name = by_volume.get(v.name.as_str())?.data_volume_name.clone()?;
            Some((dv.name.clone(), new_name))
        })
        .collect();
    for template in spec.data_volume_templates.iter_mut() {
        if let Some(new_name) = renamed.get(template.name()) {
            template.metadata.name = Some(new_name.clone());
        }
    }

    spec.template.spec.volumes.retain(|v| v.memory_dump.is_none());
    for volume in spec.template.spec.volumes.iter_mut() {
        let Some(record) = by_volume.get(volume.name.as_str()) else {
            continue;
        };
        if let Some(dv) = volume.data_volume.as_mut() {
            match record.data_volume_name.as_ref() {
                Some(new_name) => dv.name = new_name.clone(),
                None => {
                    volume.data_volume = None;
                    volume.persistent_volume_claim = Some(ClaimVolumeSource {
                        claim_name: record.persistent_volume_claim.clone(),
                        ..Default::default()
                    });
                }
            }
        } else if let Some(claim) = volume.persistent_volume_claim.as_mut() {
            claim.claim_name = record.persistent_volume_claim.clone();
        }
    }

    if spec.running.is_some() {
        spec.running = Some(false);
        spec.run_strategy = None;
    } else {
        spec.run_strategy = Some(RunStrategy::Halted);
    }
    spec
}

/// Apply the restore's raw JSON patches to a generated VM
pub fn apply_patches(vm: VirtualMachine, patches: &[String]) -> Result<VirtualMachine> {
    if patches.is_empty() {
        return Ok(vm);
    }
    let joined = format!("[{}]", patches.join(","));
    let patch: ::json_patch::Patch = serde_json::from_str(&joined)
        .map_err(|e| Error::validation(format!("invalid restore patch: {e}")))?;
    let mut doc = serde_json::to_value(&vm)?;
    ::json_patch::patch(&mut doc, &patch.0)
        .map_err(|e| Error::validation(format!("failed to apply restore patch: {e}")))?;
    Ok(serde_json::from_value(doc)?)
}

/// DataVolumes of `current` whose templates are gone from `restored`
pub fn obsolete_data_volumes(current: &VirtualMachine, restored: &VirtualMachine) -> Vec<String> {
    current
        .spec
        .data_volume_templates
        .iter()
        .map(DataVolumeTemplateSpec::name)
        .filter(|name| {
            !restored
                .spec
                .data_volume_templates
                .iter()
                .any(|t| t.name() == *name)
        })
        .map(str::to_string)
        .collect()
}

/// Restore target backed by a VirtualMachine
pub struct VirtualMachineTarget {
    vm: Option<VirtualMachine>,
    vmi: Option<VirtualMachineInstance>,
    restore: VirtualMachineRestore,
    ctx: Arc<ControllerContext>,
}

impl VirtualMachineTarget {
    /// The target VM, when it exists
    pub fn vm(&self) -> Option<&VirtualMachine> {
        self.vm.as_ref()
    }

    fn namespace(&self) -> String {
        self.restore.namespace().unwrap_or_default()
    }

    fn name(&self) -> &str {
        &self.restore.spec.target.name
    }

    fn restore_id(&self) -> String {
        format!(
            "{}-{}",
            self.restore.name_any(),
            self.restore.metadata.uid.as_deref().unwrap_or_default()
        )
    }

    fn restored_vm(&self, source: &SnapshotVirtualMachine, restores: &[VolumeRestore]) -> VirtualMachine {
        let spec = restored_spec(&source.spec, restores);
        let mut vm = match self.vm.as_ref() {
            Some(existing) => {
                let mut vm = existing.clone();
                vm.spec = spec;
                vm
            }
            None => {
                let mut vm = VirtualMachine::new(self.name(), spec);
                vm.metadata.namespace = Some(self.namespace());
                vm.metadata.labels = source.metadata.labels.clone();
                vm.metadata.annotations = source.metadata.annotations.clone();
                vm
            }
        };
        set_annotation(&mut vm.metadata, LAST_RESTORE_ANNOTATION, &self.restore_id());
        vm
    }

    /// Create the DataVolumes of restored templates, waiting for existing ones
    async fn reconcile_data_volumes(
        &self,
        vm: &VirtualMachine,
        restores: &[VolumeRestore],
    ) -> Result<bool> {
        let namespace = self.namespace();
        let mut waiting = false;
        for record in restores {
            let Some(dv_name) = record.data_volume_name.as_deref() else {
                continue;
            };
            if let Some(dv) = self.ctx.kube.get_data_volume(&namespace, dv_name).await? {
                // an in-place restore finds the original DataVolume still there
                self.prepare_claim(&record.persistent_volume_claim, dv_name, Some(&dv))
                    .await?;
                if !dv.phase().is_settled() {
                    debug!(data_volume = dv_name, phase = ?dv.phase(), "waiting for restored DataVolume");
                    waiting = true;
                }
                continue;
            }
            let Some(template) = vm
                .spec
                .data_volume_templates
                .iter()
                .find(|t| t.name() == dv_name)
            else {
                continue;
            };
            self.prepare_claim(&record.persistent_volume_claim, dv_name, None)
                .await?;
            self.create_data_volume(template).await?;
            waiting = true;
        }
        Ok(waiting)
    }

    /// Mark a restored claim as populated for its DataVolume and drop the
    /// restore's ownership of it
    ///
    /// A DataVolume created here adopts the claim itself. An existing one is
    /// made the claim's controller directly.
    async fn prepare_claim(
        &self,
        claim: &str,
        dv_name: &str,
        existing: Option<&DataVolume>,
    ) -> Result<()> {
        let namespace = self.namespace();
        let pvc = self
            .ctx
            .kube
            .get_pvc(&namespace, claim)
            .await?
            .ok_or_else(|| {
                Error::internal(format!("pvc {namespace}/{claim} does not exist and should"))
            })?;
        let restore_uid = self.restore.metadata.uid.as_deref().unwrap_or_default();

        let mut meta = pvc.metadata.clone();
        set_annotation(&mut meta, POPULATED_FOR_ANNOTATION, dv_name);
        if let Some(refs) = meta.owner_references.as_mut() {
            refs.retain(|r| r.uid != restore_uid);
        }
        if meta.owner_references.as_ref().is_some_and(|refs| refs.is_empty()) {
            meta.owner_references = None;
        }
        if let Some(dv) = existing {
            if controller_of(&meta).is_none() {
                set_controller(&mut meta, controller_owner_ref(dv)?);
            }
        }
        if meta == pvc.metadata {
            return Ok(());
        }

        debug!(claim, data_volume = dv_name, "handing restored claim to its DataVolume");
        self.ctx
            .kube
            .update_pvc(&PersistentVolumeClaim { metadata: meta, ..pvc })
            .await?;
        Ok(())
    }

    async fn create_data_volume(&self, template: &DataVolumeTemplateSpec) -> Result<()> {
        let mut dv = DataVolume::new(template.name(), template.spec.clone());
        dv.metadata.namespace = Some(self.namespace());
        dv.metadata.labels = template.metadata.labels.clone();
        dv.metadata.annotations = template.metadata.annotations.clone();
        set_annotation(&mut dv.metadata, RESTORE_NAME_ANNOTATION, &self.restore.name_any());
        set_annotation(&mut dv.metadata, PRE_POPULATED_ANNOTATION, "true");
        if let Some(vm) = self.vm.as_ref() {
            dv.metadata.owner_references = Some(vec![controller_owner_ref(vm)?]);
        }

        match self.ctx.kube.create_data_volume(&dv).await {
            Ok(_) => {
                info!(data_volume = %template.name(), "created restore DataVolume");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => {
                warn!(data_volume = %template.name(), error = %e, "failed to create restore DataVolume");
                self.ctx
                    .events
                    .publish(
                        &self.restore.object_ref(&()),
                        EventType::Warning,
                        reasons::RESTORE_DATA_VOLUME_CREATE_ERROR,
                        actions::CREATE,
                        Some(format!("Error creating restore DataVolume {}: {e}", template.name())),
                    )
                    .await;
                Err(Error::internal(format!("Failed to create restore DataVolume: {e}")))
            }
        }
    }

    /// Write the restored VM, then take ownership of its revisions
    async fn reconcile_spec(&mut self, mut vm: VirtualMachine) -> Result<()> {
        let exists = self.vm.is_some();
        restore_revisions(
            &mut vm,
            &self.restore.spec.virtual_machine_snapshot_name,
            exists,
            &self.ctx,
        )
        .await?;

        let written = if exists {
            self.ctx.kube.update_vm(&vm).await?
        } else {
            let vm = apply_patches(vm, &self.restore.spec.patches)?;
            self.ctx.kube.create_vm(&vm).await?
        };
        info!(vm = %written.name_any(), created = !exists, "restored target spec");

        claim_revisions(&written, &self.ctx).await?;
        self.vm = Some(written);
        Ok(())
    }
}

#[async_trait]
impl RestoreTarget for VirtualMachineTarget {
    fn exists(&self) -> bool {
        self.vm.is_some()
    }

    fn uid(&self) -> Option<&str> {
        self.vm.as_ref().and_then(|vm| vm.metadata.uid.as_deref())
    }

    fn ready(&self) -> bool {
        self.vm.is_none() || self.vmi.is_none()
    }

    fn restored(&self) -> bool {
        self.vm.as_ref().is_some_and(|vm| {
            annotation(&vm.metadata, LAST_RESTORE_ANNOTATION) == Some(self.restore_id().as_str())
        })
    }

    fn own(&self, meta: &mut ObjectMeta) -> Result<bool> {
        let Some(vm) = self.vm.as_ref() else {
            return Ok(false);
        };
        let owner = controller_owner_ref(vm)?;
        if is_controlled_by(meta, &owner.uid) {
            return Ok(false);
        }
        meta.owner_references = Some(vec![owner]);
        Ok(true)
    }

    async fn stop(&self) -> Result<()> {
        info!(vm = %self.name(), "stopping restore target");
        self.ctx.kube.stop_vm(&self.namespace(), self.name()).await
    }

    async fn update_restore_in_progress(&mut self) -> Result<()> {
        if self.restored() {
            return Ok(());
        }
        let Some(vm) = self.vm.as_ref() else {
            return Ok(());
        };
        let name = self.restore.name_any();
        match vm.restore_in_progress() {
            Some(holder) if holder == name => return Ok(()),
            Some(holder) => {
                return Err(Error::internal(format!("vm restore {holder} in progress")))
            }
            None => {}
        }

        let op = if vm.status.is_some() {
            json!({ "op": "add", "path": "/status/restoreInProgress", "value": name })
        } else {
            json!({ "op": "add", "path": "/status", "value": { "restoreInProgress": name } })
        };
        let patch = json_patch(json!([resource_version_test(&vm.metadata), op]))?;
        let updated = self
            .ctx
            .kube
            .patch_vm_status(&self.namespace(), self.name(), &patch)
            .await?;
        debug!(vm = %self.name(), restore = %name, "marked restore in progress");
        self.vm = Some(updated);
        Ok(())
    }

    async fn update_done_restore(&mut self) -> Result<()> {
        let Some(vm) = self.vm.as_ref() else {
            return Err(Error::internal("At this point target should exist"));
        };
        if vm.restore_in_progress() != Some(self.restore.name_any().as_str()) {
            return Ok(());
        }
        let patch = json_patch(json!([
            resource_version_test(&vm.metadata),
            { "op": "remove", "path": "/status/restoreInProgress" },
        ]))?;
        let updated = self
            .ctx
            .kube
            .patch_vm_status(&self.namespace(), self.name(), &patch)
            .await?;
        debug!(vm = %self.name(), "cleared restore in progress");
        self.vm = Some(updated);
        Ok(())
    }

    async fn reconcile(
        &mut self,
        status: &mut VirtualMachineRestoreStatus,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<bool> {
        if self.restored() {
            return Ok(false);
        }
        let source = content
            .snapshot_vm()
            .ok_or_else(|| Error::internal("unexpected snapshot source"))?;

        let vm = self.restored_vm(source, &status.restores);
        if self.reconcile_data_volumes(&vm, &status.restores).await? {
            return Ok(true);
        }

        if let Some(current) = self.vm.as_ref() {
            let obsolete = obsolete_data_volumes(current, &vm);
            if obsolete != status.deleted_data_volumes {
                status.deleted_data_volumes = obsolete;
                return Ok(true);
            }
        }

        self.reconcile_spec(vm).await?;
        Ok(true)
    }

    async fn adopt_volumes(&mut self, status: &mut VirtualMachineRestoreStatus) -> Result<bool> {
        let Some(vm) = self.vm.as_ref() else {
            return Ok(false);
        };
        let changed = transfer_ownership(status, vm, &self.ctx).await?;
        reconcile_backend_storage(status, vm, &self.ctx).await?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::TypedLocalObjectReference;
    use virtsnap_common::crd::{Volume, VirtualMachineRestoreSpec};
    use virtsnap_common::events::NoopEventPublisher;
    use virtsnap_common::fake::FakeCluster;
    use virtsnap_common::ControllerSettings;

    const NS: &str = "default";

    fn harness() -> (Arc<FakeCluster>, Arc<ControllerContext>) {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = Arc::new(ControllerContext::from_parts(
            cluster.clone(),
            Arc::new(NoopEventPublisher),
            ControllerSettings::default(),
        ));
        (cluster, ctx)
    }

    fn restore(name: &str, target: &str) -> VirtualMachineRestore {
        let mut restore = VirtualMachineRestore::new(
            name,
            VirtualMachineRestoreSpec {
                target: TypedLocalObjectReference {
                    api_group: Some("kubevirt.io".into()),
                    kind: VIRTUAL_MACHINE_KIND.into(),
                    name: target.into(),
                },
                virtual_machine_snapshot_name: "snap".into(),
                ..Default::default()
            },
        );
        restore.metadata.namespace = Some(NS.into());
        restore.metadata.uid = Some(format!("{name}-uid"));
        restore
    }

    fn record(volume: &str, claim: &str, dv: Option<&str>) -> VolumeRestore {
        VolumeRestore {
            volume_name: volume.into(),
            persistent_volume_claim: claim.into(),
            volume_snapshot_name: format!("vs-{volume}"),
            data_volume_name: dv.map(str::to_string),
            owned_by_target: false,
        }
    }

    fn source_spec() -> VirtualMachineSpec {
        let mut spec = VirtualMachineSpec {
            run_strategy: Some(RunStrategy::Always),
            ..Default::default()
        };
        spec.data_volume_templates = vec![DataVolumeTemplateSpec {
            metadata: ObjectMeta {
                name: Some("dv-root".into()),
                ..Default::default()
            },
            ..Default::default()
        }];
        spec.template.spec.volumes = vec![
            Volume::from_data_volume("root", "dv-root"),
            Volume::from_data_volume("imported", "dv-standalone"),
            Volume::from_claim("data", "pvc-data"),
            Volume {
                name: "dump".into(),
                memory_dump: Some(ClaimVolumeSource {
                    claim_name: "pvc-dump".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        spec
    }

    // =========================================================================
    // Restored spec
    // =========================================================================

    #[test]
    fn restored_spec_points_at_restored_volumes() {
        let restores = vec![
            record("root", "restore-x-root", Some("restore-x-root")),
            record("imported", "restore-x-imported", None),
            record("data", "restore-x-data", None),
        ];
        let spec = restored_spec(&source_spec(), &restores);

        assert_eq!(spec.data_volume_templates[0].name(), "restore-x-root");
        let volumes = &spec.template.spec.volumes;
        assert_eq!(volumes.len(), 3, "memory dump dropped");
        assert_eq!(volumes[0].data_volume.as_ref().unwrap().name, "restore-x-root");
        assert!(volumes[1].data_volume.is_none());
        assert_eq!(volumes[1].claim_name(), Some("restore-x-imported"));
        assert_eq!(volumes[2].claim_name(), Some("restore-x-data"));
        assert_eq!(spec.run_strategy, Some(RunStrategy::Halted));
    }

    #[test]
    fn legacy_running_flag_is_turned_off() {
        let mut source = source_spec();
        source.run_strategy = None;
        source.running = Some(true);
        let spec = restored_spec(&source, &[]);
        assert_eq!(spec.running, Some(false));
        assert_eq!(spec.run_strategy, None);
    }

    #[test]
    fn patches_rewrite_the_generated_vm() {
        let vm = VirtualMachine::new("vm-b", source_spec());
        let patched = apply_patches(
            vm,
            &[r#"{"op": "add", "path": "/metadata/labels", "value": {"cloned": "yes"}}"#.to_string()],
        )
        .unwrap();
        assert_eq!(patched.labels()["cloned"], "yes");

        let err = apply_patches(patched, &["{not json".to_string()]).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("validation error:"));
    }

    #[test]
    fn removed_templates_are_obsolete() {
        let current = VirtualMachine::new("vm-a", source_spec());
        let mut restored = current.clone();
        restored.spec.data_volume_templates[0].metadata.name = Some("restore-x-root".into());
        assert_eq!(obsolete_data_volumes(&current, &restored), vec!["dv-root".to_string()]);
        assert!(obsolete_data_volumes(&current, &current).is_empty());
    }

    // =========================================================================
    // Restore marker
    // =========================================================================

    #[tokio::test]
    async fn marker_is_exclusive_and_released_by_its_holder() {
        let (cluster, ctx) = harness();
        let mut vm = VirtualMachine::new("vm-a", source_spec());
        vm.metadata.namespace = Some(NS.into());
        cluster.seed(vm);

        let mut first = resolve_target(&restore("r1", "vm-a"), &ctx).await.unwrap();
        first.update_restore_in_progress().await.unwrap();
        let vm: VirtualMachine = cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), Some("r1"));

        let mut second = resolve_target(&restore("r2", "vm-a"), &ctx).await.unwrap();
        let err = second.update_restore_in_progress().await.unwrap_err();
        assert_eq!(err.to_string(), "vm restore r1 in progress");
        second.update_done_restore().await.unwrap();
        let vm: VirtualMachine = cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), Some("r1"), "only the holder releases");

        first.update_done_restore().await.unwrap();
        let vm: VirtualMachine = cluster.get(NS, "vm-a").unwrap();
        assert_eq!(vm.restore_in_progress(), None);
    }

    #[tokio::test]
    async fn missing_target_is_ready_and_unowned() {
        let (_, ctx) = harness();
        let mut target = resolve_target(&restore("r1", "vm-new"), &ctx).await.unwrap();
        assert!(!target.exists());
        assert!(target.ready());
        let mut meta = ObjectMeta::default();
        assert!(!target.own(&mut meta).unwrap());
        let err = target.update_done_restore().await.unwrap_err();
        assert_eq!(err.to_string(), "At this point target should exist");
    }

    #[tokio::test]
    async fn unknown_target_kind_is_rejected() {
        let (_, ctx) = harness();
        let mut r = restore("r1", "vm-a");
        r.spec.target.kind = "Pod".into();
        let err = resolve_target(&r, &ctx).await.err().unwrap();
        assert!(!err.is_retryable());
    }
}
