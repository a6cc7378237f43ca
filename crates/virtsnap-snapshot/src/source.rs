//! Source lock and freeze protocol
//!
//! A snapshot locks its source VM by writing its own name into
//! `status.snapshotInProgress` and then adding the content finalizer. The
//! lock counts as held only once both are visible. Unlock removes the
//! finalizer before clearing the token so nobody can acquire the lock while
//! the finalizer is still in place.
//!
//! Every write is a JSON patch guarded by the VM's resource version, so
//! unrelated edits are never overwritten and a racing lock attempt fails with
//! a conflict instead of stealing the token.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use virtsnap_common::crd::{
    DataVolumePhase, RunStrategy, SnapshotVirtualMachine, SourceSpec, VirtualMachine,
    VirtualMachineInstance, VirtualMachineSnapshot, VIRTUAL_MACHINE_KIND,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{
    finalizers_patch, has_finalizer, is_deleting, json_patch, resource_version_test,
};
use virtsnap_common::{
    ControllerContext, Error, Result, BACKEND_STORAGE_VOLUME, CONTENT_FINALIZER,
    PERSISTENT_STATE_LABEL,
};

/// Something a snapshot can be taken of
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// UID of the source object
    fn uid(&self) -> &str;

    /// Whether this snapshot holds the lock
    fn locked(&self) -> bool;

    /// Why the last lock attempt did not succeed, if it was refused
    fn lock_failure(&self) -> Option<&str>;

    /// Try to acquire the lock
    ///
    /// `Ok(false)` means not yet: another operation holds it, a volume is not
    /// ready, or the token write still has to reach the cache.
    async fn lock(&mut self) -> Result<bool>;

    /// Release the lock if this snapshot holds it, returning whether it did
    async fn unlock(&mut self) -> Result<bool>;

    /// Whether the source is running
    fn online(&self) -> bool;

    /// Whether a guest agent is connected
    fn guest_agent(&self) -> bool;

    /// Whether the guest filesystems are frozen
    fn frozen(&self) -> bool;

    /// Freeze the guest filesystems
    async fn freeze(&self) -> Result<()>;

    /// Thaw the guest filesystems
    async fn unfreeze(&self) -> Result<()>;

    /// Captured copy of the source for the content record
    fn spec(&self) -> SourceSpec;

    /// Volume name to claim name for every snapshot-capable volume
    fn persistent_volume_claims(&self) -> BTreeMap<String, String>;
}

/// Resolve the source of a snapshot
///
/// Returns `None` while the source does not exist. Unsupported kinds are a
/// validation error.
pub async fn resolve_source(
    snapshot: &VirtualMachineSnapshot,
    ctx: &Arc<ControllerContext>,
) -> Result<Option<VirtualMachineSource>> {
    let source = &snapshot.spec.source;
    if source.kind != VIRTUAL_MACHINE_KIND {
        return Err(Error::validation(format!(
            "unknown source {}/{}",
            source.kind, source.name
        )));
    }

    let namespace = snapshot.namespace().unwrap_or_default();
    let Some(vm) = ctx.kube.get_vm(&namespace, &source.name).await? else {
        return Ok(None);
    };
    let vmi = ctx.kube.get_vmi(&namespace, &source.name).await?;
    let backend_claim = if vm.needs_backend_storage() {
        backend_storage_claim(ctx, &namespace, &source.name).await?
    } else {
        None
    };
    Ok(Some(VirtualMachineSource {
        vm,
        vmi,
        backend_claim,
        snapshot: snapshot.clone(),
        ctx: ctx.clone(),
        lock_failure: None,
    }))
}

/// Claim holding the persistent TPM or EFI state of a VM
async fn backend_storage_claim(
    ctx: &ControllerContext,
    namespace: &str,
    vm_name: &str,
) -> Result<Option<String>> {
    let selector = format!("{PERSISTENT_STATE_LABEL}={vm_name}");
    let claims = ctx.kube.list_pvcs(namespace, &selector).await?;
    Ok(claims
        .into_iter()
        .filter(|pvc| !is_deleting(&pvc.metadata))
        .map(|pvc| pvc.name_any())
        .min())
}

/// A VirtualMachine as snapshot source
pub struct VirtualMachineSource {
    vm: VirtualMachine,
    vmi: Option<VirtualMachineInstance>,
    backend_claim: Option<String>,
    snapshot: VirtualMachineSnapshot,
    ctx: Arc<ControllerContext>,
    lock_failure: Option<String>,
}

impl VirtualMachineSource {
    fn namespace(&self) -> String {
        self.vm.namespace().unwrap_or_default()
    }

    fn snapshot_name(&self) -> String {
        self.snapshot.name_any()
    }

    fn vm_running(&self) -> bool {
        matches!(
            self.vm.run_strategy(),
            RunStrategy::Always | RunStrategy::RerunOnFailure
        )
    }

    /// Check that every referenced claim exists, is bound and is populated
    async fn verify_volumes(&self) -> Result<Option<String>> {
        let namespace = self.namespace();
        for claim_name in self.claim_names() {
            let Some(pvc) = self.ctx.kube.get_pvc(&namespace, &claim_name).await? else {
                return Ok(Some(format!("PVC {namespace}/{claim_name} does not exist")));
            };
            if !is_bound(&pvc) {
                return Ok(Some(format!("PVC {namespace}/{claim_name} is not bound")));
            }
            if let Some(dv) = self.ctx.kube.get_data_volume(&namespace, &claim_name).await? {
                if dv.phase() != DataVolumePhase::Succeeded {
                    return Ok(Some(format!(
                        "PVC {namespace}/{claim_name} is not populated"
                    )));
                }
            }
        }
        Ok(None)
    }

    async fn pods_using_claims(&self) -> Result<usize> {
        let claims = self.claim_names();
        let pods = self.ctx.kube.list_pods(&self.namespace()).await?;
        Ok(pods
            .iter()
            .filter(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|s| s.volumes.as_ref())
                    .is_some_and(|volumes| {
                        volumes.iter().any(|v| {
                            v.persistent_volume_claim
                                .as_ref()
                                .is_some_and(|c| claims.contains(&c.claim_name))
                        })
                    })
            })
            .count())
    }

    fn claim_names(&self) -> BTreeSet<String> {
        self.persistent_volume_claims().into_values().collect()
    }

    async fn write_token(&mut self) -> Result<()> {
        let name = self.snapshot_name();
        let op = if self.vm.status.is_some() {
            json!({ "op": "add", "path": "/status/snapshotInProgress", "value": name })
        } else {
            json!({ "op": "add", "path": "/status", "value": { "snapshotInProgress": name } })
        };
        let patch = json_patch(json!([resource_version_test(&self.vm.metadata), op]))?;
        self.vm = self
            .ctx
            .kube
            .patch_vm_status(&self.namespace(), &self.vm.name_any(), &patch)
            .await?;
        Ok(())
    }

    async fn write_finalizers(&mut self, finalizers: Vec<String>) -> Result<()> {
        let patch = finalizers_patch(&self.vm.metadata, &finalizers)?;
        self.vm = self
            .ctx
            .kube
            .patch_vm(&self.namespace(), &self.vm.name_any(), &patch)
            .await?;
        Ok(())
    }
}

fn is_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Bound")
}

#[async_trait]
impl SnapshotSource for VirtualMachineSource {
    fn uid(&self) -> &str {
        self.vm.metadata.uid.as_deref().unwrap_or_default()
    }

    fn locked(&self) -> bool {
        self.vm.snapshot_in_progress() == Some(self.snapshot_name().as_str())
            && has_finalizer(&self.vm.metadata, CONTENT_FINALIZER)
    }

    fn lock_failure(&self) -> Option<&str> {
        self.lock_failure.as_deref()
    }

    async fn lock(&mut self) -> Result<bool> {
        if self.locked() {
            return Ok(true);
        }
        self.lock_failure = None;

        if let Some(reason) = self.verify_volumes().await? {
            debug!(vm = %self.vm.name_any(), %reason, "volumes not ready for snapshot");
            self.lock_failure = Some(reason);
            return Ok(false);
        }

        if !self.vm_running() && self.vmi.is_none() {
            let pods = self.pods_using_claims().await?;
            if pods > 0 {
                self.lock_failure = Some(format!(
                    "VM is offline but {pods} pods are using its volumes"
                ));
                return Ok(false);
            }
        }

        let name = self.snapshot_name();
        match self.vm.snapshot_in_progress() {
            Some(holder) if holder != name => {
                debug!(vm = %self.vm.name_any(), holder, "snapshot lock held by another operation");
                self.lock_failure = Some(format!("snapshot {holder} in progress"));
                return Ok(false);
            }
            Some(_) => {}
            None => {
                // the finalizer goes on once the token is visible
                self.write_token().await?;
                return Ok(false);
            }
        }

        if !has_finalizer(&self.vm.metadata, CONTENT_FINALIZER) {
            info!(vm = %self.vm.name_any(), snapshot = %name, "adding snapshot finalizer to source");
            let mut finalizers = self.vm.finalizers().to_vec();
            finalizers.push(CONTENT_FINALIZER.to_string());
            self.write_finalizers(finalizers).await?;
        }
        Ok(true)
    }

    async fn unlock(&mut self) -> Result<bool> {
        if self.vm.snapshot_in_progress() != Some(self.snapshot_name().as_str()) {
            return Ok(false);
        }

        if has_finalizer(&self.vm.metadata, CONTENT_FINALIZER) {
            let finalizers: Vec<String> = self
                .vm
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != CONTENT_FINALIZER)
                .cloned()
                .collect();
            self.write_finalizers(finalizers).await?;
        }

        let patch = json_patch(json!([
            resource_version_test(&self.vm.metadata),
            { "op": "remove", "path": "/status/snapshotInProgress" },
        ]))?;
        self.vm = self
            .ctx
            .kube
            .patch_vm_status(&self.namespace(), &self.vm.name_any(), &patch)
            .await?;
        info!(vm = %self.vm.name_any(), snapshot = %self.snapshot_name(), "source unlocked");
        Ok(true)
    }

    fn online(&self) -> bool {
        self.vm_running() || self.vmi.is_some()
    }

    fn guest_agent(&self) -> bool {
        self.vmi.as_ref().is_some_and(|vmi| vmi.has_guest_agent())
    }

    fn frozen(&self) -> bool {
        self.vmi.as_ref().is_some_and(|vmi| vmi.is_frozen())
    }

    async fn freeze(&self) -> Result<()> {
        if !self.locked() {
            return Err(Error::internal("attempting to freeze unlocked VM"));
        }
        if self.vmi.is_none() {
            return Ok(());
        }
        if !self.guest_agent() {
            self.ctx
                .events
                .publish(
                    &self.snapshot.object_ref(&()),
                    EventType::Warning,
                    reasons::FREEZE_SKIPPED,
                    actions::FREEZE,
                    Some(
                        "No guest agent, snapshot is crash consistent, not filesystem consistent"
                            .to_string(),
                    ),
                )
                .await;
            return Ok(());
        }

        info!(vm = %self.vm.name_any(), "freezing guest filesystems");
        self.ctx
            .kube
            .freeze_vmi(
                &self.namespace(),
                &self.vm.name_any(),
                self.ctx.settings.freeze_timeout,
            )
            .await
    }

    async fn unfreeze(&self) -> Result<()> {
        if !self.locked() || !self.frozen() {
            return Ok(());
        }
        info!(vm = %self.vm.name_any(), "thawing guest filesystems");
        self.ctx
            .kube
            .unfreeze_vmi(&self.namespace(), &self.vm.name_any())
            .await
    }

    fn spec(&self) -> SourceSpec {
        let meta = &self.vm.metadata;
        SourceSpec {
            virtual_machine: Some(SnapshotVirtualMachine {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: meta.name.clone(),
                    namespace: meta.namespace.clone(),
                    uid: meta.uid.clone(),
                    labels: meta.labels.clone(),
                    annotations: meta.annotations.clone(),
                    ..Default::default()
                },
                spec: self.vm.spec.clone(),
            }),
        }
    }

    fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
        let mut claims: BTreeMap<String, String> = self
            .vm
            .volumes()
            .iter()
            .filter_map(|v| v.claim_name().map(|c| (v.name.clone(), c.to_string())))
            .collect();
        if let Some(backend) = &self.backend_claim {
            claims.insert(BACKEND_STORAGE_VOLUME.to_string(), backend.clone());
        }
        claims
    }
}
