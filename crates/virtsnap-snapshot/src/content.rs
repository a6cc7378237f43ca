//! VirtualMachineSnapshotContent reconciliation
//!
//! Creates one storage-level snapshot per volume backup, freezing the guest
//! once before the first one is cut and thawing it as soon as every snapshot
//! exists. Readiness and errors are folded into the content status, which
//! the snapshot reconciler copies onto the snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use virtsnap_common::crd::{
    OperationError, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentStatus, VolumeBackup, VolumeSnapshot, VolumeSnapshotSource,
    VolumeSnapshotSpec, VolumeSnapshotState,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{controller_owner_ref, is_deleting, remove_finalizer};
use virtsnap_common::{
    ControllerContext, Error, Result, CONTENT_FINALIZER, SNAPSHOT_SOURCE_NAMESPACE_LABEL,
    SNAPSHOT_SOURCE_NAME_LABEL,
};

use crate::controller::{should_delete_content, terminating};
use crate::source::{resolve_source, SnapshotSource};
use crate::storage::volume_snapshot_class;

/// Reconcile a VirtualMachineSnapshotContent
#[instrument(skip(content, ctx), fields(content = %content.name_any(), namespace = %content.namespace().unwrap_or_default()))]
pub async fn reconcile(
    content: Arc<VirtualMachineSnapshotContent>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let namespace = content.namespace().unwrap_or_default();
    let mut content = (*content).clone();
    let snapshot = match content.spec.virtual_machine_snapshot_name.as_deref() {
        Some(name) => ctx.kube.get_snapshot(&namespace, name).await?,
        None => None,
    };

    let snapshot_terminating = snapshot.as_ref().is_some_and(|s| {
        terminating(s, ctx.settings.default_failure_deadline, Utc::now())
    });
    if snapshot.is_none() || snapshot_terminating {
        unfreeze_source(snapshot.as_ref(), &ctx).await?;
        content = release(content, &ctx).await?;
        if let Some(snapshot) = snapshot.as_ref() {
            if should_delete_content(snapshot, &content) {
                return Ok(Action::await_change());
            }
        }
    }

    if is_deleting(&content.metadata) {
        debug!("content deleting");
        return Ok(Action::requeue(ctx.settings.content_deletion_interval));
    }

    let currently_created = content
        .status
        .as_ref()
        .is_some_and(|s| s.creation_time.is_some());
    let currently_error = content.status.as_ref().is_some_and(|s| s.error.is_some())
        || snapshot.as_ref().is_some_and(|s| s.has_error());
    let snapshot_gone = snapshot
        .as_ref()
        .is_none_or(|s| is_deleting(&s.metadata));

    let mut states = Vec::new();
    let mut deleted = Vec::new();
    let mut skipped = Vec::new();
    let mut froze = false;

    for backup in &content.spec.volume_backups {
        let Some(vs_name) = backup.volume_snapshot_name.as_deref() else {
            continue;
        };

        let volume_snapshot = match ctx.kube.get_volume_snapshot(&namespace, vs_name).await? {
            Some(vs) => vs,
            None if currently_created => {
                warn!(volume_snapshot = %vs_name, "volume snapshot no longer exists");
                ctx.events
                    .publish(
                        &content.object_ref(&()),
                        EventType::Warning,
                        reasons::VOLUME_SNAPSHOT_MISSING,
                        actions::RECONCILE,
                        Some(format!("VolumeSnapshot {vs_name} no longer exists")),
                    )
                    .await;
                deleted.push(vs_name.to_string());
                continue;
            }
            None if snapshot_gone || currently_error => {
                debug!(volume_snapshot = %vs_name, "not creating volume snapshot");
                skipped.push(vs_name.to_string());
                continue;
            }
            None => {
                if !froze {
                    freeze_source(snapshot.as_ref(), &ctx).await?;
                    froze = true;
                }
                create_volume_snapshot(&content, backup, vs_name, &ctx).await?
            }
        };

        states.push(volume_snapshot_state(&volume_snapshot));
    }

    let (created, ready, message) = if !deleted.is_empty() {
        (
            false,
            false,
            Some(format!("VolumeSnapshots ({}) missing", deleted.join(","))),
        )
    } else if !skipped.is_empty() {
        let why = if snapshot_gone {
            "vm snapshot is deleted"
        } else {
            "in error state"
        };
        (
            false,
            false,
            Some(format!(
                "VolumeSnapshots ({}) skipped because {why}",
                skipped.join(",")
            )),
        )
    } else {
        (
            states.iter().all(|s| s.creation_time.is_some()),
            states.iter().all(|s| s.ready_to_use == Some(true)),
            None,
        )
    };

    let current = content.status.clone().unwrap_or_default();
    let mut next = VirtualMachineSnapshotContentStatus {
        creation_time: current.creation_time,
        ready_to_use: Some(ready),
        error: message.map(|m| stable_error(current.error.as_ref(), m)),
        volume_snapshot_status: states,
    };

    if created {
        if next.creation_time.is_none() {
            next.creation_time = Some(Utc::now());
            info!("all volume snapshots created");
        }
        unfreeze_source(snapshot.as_ref(), &ctx).await?;
    }

    if content.status.as_ref() != Some(&next) {
        debug!(ready, "updating content status");
        content.status = Some(next);
        ctx.kube.update_content_status(&content).await?;
    }

    Ok(Action::await_change())
}

/// Keep the original timestamp while the message stays the same
fn stable_error(previous: Option<&OperationError>, message: String) -> OperationError {
    match previous {
        Some(e) if e.message() == message => e.clone(),
        _ => OperationError::new(message),
    }
}

fn volume_snapshot_state(vs: &VolumeSnapshot) -> VolumeSnapshotState {
    let status = vs.status.clone().unwrap_or_default();
    VolumeSnapshotState {
        volume_snapshot_name: vs.name_any(),
        creation_time: status.creation_time,
        ready_to_use: status.ready_to_use,
        restore_size: status.restore_size,
        error: status.error.map(|e| OperationError {
            time: e.time,
            message: e.message,
        }),
    }
}

async fn release(
    mut content: VirtualMachineSnapshotContent,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineSnapshotContent> {
    if remove_finalizer(&mut content.metadata, CONTENT_FINALIZER) {
        debug!("removing content finalizer");
        content = ctx.kube.update_content(&content).await?;
    }
    Ok(content)
}

async fn freeze_source(
    snapshot: Option<&VirtualMachineSnapshot>,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let source = match snapshot {
        Some(snapshot) => resolve_source(snapshot, ctx).await?,
        None => None,
    };
    let Some(source) = source else {
        return Err(Error::internal("unable to get snapshot source"));
    };
    if !source.frozen() {
        source.freeze().await?;
    }
    Ok(())
}

async fn unfreeze_source(
    snapshot: Option<&VirtualMachineSnapshot>,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let Some(snapshot) = snapshot else {
        return Ok(());
    };
    match resolve_source(snapshot, ctx).await? {
        Some(source) => source.unfreeze().await,
        None => Ok(()),
    }
}

async fn create_volume_snapshot(
    content: &VirtualMachineSnapshotContent,
    backup: &VolumeBackup,
    name: &str,
    ctx: &Arc<ControllerContext>,
) -> Result<VolumeSnapshot> {
    let namespace = content.namespace().unwrap_or_default();
    let claim = &backup.persistent_volume_claim;

    let Some(storage_class) = claim.spec.storage_class_name.as_deref() else {
        return Err(Error::validation(format!(
            "{namespace}/{name} VolumeSnapshot requested but no storage class"
        )));
    };
    let Some(class) = volume_snapshot_class(ctx.kube.as_ref(), storage_class).await? else {
        return Err(Error::validation(format!(
            "no VolumeSnapshotClass for {storage_class}"
        )));
    };

    let mut labels = BTreeMap::new();
    if let Some(vm) = content.snapshot_vm() {
        labels.insert(
            SNAPSHOT_SOURCE_NAME_LABEL.to_string(),
            vm.metadata.name.clone().unwrap_or_default(),
        );
        labels.insert(
            SNAPSHOT_SOURCE_NAMESPACE_LABEL.to_string(),
            vm.metadata.namespace.clone().unwrap_or_default(),
        );
    }

    let mut vs = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(backup.claim_name().to_string()),
                ..Default::default()
            },
            volume_snapshot_class_name: Some(class),
        },
    );
    vs.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.clone()),
        labels: Some(labels),
        owner_references: Some(vec![controller_owner_ref(content)?]),
        ..Default::default()
    };

    let vs = match ctx.kube.create_volume_snapshot(&vs).await {
        Ok(created) => created,
        Err(e) if e.is_already_exists() => ctx
            .kube
            .get_volume_snapshot(&namespace, name)
            .await?
            .ok_or(e)?,
        Err(e) => return Err(e),
    };

    info!(volume_snapshot = %name, claim = %backup.claim_name(), "created volume snapshot");
    ctx.events
        .publish(
            &content.object_ref(&()),
            EventType::Normal,
            reasons::VOLUME_SNAPSHOT_CREATED,
            actions::CREATE,
            Some(format!("Successfully created VolumeSnapshot {name}")),
        )
        .await;
    Ok(vs)
}
