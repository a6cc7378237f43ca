//! VirtualMachineSnapshot reconciliation
//!
//! Every pass starts from the stored snapshot and recomputes everything:
//! lock the source, create the content once locked, release the lock when
//! finished, delete the content when the snapshot goes away, then derive the
//! new status and write it only when it changed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use virtsnap_common::crd::{
    update_condition, Condition, ConditionStatus, DeletionPolicy, Indication, SnapshotPhase,
    SnapshotVolumesLists, SourceSpec, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentSpec, VirtualMachineSnapshotStatus, VolumeBackup,
    PersistentVolumeClaimTemplate,
};
use virtsnap_common::events::{actions, reasons};
use virtsnap_common::kube_utils::{
    add_finalizer, controller_owner_ref, is_deleting, remove_finalizer,
};
use virtsnap_common::{ControllerContext, Result, CONTENT_FINALIZER, SNAPSHOT_FINALIZER};

use crate::source::{resolve_source, SnapshotSource, VirtualMachineSource};
use crate::storage::snapshot_claim;

const DEADLINE_EXCEEDED: &str = "snapshot deadline exceeded";

/// Name of the content record of a snapshot
pub fn content_name(snapshot: &VirtualMachineSnapshot) -> String {
    snapshot
        .status
        .as_ref()
        .and_then(|s| s.virtual_machine_snapshot_content_name.clone())
        .unwrap_or_else(|| {
            format!(
                "vmsnapshot-content-{}",
                snapshot.metadata.uid.as_deref().unwrap_or_default()
            )
        })
}

/// Name of the storage-level snapshot of one volume
pub fn volume_snapshot_name(snapshot_uid: &str, volume_name: &str) -> String {
    format!("vmsnapshot-{snapshot_uid}-volume-{volume_name}")
}

/// Content is removed when the policy says so or when it never became ready
pub fn should_delete_content(
    snapshot: &VirtualMachineSnapshot,
    content: &VirtualMachineSnapshotContent,
) -> bool {
    snapshot.deletion_policy() == DeletionPolicy::Delete || !content.is_ready()
}

fn content_deleted_if_needed(
    snapshot: &VirtualMachineSnapshot,
    content: Option<&VirtualMachineSnapshotContent>,
) -> bool {
    content.is_none_or(|c| !should_delete_content(snapshot, c))
}

/// Time left before the failure deadline, `None` without a deadline
pub fn time_until_deadline(
    snapshot: &VirtualMachineSnapshot,
    default_deadline: Duration,
    now: DateTime<Utc>,
) -> Option<chrono::Duration> {
    let deadline = snapshot.failure_deadline(default_deadline)?;
    let created = snapshot.metadata.creation_timestamp.as_ref()?.0;
    let deadline = chrono::Duration::from_std(deadline).ok()?;
    Some(created + deadline - now)
}

/// Failed already, or still in progress past the deadline
pub fn deadline_exceeded(
    snapshot: &VirtualMachineSnapshot,
    default_deadline: Duration,
    now: DateTime<Utc>,
) -> bool {
    if snapshot.is_failed() {
        return true;
    }
    if snapshot.status.as_ref().map(|s| s.phase) != Some(SnapshotPhase::InProgress) {
        return false;
    }
    time_until_deadline(snapshot, default_deadline, now).is_some_and(|left| left < chrono::Duration::zero())
}

/// Deleted, or past its deadline
pub fn terminating(
    snapshot: &VirtualMachineSnapshot,
    default_deadline: Duration,
    now: DateTime<Utc>,
) -> bool {
    is_deleting(&snapshot.metadata) || deadline_exceeded(snapshot, default_deadline, now)
}

fn can_unlock_source(
    snapshot: &VirtualMachineSnapshot,
    content: Option<&VirtualMachineSnapshotContent>,
    terminating: bool,
) -> bool {
    !snapshot.is_progressing() || (terminating && content_deleted_if_needed(snapshot, content))
}

/// Reconcile a VirtualMachineSnapshot
#[instrument(skip(snapshot, ctx), fields(snapshot = %snapshot.name_any(), namespace = %snapshot.namespace().unwrap_or_default()))]
pub async fn reconcile(
    snapshot: Arc<VirtualMachineSnapshot>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let namespace = snapshot.namespace().unwrap_or_default();

    if snapshot.status.is_none() {
        debug!("initializing status");
        let mut initialized = (*snapshot).clone();
        initialized.status = Some(VirtualMachineSnapshotStatus {
            ready_to_use: Some(false),
            conditions: vec![
                Condition::progressing(ConditionStatus::True, "Operation in progress"),
                Condition::ready(ConditionStatus::False, "Not ready"),
            ],
            ..Default::default()
        });
        ctx.kube.update_snapshot_status(&initialized).await?;
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    let default_deadline = ctx.settings.default_failure_deadline;
    let is_terminating = terminating(&snapshot, default_deadline, now);

    let mut source = resolve_source(&snapshot, &ctx).await?;
    let content = ctx
        .kube
        .get_content(&namespace, &content_name(&snapshot))
        .await?;

    let mut retry = None;
    if let Some(source) = source.as_mut() {
        if snapshot.is_progressing() && !is_terminating {
            if !source.locked() {
                let locked = source.lock().await?;
                debug!(locked, "attempted to lock source");
                retry = Some(ctx.settings.snapshot_retry_interval);
            } else {
                let content = match content.as_ref() {
                    Some(c) => c.clone(),
                    None => create_content(&snapshot, source, &ctx).await?,
                };
                duplicate_revisions(&snapshot, source, &content, &ctx).await?;
            }
        } else if can_unlock_source(&snapshot, content.as_ref(), is_terminating) {
            source.unlock().await?;
        }
    }

    if let Some(content) = content.as_ref().filter(|_| is_terminating) {
        if should_delete_content(&snapshot, content) {
            if !is_deleting(&content.metadata) {
                info!(content = %content.name_any(), "deleting snapshot content");
                ctx.kube
                    .delete_content(&namespace, &content.name_any())
                    .await?;
            }
        } else {
            debug!(content = %content.name_any(), "retaining ready snapshot content");
        }
    }

    update_status(&snapshot, source.as_ref(), &ctx, now).await?;

    if let Some(interval) = retry {
        return Ok(Action::requeue(interval));
    }
    match time_until_deadline(&snapshot, default_deadline, now) {
        Some(left) if snapshot.is_progressing() && left > chrono::Duration::zero() => {
            Ok(Action::requeue(left.to_std().unwrap_or(Duration::ZERO)))
        }
        _ => Ok(Action::await_change()),
    }
}

/// What the status computation needs to know about the source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceObservation {
    /// Source UID
    pub uid: String,
    /// Whether this snapshot holds the lock
    pub locked: bool,
    /// Why locking was refused this pass
    pub lock_failure: Option<String>,
    /// Whether the source is running
    pub online: bool,
    /// Whether a guest agent is connected
    pub guest_agent: bool,
}

impl SourceObservation {
    fn of(source: &impl SnapshotSource) -> Self {
        Self {
            uid: source.uid().to_string(),
            locked: source.locked(),
            lock_failure: source.lock_failure().map(str::to_string),
            online: source.online(),
            guest_agent: source.guest_agent(),
        }
    }
}

async fn update_status(
    snapshot: &VirtualMachineSnapshot,
    source: Option<&VirtualMachineSource>,
    ctx: &Arc<ControllerContext>,
    now: DateTime<Utc>,
) -> Result<()> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let content = ctx
        .kube
        .get_content(&namespace, &content_name(snapshot))
        .await?;
    let observation = source.map(SourceObservation::of);

    let next = compute_status(
        snapshot,
        observation.as_ref(),
        content.as_ref(),
        ctx.settings.default_failure_deadline,
        now,
    );

    let mut current = snapshot.clone();
    if next != snapshot.status_or_default() {
        if next.phase == SnapshotPhase::Failed && !snapshot.is_failed() {
            warn!("snapshot failed: deadline exceeded");
            ctx.events
                .publish(
                    &snapshot.object_ref(&()),
                    EventType::Warning,
                    reasons::SNAPSHOT_DEADLINE_EXCEEDED,
                    actions::RECONCILE,
                    Some(DEADLINE_EXCEEDED.to_string()),
                )
                .await;
        }
        debug!(phase = ?next.phase, "updating snapshot status");
        current.status = Some(next);
        current = ctx.kube.update_snapshot_status(&current).await?;
    }

    // status first: dropping the last finalizer may remove the object
    let mut changed = false;
    if is_deleting(&current.metadata) {
        if !snapshot.is_progressing() || content_deleted_if_needed(snapshot, content.as_ref()) {
            changed = remove_finalizer(&mut current.metadata, SNAPSHOT_FINALIZER);
        }
    } else {
        changed = add_finalizer(&mut current.metadata, SNAPSHOT_FINALIZER);
    }
    if changed {
        ctx.kube.update_snapshot(&current).await?;
    }
    Ok(())
}

/// Derive the next status of a snapshot
///
/// Precedence: deadline exceeded, still progressing (deleting while
/// progressing), error, ready, unknown.
pub fn compute_status(
    snapshot: &VirtualMachineSnapshot,
    source: Option<&SourceObservation>,
    content: Option<&VirtualMachineSnapshotContent>,
    default_deadline: Duration,
    now: DateTime<Utc>,
) -> VirtualMachineSnapshotStatus {
    let mut status = snapshot.status_or_default();
    if status.ready_to_use.is_none() {
        status.ready_to_use = Some(false);
    }
    if let Some(source) = source {
        status.source_uid = Some(source.uid.clone());
    }

    let deleting = is_deleting(&snapshot.metadata);
    if !deleting {
        if let Some((content, content_status)) =
            content.and_then(|c| c.status.as_ref().map(|s| (c, s)))
        {
            status.virtual_machine_snapshot_content_name = Some(content.name_any());
            status.creation_time = content_status.creation_time;
            status.ready_to_use = content_status.ready_to_use;
            status.error = content_status.error.clone();
        }
    }

    let mut view = snapshot.clone();
    view.status = Some(status.clone());

    let (progressing, ready, failure) = if deadline_exceeded(&view, default_deadline, now) {
        status.phase = SnapshotPhase::Failed;
        (
            Condition::progressing(ConditionStatus::False, DEADLINE_EXCEEDED),
            None,
            Some(Condition::failure(ConditionStatus::True, DEADLINE_EXCEEDED)),
        )
    } else if view.is_progressing() {
        status.phase = SnapshotPhase::InProgress;
        let mut progressing = match source {
            Some(source) => {
                status.indications = indications(source);
                if source.locked {
                    Condition::progressing(
                        ConditionStatus::True,
                        "Source locked and operation in progress",
                    )
                } else {
                    let reason = match source.lock_failure.as_deref() {
                        Some(why) => format!("Source not locked: {why}"),
                        None => "Source not locked".to_string(),
                    };
                    Condition::progressing(ConditionStatus::False, reason)
                }
            }
            None => Condition::progressing(ConditionStatus::False, "Source does not exist"),
        };
        let mut ready = Condition::ready(ConditionStatus::False, "Not ready");
        if deleting {
            status.phase = SnapshotPhase::Deleting;
            progressing = Condition::progressing(ConditionStatus::False, "VM snapshot is deleting");
            ready = Condition::ready(ConditionStatus::False, "VM snapshot is deleting");
        }
        (progressing, Some(ready), None)
    } else if view.has_error() {
        (
            Condition::progressing(ConditionStatus::False, "In error state"),
            Some(Condition::ready(ConditionStatus::False, "Error")),
            None,
        )
    } else if view.is_ready() {
        status.phase = SnapshotPhase::Succeeded;
        if let Some(lists) = content.and_then(volume_lists) {
            status.snapshot_volumes = Some(lists);
        }
        (
            Condition::progressing(ConditionStatus::False, "Operation complete"),
            Some(Condition::ready(ConditionStatus::True, "Operation complete")),
            None,
        )
    } else {
        status.phase = SnapshotPhase::Unknown;
        (
            Condition::progressing(ConditionStatus::Unknown, "Unknown state"),
            Some(Condition::ready(ConditionStatus::Unknown, "Unknown state")),
            None,
        )
    };

    update_condition(&mut status.conditions, progressing, true);
    if let Some(ready) = ready {
        update_condition(&mut status.conditions, ready, true);
    }
    if let Some(failure) = failure {
        update_condition(&mut status.conditions, failure, true);
    }
    status
}

fn indications(source: &SourceObservation) -> Vec<Indication> {
    if !source.online {
        return Vec::new();
    }
    let agent = if source.guest_agent {
        Indication::GuestAgent
    } else {
        Indication::NoGuestAgent
    };
    vec![Indication::Online, agent]
}

fn volume_lists(content: &VirtualMachineSnapshotContent) -> Option<SnapshotVolumesLists> {
    let vm = content.snapshot_vm()?;
    let (included, excluded) = vm
        .spec
        .template
        .spec
        .volumes
        .iter()
        .map(|v| v.name.clone())
        .partition(|name| {
            content
                .spec
                .volume_backups
                .iter()
                .any(|b| &b.volume_name == name)
        });
    Some(SnapshotVolumesLists { included, excluded })
}

/// Name of the duplicate of a controller revision for this snapshot
pub fn snapshot_revision_name(revision: &str, vm_name: &str, snapshot_name: &str) -> String {
    if revision.contains(vm_name) {
        revision.replacen(vm_name, snapshot_name, 1)
    } else {
        format!("{snapshot_name}-{revision}")
    }
}

async fn create_content(
    snapshot: &VirtualMachineSnapshot,
    source: &VirtualMachineSource,
    ctx: &Arc<ControllerContext>,
) -> Result<VirtualMachineSnapshotContent> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let uid = snapshot.metadata.uid.as_deref().unwrap_or_default();

    let mut volume_backups = Vec::new();
    for (volume_name, claim_name) in source.persistent_volume_claims() {
        let Some(pvc) = snapshot_claim(ctx.kube.as_ref(), &namespace, &claim_name).await? else {
            warn!(claim = %claim_name, "no snapshot-capable claim, volume excluded");
            continue;
        };
        volume_backups.push(VolumeBackup {
            volume_snapshot_name: Some(volume_snapshot_name(uid, &volume_name)),
            volume_name,
            persistent_volume_claim: PersistentVolumeClaimTemplate {
                metadata: ObjectMeta {
                    name: pvc.metadata.name.clone(),
                    namespace: pvc.metadata.namespace.clone(),
                    uid: pvc.metadata.uid.clone(),
                    labels: pvc.metadata.labels.clone(),
                    annotations: pvc.metadata.annotations.clone(),
                    ..Default::default()
                },
                spec: pvc.spec.clone().unwrap_or_default(),
            },
        });
    }

    let source_spec = point_at_duplicates(source.spec(), &snapshot.name_any());
    let mut content = VirtualMachineSnapshotContent::new(
        &content_name(snapshot),
        VirtualMachineSnapshotContentSpec {
            virtual_machine_snapshot_name: Some(snapshot.name_any()),
            source: source_spec,
            volume_backups,
        },
    );
    content.metadata.namespace = Some(namespace.clone());
    content.metadata.finalizers = Some(vec![CONTENT_FINALIZER.to_string()]);

    let created = match ctx.kube.create_content(&content).await {
        Ok(created) => created,
        Err(e) if e.is_already_exists() => ctx
            .kube
            .get_content(&namespace, &content.name_any())
            .await?
            .ok_or(e)?,
        Err(e) => return Err(e),
    };

    info!(content = %created.name_any(), "created snapshot content");
    ctx.events
        .publish(
            &snapshot.object_ref(&()),
            EventType::Normal,
            reasons::CONTENT_CREATED,
            actions::CREATE,
            Some(format!(
                "Successfully created VirtualMachineSnapshotContent {}",
                created.name_any()
            )),
        )
        .await;
    Ok(created)
}

fn point_at_duplicates(mut spec: SourceSpec, snapshot_name: &str) -> SourceSpec {
    if let Some(vm) = spec.virtual_machine.as_mut() {
        let vm_name = vm.metadata.name.clone().unwrap_or_default();
        for matcher in [vm.spec.instancetype.as_mut(), vm.spec.preference.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(revision) = matcher.revision_name.as_mut() {
                *revision = snapshot_revision_name(revision, &vm_name, snapshot_name);
            }
        }
    }
    spec
}

/// Copy the instance type and preference revisions referenced by the source
/// under snapshot-scoped names owned by the content
async fn duplicate_revisions(
    snapshot: &VirtualMachineSnapshot,
    source: &VirtualMachineSource,
    content: &VirtualMachineSnapshotContent,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let Some(vm) = source.spec().virtual_machine else {
        return Ok(());
    };
    let vm_name = vm.metadata.name.clone().unwrap_or_default();
    let originals = [vm.spec.instancetype.as_ref(), vm.spec.preference.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|m| m.revision_name.clone());

    for original in originals {
        let name = snapshot_revision_name(&original, &vm_name, &snapshot.name_any());
        if ctx
            .kube
            .get_controller_revision(&namespace, &name)
            .await?
            .is_some()
        {
            continue;
        }
        let Some(revision) = ctx
            .kube
            .get_controller_revision(&namespace, &original)
            .await?
        else {
            warn!(revision = %original, "referenced controller revision not found");
            continue;
        };

        let copy = ControllerRevision {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: revision.metadata.labels.clone(),
                annotations: revision.metadata.annotations.clone(),
                owner_references: Some(vec![controller_owner_ref(content)?]),
                ..Default::default()
            },
            data: revision.data.clone(),
            revision: revision.revision,
        };
        match ctx.kube.create_controller_revision(&copy).await {
            Ok(_) => debug!(revision = %name, "duplicated controller revision"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
