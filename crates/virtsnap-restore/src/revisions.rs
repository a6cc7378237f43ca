//! Instance type and preference revisions of a restored VM
//!
//! A snapshot keeps its own copies of the revisions the VM referenced. On
//! restore those copies are copied again under target-scoped names and the
//! restored VM is pointed at them; once the VM exists it takes ownership.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use virtsnap_common::crd::{RevisionMatcher, VirtualMachine};
use virtsnap_common::kube_utils::{controller_owner_ref, is_controlled_by};
use virtsnap_common::{ControllerContext, Error, Result};

/// Name of the target's copy of a snapshot revision
pub fn restored_revision_name(revision: &str, snapshot_name: &str, vm_name: &str) -> String {
    revision.replacen(snapshot_name, vm_name, 1)
}

fn matchers(vm: &mut VirtualMachine) -> impl Iterator<Item = &mut RevisionMatcher> {
    [vm.spec.instancetype.as_mut(), vm.spec.preference.as_mut()]
        .into_iter()
        .flatten()
}

/// Copy the snapshot's revisions for the target and repoint the VM at them
///
/// When the target already exists, an existing copy with different data is
/// replaced and one with the same data is reused.
pub async fn restore_revisions(
    vm: &mut VirtualMachine,
    snapshot_name: &str,
    target_exists: bool,
    ctx: &Arc<ControllerContext>,
) -> Result<()> {
    let namespace = vm.namespace().unwrap_or_default();
    let vm_name = vm.name_any();
    let owner = if target_exists {
        Some(controller_owner_ref(&*vm)?)
    } else {
        None
    };

    for matcher in matchers(vm) {
        let Some(source_name) = matcher.revision_name.clone() else {
            continue;
        };
        let source = ctx
            .kube
            .get_controller_revision(&namespace, &source_name)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "Unable to find ControllerRevision {namespace}/{source_name}"
                ))
            })?;

        let name = restored_revision_name(&source_name, snapshot_name, &vm_name);
        let copy = ControllerRevision {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: source.metadata.labels.clone(),
                owner_references: owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            data: source.data.clone(),
            revision: source.revision,
        };

        if target_exists {
            if let Some(existing) = ctx.kube.get_controller_revision(&namespace, &name).await? {
                if existing.data == copy.data {
                    debug!(revision = %name, "reusing restored controller revision");
                    matcher.revision_name = Some(name);
                    continue;
                }
                info!(revision = %name, "replacing stale controller revision");
                ctx.kube.delete_controller_revision(&namespace, &name).await?;
            }
        }

        match ctx.kube.create_controller_revision(&copy).await {
            Ok(_) => debug!(revision = %name, "restored controller revision"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        matcher.revision_name = Some(name);
    }
    Ok(())
}

/// Make the VM the controller of the revisions it references
pub async fn claim_revisions(vm: &VirtualMachine, ctx: &Arc<ControllerContext>) -> Result<()> {
    let namespace = vm.namespace().unwrap_or_default();
    let vm_uid = vm.metadata.uid.as_deref().unwrap_or_default();
    let names = [vm.spec.instancetype.as_ref(), vm.spec.preference.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|m| m.revision_name.clone());

    for name in names {
        let Some(mut revision) = ctx.kube.get_controller_revision(&namespace, &name).await? else {
            continue;
        };
        if is_controlled_by(&revision.metadata, vm_uid) {
            continue;
        }
        revision.metadata.owner_references = Some(vec![controller_owner_ref(vm)?]);
        ctx.kube.update_controller_revision(&revision).await?;
        debug!(revision = %name, vm = %vm.name_any(), "revision owned by restored VM");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
    use serde_json::json;
    use virtsnap_common::crd::VirtualMachineSpec;
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

    fn revision(name: &str, cpu: u32) -> ControllerRevision {
        ControllerRevision {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NS.into()),
                ..Default::default()
            },
            data: Some(RawExtension(json!({ "spec": { "cpu": cpu } }))),
            revision: 1,
        }
    }

    fn vm(name: &str) -> VirtualMachine {
        let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
        vm.metadata.namespace = Some(NS.into());
        vm.spec.instancetype = Some(RevisionMatcher {
            name: "small".into(),
            revision_name: Some("snap-small-1".into()),
            ..Default::default()
        });
        vm
    }

    #[test]
    fn revision_names_swap_snapshot_for_target() {
        assert_eq!(restored_revision_name("snap-small-1", "snap", "vm-b"), "vm-b-small-1");
        assert_eq!(restored_revision_name("other-rev", "snap", "vm-b"), "other-rev");
    }

    #[tokio::test]
    async fn new_target_gets_a_copy() {
        let (cluster, ctx) = harness();
        cluster.seed(revision("snap-small-1", 2));
        let mut target = vm("vm-b");

        restore_revisions(&mut target, "snap", false, &ctx).await.unwrap();

        let matcher = target.spec.instancetype.as_ref().unwrap();
        assert_eq!(matcher.revision_name.as_deref(), Some("vm-b-small-1"));
        let copy: ControllerRevision = cluster.get(NS, "vm-b-small-1").unwrap();
        assert_eq!(copy.data, revision("x", 2).data);
        assert!(copy.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn existing_target_replaces_stale_copy() {
        let (cluster, ctx) = harness();
        cluster.seed(revision("snap-small-1", 4));
        cluster.seed(revision("vm-a-small-1", 2));
        let mut target = cluster.seed(vm("vm-a"));

        restore_revisions(&mut target, "snap", true, &ctx).await.unwrap();

        let copy: ControllerRevision = cluster.get(NS, "vm-a-small-1").unwrap();
        assert_eq!(copy.data, revision("x", 4).data);
        assert!(is_controlled_by(
            &copy.metadata,
            target.metadata.uid.as_deref().unwrap()
        ));
    }

    #[tokio::test]
    async fn missing_snapshot_revision_is_not_found() {
        let (_, ctx) = harness();
        let mut target = vm("vm-b");
        let err = restore_revisions(&mut target, "snap", false, &ctx)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("default/snap-small-1"));
    }

    #[tokio::test]
    async fn claim_sets_vm_as_controller() {
        let (cluster, ctx) = harness();
        cluster.seed(revision("vm-b-small-1", 2));
        let mut target = vm("vm-b");
        target.spec.instancetype.as_mut().unwrap().revision_name = Some("vm-b-small-1".into());
        let target = cluster.seed(target);

        claim_revisions(&target, &ctx).await.unwrap();

        let rev: ControllerRevision = cluster.get(NS, "vm-b-small-1").unwrap();
        assert!(is_controlled_by(&rev.metadata, target.metadata.uid.as_deref().unwrap()));
    }
}
