//! Storage lookups: snapshot class selection and snapshot-eligible claims

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, warn};

use virtsnap_common::crd::{VirtualMachine, Volume, VolumeSnapshotClass};
use virtsnap_common::{Error, Result, VirtClient};

/// Pick the VolumeSnapshotClass for a storage class
///
/// Classes match when their driver is the storage class provisioner. A single
/// match wins outright; among several, the one annotated as default wins.
/// Returns `None` when the storage class is unknown or nothing matches.
pub async fn volume_snapshot_class(
    kube: &dyn VirtClient,
    storage_class: &str,
) -> Result<Option<String>> {
    let Some(sc) = kube.get_storage_class(storage_class).await? else {
        debug!(storage_class, "storage class not found");
        return Ok(None);
    };
    let classes = kube.list_volume_snapshot_classes().await?;
    select_snapshot_class(storage_class, &sc.provisioner, &classes)
}

fn select_snapshot_class(
    storage_class: &str,
    provisioner: &str,
    classes: &[VolumeSnapshotClass],
) -> Result<Option<String>> {
    let matches: Vec<&VolumeSnapshotClass> =
        classes.iter().filter(|c| c.driver == provisioner).collect();

    match matches.as_slice() {
        [] => {
            warn!(storage_class, "no VolumeSnapshotClass matches");
            Ok(None)
        }
        [only] => Ok(Some(only.name().to_string())),
        several => several
            .iter()
            .find(|c| c.is_default())
            .map(|c| Some(c.name().to_string()))
            .ok_or_else(|| {
                Error::internal(format!(
                    "{} matching VolumeSnapshotClasses for {storage_class}",
                    several.len()
                ))
            }),
    }
}

/// Claim to snapshot, if it is bound and its storage class supports snapshots
pub async fn snapshot_claim(
    kube: &dyn VirtClient,
    namespace: &str,
    claim_name: &str,
) -> Result<Option<PersistentVolumeClaim>> {
    let Some(pvc) = kube.get_pvc(namespace, claim_name).await? else {
        return Ok(None);
    };
    let spec = pvc.spec.clone().unwrap_or_default();
    if spec.volume_name.as_deref().unwrap_or_default().is_empty() {
        warn!(namespace, claim = claim_name, "unbound claim is not snapshotted");
        return Ok(None);
    }
    let Some(storage_class) = spec.storage_class_name.as_deref() else {
        warn!(namespace, claim = claim_name, "claim has no storage class");
        return Ok(None);
    };
    Ok(volume_snapshot_class(kube, storage_class)
        .await?
        .map(|_| pvc))
}

/// Storage class of a VM volume
///
/// DataVolumes are resolved through their own spec first, then through the
/// VM's data volume templates, and finally through the claim they populate.
pub async fn volume_storage_class(
    kube: &dyn VirtClient,
    vm: &VirtualMachine,
    volume: &Volume,
) -> Result<Option<String>> {
    let namespace = vm.metadata.namespace.as_deref().unwrap_or_default();

    if let Some(claim) = volume
        .persistent_volume_claim
        .as_ref()
        .or(volume.memory_dump.as_ref())
    {
        return claim_storage_class(kube, namespace, &claim.claim_name).await;
    }

    let Some(dv) = volume.data_volume.as_ref() else {
        return Err(Error::validation("volume type has no StorageClass defined"));
    };

    if let Some(data_volume) = kube.get_data_volume(namespace, &dv.name).await? {
        let class = data_volume
            .spec
            .pvc
            .as_ref()
            .and_then(|p| p.storage_class_name.clone())
            .filter(|c| !c.is_empty());
        if class.is_some() {
            return Ok(class);
        }
    }

    let from_template = vm
        .spec
        .data_volume_templates
        .iter()
        .find(|t| t.name() == dv.name)
        .and_then(|t| t.spec.pvc.as_ref())
        .and_then(|p| p.storage_class_name.clone());
    if from_template.is_some() {
        return Ok(from_template);
    }

    claim_storage_class(kube, namespace, &dv.name).await
}

async fn claim_storage_class(
    kube: &dyn VirtClient,
    namespace: &str,
    claim_name: &str,
) -> Result<Option<String>> {
    match kube.get_pvc(namespace, claim_name).await? {
        Some(pvc) => Ok(pvc.spec.and_then(|s| s.storage_class_name)),
        None => Err(Error::not_found("PVC not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use virtsnap_common::crd::DEFAULT_SNAPSHOT_CLASS_ANNOTATION;

    fn class(name: &str, driver: &str, default: bool) -> VolumeSnapshotClass {
        let annotations = default.then(|| {
            BTreeMap::from([(
                DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(),
                "true".to_string(),
            )])
        });
        VolumeSnapshotClass {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations,
                ..Default::default()
            },
            driver: driver.into(),
            deletion_policy: None,
        }
    }

    #[test]
    fn single_matching_class_wins() {
        let classes = [class("a", "csi.one", false), class("b", "csi.two", false)];
        assert_eq!(
            select_snapshot_class("fast", "csi.two", &classes).unwrap(),
            Some("b".to_string())
        );
        assert_eq!(select_snapshot_class("fast", "csi.three", &classes).unwrap(), None);
    }

    #[test]
    fn default_class_breaks_ties() {
        let classes = [class("a", "csi.one", false), class("b", "csi.one", true)];
        assert_eq!(
            select_snapshot_class("fast", "csi.one", &classes).unwrap(),
            Some("b".to_string())
        );
    }

    #[test]
    fn ambiguous_classes_are_an_error() {
        let classes = [class("a", "csi.one", false), class("b", "csi.one", false)];
        let err = select_snapshot_class("fast", "csi.one", &classes).unwrap_err();
        assert!(err
            .to_string()
            .contains("2 matching VolumeSnapshotClasses for fast"));
    }
}
