//! Storage resources the controllers create or inspect
//!
//! - `DataVolume` (`cdi.kubevirt.io/v1beta1`): populated claims
//! - `VolumeSnapshot` (`snapshot.storage.k8s.io/v1`): storage-level snapshots
//! - `VolumeSnapshotClass` (`snapshot.storage.k8s.io/v1`): snapshot drivers

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::virtualmachine::Extra;

/// DataVolume spec
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    plural = "datavolumes",
    shortname = "dv",
    namespaced,
    status = "DataVolumeStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Claim spec for the populated volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PersistentVolumeClaimSpec>,

    /// Source, storage and other population settings
    #[serde(flatten)]
    pub extra: Extra,
}

/// DataVolume lifecycle phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DataVolumePhase {
    /// Not yet processed
    Pending,
    /// Claim waits for a consumer before binding
    WaitForFirstConsumer,
    /// Claim waits for an external populator
    PendingPopulation,
    /// Population finished
    Succeeded,
    /// Population failed
    Failed,
    /// Any other phase
    #[default]
    #[serde(other)]
    Unknown,
}

impl DataVolumePhase {
    /// Phases in which a restored DataVolume no longer blocks completion
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Pending | Self::WaitForFirstConsumer | Self::PendingPopulation
        )
    }
}

/// DataVolume status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DataVolumePhase,

    #[serde(flatten)]
    pub extra: Extra,
}

impl DataVolume {
    /// Current phase, `Unknown` before the first status update
    pub fn phase(&self) -> DataVolumePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/// Source of a storage-level snapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// Claim to snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    /// Pre-provisioned snapshot content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

/// VolumeSnapshot spec
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    namespaced,
    status = "VolumeSnapshotStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// What to snapshot
    pub source: VolumeSnapshotSource,

    /// Snapshot class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Error reported by the snapshot driver
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotError {
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the error happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// VolumeSnapshot status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Point in time the snapshot was cut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Whether the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Minimum size of a volume restored from this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<Quantity>,

    /// Driver error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

impl VolumeSnapshot {
    /// Whether the snapshot has been cut
    pub fn is_created(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.creation_time.is_some())
    }

    /// Whether the snapshot is ready to use
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }
}

/// Annotation marking the default VolumeSnapshotClass
pub const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str = "snapshot.storage.kubernetes.io/is-default-class";

/// A VolumeSnapshotClass
///
/// The driver fields live at the top level rather than under a spec, so the
/// resource is implemented by hand instead of through `CustomResource`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotClass {
    /// Standard metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// CSI driver handling snapshots of this class
    pub driver: String,

    /// What happens to the snapshot content on deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl VolumeSnapshotClass {
    /// Class name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Whether the class is annotated as the cluster default
    pub fn is_default(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DEFAULT_SNAPSHOT_CLASS_ANNOTATION))
            .is_some_and(|v| v == "true")
    }
}

impl kube::Resource for VolumeSnapshotClass {
    type DynamicType = ();
    type Scope = k8s_openapi::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "VolumeSnapshotClass".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "snapshot.storage.k8s.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "volumesnapshotclasses".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
