//! Cluster access for the snapshot, restore and clone controllers
//!
//! [`VirtClient`] is the single seam between reconcilers and the API server.
//! Reads return `None` for missing objects; writes of whole objects carry
//! their resource version so stale writes fail with [`Error::Conflict`].

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

use crate::crd::{
    DataVolume, VirtualMachine, VirtualMachineClone, VirtualMachineInstance,
    VirtualMachineRestore, VirtualMachineSnapshot, VirtualMachineSnapshotContent, VolumeSnapshot,
    VolumeSnapshotClass,
};
use crate::kube_utils::{format_duration, JsonPatch};
use crate::{Error, Result};

/// Field manager recorded on patches
pub const FIELD_MANAGER: &str = "virtsnap-controller";

/// Cluster operations used by the reconcilers
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait VirtClient: Send + Sync {
    // VirtualMachine

    /// Get a VM
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>>;
    /// Create a VM
    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;
    /// Replace a VM's metadata and spec
    async fn update_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;
    /// Replace a VM's status
    async fn update_vm_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;
    /// JSON-patch a VM's metadata or spec
    async fn patch_vm(&self, namespace: &str, name: &str, patch: &JsonPatch)
        -> Result<VirtualMachine>;
    /// JSON-patch a VM's status
    async fn patch_vm_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<VirtualMachine>;
    /// Ask the runtime to stop a VM
    async fn stop_vm(&self, namespace: &str, name: &str) -> Result<()>;

    // VirtualMachineInstance

    /// Get the running instance of a VM
    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>>;
    /// Freeze guest filesystems; the agent thaws them after `unfreeze_timeout`
    async fn freeze_vmi(&self, namespace: &str, name: &str, unfreeze_timeout: Duration)
        -> Result<()>;
    /// Thaw guest filesystems
    async fn unfreeze_vmi(&self, namespace: &str, name: &str) -> Result<()>;

    // VirtualMachineSnapshot

    /// Get a snapshot
    async fn get_snapshot(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachineSnapshot>>;
    /// Create a snapshot
    async fn create_snapshot(&self, snapshot: &VirtualMachineSnapshot)
        -> Result<VirtualMachineSnapshot>;
    /// Replace a snapshot's metadata and spec
    async fn update_snapshot(&self, snapshot: &VirtualMachineSnapshot)
        -> Result<VirtualMachineSnapshot>;
    /// Replace a snapshot's status
    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot>;
    /// Delete a snapshot, missing objects are ignored
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()>;

    // VirtualMachineSnapshotContent

    /// Get a content record
    async fn get_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshotContent>>;
    /// Create a content record
    async fn create_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent>;
    /// Replace a content record's metadata and spec
    async fn update_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent>;
    /// Replace a content record's status
    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent>;
    /// Delete a content record, missing objects are ignored
    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()>;

    // VirtualMachineRestore

    /// Get a restore
    async fn get_restore(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachineRestore>>;
    /// Create a restore
    async fn create_restore(&self, restore: &VirtualMachineRestore)
        -> Result<VirtualMachineRestore>;
    /// Replace a restore's metadata and spec
    async fn update_restore(&self, restore: &VirtualMachineRestore)
        -> Result<VirtualMachineRestore>;
    /// Replace a restore's status
    async fn update_restore_status(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore>;
    /// Delete a restore, missing objects are ignored
    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<()>;

    // VirtualMachineClone

    /// Replace a clone's status
    async fn update_clone_status(&self, clone: &VirtualMachineClone)
        -> Result<VirtualMachineClone>;

    // PersistentVolumeClaim

    /// Get a claim
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    /// List claims matching a label selector
    async fn list_pvcs(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<PersistentVolumeClaim>>;
    /// Create a claim
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    /// Replace a claim
    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    /// Delete a claim, missing objects are ignored
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    // DataVolume

    /// Get a DataVolume
    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>>;
    /// Create a DataVolume
    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume>;
    /// Replace a DataVolume
    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume>;
    /// Delete a DataVolume, missing objects are ignored
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()>;

    // Storage classes and volume snapshots

    /// Get a storage class
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;
    /// List every VolumeSnapshotClass
    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClass>>;
    /// Get a storage-level snapshot
    async fn get_volume_snapshot(&self, namespace: &str, name: &str)
        -> Result<Option<VolumeSnapshot>>;
    /// Create a storage-level snapshot
    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;
    /// Replace a storage-level snapshot's metadata and spec
    async fn update_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;
    /// Delete a storage-level snapshot, missing objects are ignored
    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<()>;

    // ControllerRevision

    /// Get a controller revision
    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>>;
    /// Create a controller revision
    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision>;
    /// Replace a controller revision's metadata
    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision>;
    /// Delete a controller revision, missing objects are ignored
    async fn delete_controller_revision(&self, namespace: &str, name: &str) -> Result<()>;

    // Pods

    /// List pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
}

/// [`VirtClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeVirtClient {
    client: Client,
}

impl KubeVirtClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        self.api(obj.meta().namespace.as_deref().unwrap_or("default"))
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        Ok(self
            .api_for(obj)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        Ok(self
            .api_for(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api_for(obj)
            .replace_status(&obj.name_any(), &PostParams::default(), body)
            .await?)
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    /// PUT against a `subresources.kubevirt.io` endpoint
    async fn subresource(&self, path: String, body: serde_json::Value) -> Result<()> {
        let request = http::Request::builder()
            .method(http::Method::PUT)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&body)?)
            .map_err(|e| Error::internal(format!("failed to build request: {e}")))?;
        self.client.request_text(request).await?;
        Ok(())
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn subresource_path(namespace: &str, plural: &str, name: &str, action: &str) -> String {
    format!("/apis/subresources.kubevirt.io/v1/namespaces/{namespace}/{plural}/{name}/{action}")
}

#[async_trait]
impl VirtClient for KubeVirtClient {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        self.get(namespace, name).await
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.create(vm).await
    }

    async fn update_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.replace(vm).await
    }

    async fn update_vm_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.replace_status(vm).await
    }

    async fn patch_vm(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<VirtualMachine> {
        Ok(self
            .api::<VirtualMachine>(namespace)
            .patch(
                name,
                &patch_params(),
                &Patch::Json::<()>(patch.clone()),
            )
            .await?)
    }

    async fn patch_vm_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<VirtualMachine> {
        Ok(self
            .api::<VirtualMachine>(namespace)
            .patch_status(
                name,
                &patch_params(),
                &Patch::Json::<()>(patch.clone()),
            )
            .await?)
    }

    async fn stop_vm(&self, namespace: &str, name: &str) -> Result<()> {
        self.subresource(
            subresource_path(namespace, "virtualmachines", name, "stop"),
            json!({}),
        )
        .await
    }

    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>> {
        self.get(namespace, name).await
    }

    async fn freeze_vmi(
        &self,
        namespace: &str,
        name: &str,
        unfreeze_timeout: Duration,
    ) -> Result<()> {
        self.subresource(
            subresource_path(namespace, "virtualmachineinstances", name, "freeze"),
            json!({ "unfreezeTimeout": format_duration(unfreeze_timeout) }),
        )
        .await
    }

    async fn unfreeze_vmi(&self, namespace: &str, name: &str) -> Result<()> {
        self.subresource(
            subresource_path(namespace, "virtualmachineinstances", name, "unfreeze"),
            json!({}),
        )
        .await
    }

    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshot>> {
        self.get(namespace, name).await
    }

    async fn create_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.create(snapshot).await
    }

    async fn update_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.replace(snapshot).await
    }

    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.replace_status(snapshot).await
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineSnapshot>(namespace, name).await
    }

    async fn get_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshotContent>> {
        self.get(namespace, name).await
    }

    async fn create_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.create(content).await
    }

    async fn update_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.replace(content).await
    }

    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.replace_status(content).await
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineSnapshotContent>(namespace, name)
            .await
    }

    async fn get_restore(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineRestore>> {
        self.get(namespace, name).await
    }

    async fn create_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.create(restore).await
    }

    async fn update_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.replace(restore).await
    }

    async fn update_restore_status(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.replace_status(restore).await
    }

    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineRestore>(namespace, name).await
    }

    async fn update_clone_status(
        &self,
        clone: &VirtualMachineClone,
    ) -> Result<VirtualMachineClone> {
        self.replace_status(clone).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.get(namespace, name).await
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let list = self
            .api::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.create(pvc).await
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.replace(pvc).await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<PersistentVolumeClaim>(namespace, name).await
    }

    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>> {
        self.get(namespace, name).await
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        self.create(dv).await
    }

    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        self.replace(dv).await
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<DataVolume>(namespace, name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClass>> {
        let api: Api<VolumeSnapshotClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        self.get(namespace, name).await
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        self.create(snapshot).await
    }

    async fn update_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        self.replace(snapshot).await
    }

    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VolumeSnapshot>(namespace, name).await
    }

    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>> {
        self.get(namespace, name).await
    }

    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision> {
        self.create(revision).await
    }

    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision> {
        self.replace(revision).await
    }

    async fn delete_controller_revision(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<ControllerRevision>(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let list = self
            .api::<Pod>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }
}
