//! In-memory cluster for scenario tests
//!
//! [`FakeCluster`] implements [`VirtClient`] over a map of JSON documents and
//! mimics the API server where the reconcilers depend on it:
//!
//! - whole-object writes must carry the current resource version
//! - JSON patches are applied atomically, a failed `test` is a conflict
//! - spec writes keep the stored status and status writes keep everything else
//! - deleting an object with finalizers only sets its deletion timestamp
//! - the object disappears once its last finalizer is removed
//!
//! Every successful mutation bumps [`FakeCluster::writes`], which scenario
//! tests use to check that an unchanged world produces no writes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::client::VirtClient;
use crate::crd::{
    DataVolume, VirtualMachine, VirtualMachineClone, VirtualMachineInstance,
    VirtualMachineRestore, VirtualMachineSnapshot, VirtualMachineSnapshotContent, VolumeSnapshot,
    VolumeSnapshotClass, FS_FROZEN,
};
use crate::kube_utils::JsonPatch;
use crate::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    counter: u64,
    writes: usize,
    calls: Vec<String>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// In-memory [`VirtClient`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn key_of<K: Resource<DynamicType = ()>>(obj: &K) -> Key {
    key::<K>(obj.namespace().as_deref().unwrap_or_default(), &obj.name_any())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn meta_field<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    doc.get("metadata").and_then(|m| m.get(field))
}

fn has_finalizers(doc: &Value) -> bool {
    meta_field(doc, "finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn decode<K: DeserializeOwned>(doc: &Value) -> Result<K> {
    Ok(serde_json::from_value(doc.clone())?)
}

fn describe(key: &Key) -> String {
    format!("{} {}/{}", key.0, key.1, key.2)
}

impl FakeCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object as if another actor created it
    ///
    /// Missing uid, resource version and creation timestamp are filled in.
    /// Seeding does not count as a write.
    pub fn seed<K>(&self, obj: K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key_of(&obj);
        let mut state = self.state.lock();
        let id = state.next();
        let mut doc = serde_json::to_value(&obj).expect("serializable object");
        let meta = &mut doc["metadata"];
        if meta.get("uid").and_then(Value::as_str).is_none() {
            meta["uid"] = json!(format!("uid-{}-{id}", key.2));
        }
        if meta.get("creationTimestamp").and_then(Value::as_str).is_none() {
            meta["creationTimestamp"] = json!(now());
        }
        meta["resourceVersion"] = json!(id.to_string());
        state.objects.insert(key, doc.clone());
        serde_json::from_value(doc).expect("deserializable object")
    }

    /// Current copy of an object
    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let state = self.state.lock();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|doc| serde_json::from_value(doc.clone()).expect("deserializable object"))
    }

    /// Every object of a kind
    pub fn list<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == kind)
            .map(|(_, doc)| serde_json::from_value(doc.clone()).expect("deserializable object"))
            .collect()
    }

    /// Change an object as another actor would, status included
    pub fn modify<K>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K))
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key::<K>(namespace, name);
        let mut state = self.state.lock();
        let id = state.next();
        let Some(doc) = state.objects.get(&key) else {
            panic!("{} does not exist", describe(&key));
        };
        let mut obj: K = serde_json::from_value(doc.clone()).expect("deserializable object");
        f(&mut obj);
        let mut doc = serde_json::to_value(&obj).expect("serializable object");
        doc["metadata"]["resourceVersion"] = json!(id.to_string());
        if doc.pointer("/metadata/deletionTimestamp").is_some() && !has_finalizers(&doc) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, doc);
        }
    }

    /// Remove an object immediately, ignoring finalizers
    pub fn remove<K>(&self, namespace: &str, name: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.state.lock().objects.remove(&key::<K>(namespace, name));
    }

    /// Number of successful mutations by reconcilers
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    /// Runtime calls (`stop`, `freeze`, `unfreeze`) in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn read<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let state = self.state.lock();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(decode)
            .transpose()
    }

    fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key_of(obj);
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(describe(&key)));
        }
        let id = state.next();
        let mut doc = serde_json::to_value(obj)?;
        let meta = &mut doc["metadata"];
        meta["uid"] = json!(format!("uid-{}-{id}", key.2));
        meta["resourceVersion"] = json!(id.to_string());
        meta["creationTimestamp"] = json!(now());
        state.writes += 1;
        state.objects.insert(key, doc.clone());
        decode(&doc)
    }

    fn store(&self, state: &mut State, key: Key, mut doc: Value) -> Result<Value> {
        let id = state.next();
        doc["metadata"]["resourceVersion"] = json!(id.to_string());
        state.writes += 1;
        if doc.pointer("/metadata/deletionTimestamp").is_some() && !has_finalizers(&doc) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, doc.clone());
        }
        Ok(doc)
    }

    fn update<K>(&self, obj: &K, status: bool) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = key_of(obj);
        let mut state = self.state.lock();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(describe(&key)));
        };
        let incoming = serde_json::to_value(obj)?;
        if let Some(rv) = meta_field(&incoming, "resourceVersion").and_then(Value::as_str) {
            if Some(rv) != meta_field(&current, "resourceVersion").and_then(Value::as_str) {
                return Err(Error::conflict(format!(
                    "{}: the object has been modified",
                    describe(&key)
                )));
            }
        }

        let doc = if status {
            let mut doc = current.clone();
            match incoming.get("status") {
                Some(s) => doc["status"] = s.clone(),
                None => {
                    if let Some(map) = doc.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            doc
        } else {
            let mut doc = incoming;
            for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
                if let Some(v) = meta_field(&current, field) {
                    doc["metadata"][field] = v.clone();
                }
            }
            match current.get("status") {
                Some(s) => doc["status"] = s.clone(),
                None => {
                    if let Some(map) = doc.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            doc
        };
        let stored = self.store(&mut state, key, doc)?;
        decode(&stored)
    }

    fn patch<K>(&self, namespace: &str, name: &str, patch: &JsonPatch, status: bool) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = key::<K>(namespace, name);
        let mut state = self.state.lock();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(describe(&key)));
        };
        let mut patched = current.clone();
        json_patch::patch(&mut patched, &patch.0)
            .map_err(|e| Error::conflict(format!("{}: {e}", describe(&key))))?;

        let doc = if status {
            let mut doc = current;
            doc["status"] = patched.get("status").cloned().unwrap_or(Value::Null);
            doc
        } else {
            if let Some(s) = current.get("status") {
                patched["status"] = s.clone();
            }
            patched
        };
        let stored = self.store(&mut state, key, doc)?;
        decode(&stored)
    }

    fn delete<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let key = key::<K>(namespace, name);
        let mut state = self.state.lock();
        let Some(mut doc) = state.objects.get(&key).cloned() else {
            return Ok(());
        };
        if !has_finalizers(&doc) {
            state.objects.remove(&key);
            state.writes += 1;
            return Ok(());
        }
        if doc.pointer("/metadata/deletionTimestamp").is_none() {
            doc["metadata"]["deletionTimestamp"] = json!(now());
            self.store(&mut state, key, doc)?;
        }
        Ok(())
    }

    fn set_freeze(&self, namespace: &str, name: &str, frozen: bool) -> Result<()> {
        let key = key::<VirtualMachineInstance>(namespace, name);
        let mut state = self.state.lock();
        let Some(mut doc) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(describe(&key)));
        };
        if frozen {
            doc["status"]["fsFreezeStatus"] = json!(FS_FROZEN);
        } else if let Some(status) = doc.get_mut("status").and_then(Value::as_object_mut) {
            status.remove("fsFreezeStatus");
        }
        let verb = if frozen { "freeze" } else { "unfreeze" };
        state.calls.push(format!("{verb} {namespace}/{name}"));
        self.store(&mut state, key, doc)?;
        Ok(())
    }
}

fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels
                .and_then(|l| l.get(k.trim()))
                .is_some_and(|actual| actual == v.trim()),
            None => labels.is_some_and(|l| l.contains_key(term.trim())),
        })
}

#[async_trait]
impl VirtClient for FakeCluster {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        self.read(namespace, name)
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.create(vm)
    }

    async fn update_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.update(vm, false)
    }

    async fn update_vm_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.update(vm, true)
    }

    async fn patch_vm(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<VirtualMachine> {
        self.patch(namespace, name, patch, false)
    }

    async fn patch_vm_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<VirtualMachine> {
        self.patch(namespace, name, patch, true)
    }

    async fn stop_vm(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("stop {namespace}/{name}"));
        state
            .objects
            .remove(&key::<VirtualMachineInstance>(namespace, name));
        state.writes += 1;
        Ok(())
    }

    async fn get_vmi(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineInstance>> {
        self.read(namespace, name)
    }

    async fn freeze_vmi(
        &self,
        namespace: &str,
        name: &str,
        _unfreeze_timeout: Duration,
    ) -> Result<()> {
        self.set_freeze(namespace, name, true)
    }

    async fn unfreeze_vmi(&self, namespace: &str, name: &str) -> Result<()> {
        self.set_freeze(namespace, name, false)
    }

    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshot>> {
        self.read(namespace, name)
    }

    async fn create_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.create(snapshot)
    }

    async fn update_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.update(snapshot, false)
    }

    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot> {
        self.update(snapshot, true)
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineSnapshot>(namespace, name)
    }

    async fn get_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshotContent>> {
        self.read(namespace, name)
    }

    async fn create_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.create(content)
    }

    async fn update_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.update(content, false)
    }

    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent> {
        self.update(content, true)
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineSnapshotContent>(namespace, name)
    }

    async fn get_restore(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineRestore>> {
        self.read(namespace, name)
    }

    async fn create_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.create(restore)
    }

    async fn update_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.update(restore, false)
    }

    async fn update_restore_status(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore> {
        self.update(restore, true)
    }

    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VirtualMachineRestore>(namespace, name)
    }

    async fn update_clone_status(
        &self,
        clone: &VirtualMachineClone,
    ) -> Result<VirtualMachineClone> {
        self.update(clone, true)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.read(namespace, name)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .list::<PersistentVolumeClaim>()
            .into_iter()
            .filter(|pvc| pvc.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pvc| selector_matches(label_selector, pvc.metadata.labels.as_ref()))
            .collect())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.create(pvc)
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.update(pvc, false)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<PersistentVolumeClaim>(namespace, name)
    }

    async fn get_data_volume(&self, namespace: &str, name: &str) -> Result<Option<DataVolume>> {
        self.read(namespace, name)
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        self.create(dv)
    }

    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        self.update(dv, false)
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<DataVolume>(namespace, name)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        self.read("", name)
    }

    async fn list_volume_snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClass>> {
        Ok(self.list())
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        self.read(namespace, name)
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        self.create(snapshot)
    }

    async fn update_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        self.update(snapshot, false)
    }

    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VolumeSnapshot>(namespace, name)
    }

    async fn get_controller_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>> {
        self.read(namespace, name)
    }

    async fn create_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision> {
        self.create(revision)
    }

    async fn update_controller_revision(
        &self,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision> {
        self.update(revision, false)
    }

    async fn delete_controller_revision(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<ControllerRevision>(namespace, name)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .list::<Pod>()
            .into_iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .collect())
    }
}
