//! JSON patches turning a snapshotted VM into an independent clone
//!
//! The patches are handed to the restore, which applies them to the VM it
//! generates. They are computed from the VM captured in the snapshot
//! content, never from the live source, so they always match the document
//! they are applied to.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{json, Value};

use virtsnap_common::crd::{SnapshotVirtualMachine, VirtualMachineCloneSpec};
use virtsnap_common::kube_utils::escape_json_pointer;
use virtsnap_common::{Error, Result, LAST_RESTORE_ANNOTATION};

const INTERFACES_PATH: &str = "/spec/template/spec/domain/devices/interfaces";
const FIRMWARE_PATH: &str = "/spec/template/spec/domain/firmware";

/// Label or annotation key filter
///
/// Filters are anchored globs where `*` matches anything. A key is kept when
/// it matches a positive filter and no `!`-prefixed one. Without positive
/// filters every key counts as matched, so a list of negations only removes
/// what it names.
#[derive(Debug, Default)]
pub struct KeyFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl KeyFilter {
    /// Compile a filter list
    pub fn new(filters: &[String]) -> Result<Self> {
        let mut filter = Self::default();
        for raw in filters {
            match raw.strip_prefix('!') {
                Some(negated) => filter.exclude.push(glob(negated)?),
                None => filter.include.push(glob(raw)?),
            }
        }
        Ok(filter)
    }

    /// Whether the key survives the filter
    pub fn keeps(&self, key: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(key));
        included && !self.exclude.iter().any(|r| r.is_match(key))
    }
}

fn glob(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| Error::validation(format!("invalid filter {pattern:?}: {e}")))
}

/// Patches for a clone of `vm`, followed by the clone's own patches
pub fn clone_patches(
    spec: &VirtualMachineCloneSpec,
    vm: &SnapshotVirtualMachine,
) -> Result<Vec<String>> {
    let mut ops = Vec::new();
    ops.extend(mac_address_ops(spec, vm));
    ops.extend(firmware_ops(spec, vm));
    ops.extend(metadata_ops(
        "labels",
        vm.metadata.labels.as_ref(),
        &KeyFilter::new(&spec.label_filters)?,
    ));
    ops.extend(metadata_ops(
        "annotations",
        vm.metadata.annotations.as_ref(),
        &KeyFilter::new(&spec.annotation_filters)?,
    ));

    let mut patches = ops
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    patches.extend(spec.patches.iter().cloned());
    Ok(patches)
}

/// New MAC per interface, or no MAC at all so the pool assigns one
fn mac_address_ops(spec: &VirtualMachineCloneSpec, vm: &SnapshotVirtualMachine) -> Vec<Value> {
    let interfaces = &vm.spec.template.spec.domain.devices.interfaces;
    interfaces
        .iter()
        .enumerate()
        .filter_map(|(i, iface)| {
            let path = format!("{INTERFACES_PATH}/{i}/macAddress");
            let requested = spec
                .new_mac_addresses
                .get(&iface.name)
                .filter(|mac| !mac.is_empty());
            match (requested, &iface.mac_address) {
                (Some(mac), _) => Some(json!({ "op": "add", "path": path, "value": mac })),
                (None, Some(_)) => Some(json!({ "op": "remove", "path": path })),
                (None, None) => None,
            }
        })
        .collect()
}

/// SMBIOS serial replacement and firmware UUID removal
fn firmware_ops(spec: &VirtualMachineCloneSpec, vm: &SnapshotVirtualMachine) -> Vec<Value> {
    let firmware = vm.spec.template.spec.domain.firmware.as_ref();
    let mut ops = Vec::new();

    match (spec.new_smbios_serial.as_deref(), firmware) {
        (Some(serial), Some(_)) => ops.push(json!({
            "op": "add",
            "path": format!("{FIRMWARE_PATH}/serial"),
            "value": serial,
        })),
        (Some(serial), None) => ops.push(json!({
            "op": "add",
            "path": FIRMWARE_PATH,
            "value": { "serial": serial },
        })),
        (None, Some(fw)) if fw.serial.is_some() => ops.push(json!({
            "op": "remove",
            "path": format!("{FIRMWARE_PATH}/serial"),
        })),
        (None, _) => {}
    }

    if firmware.is_some_and(|fw| fw.uuid.is_some()) {
        ops.push(json!({ "op": "remove", "path": format!("{FIRMWARE_PATH}/uuid") }));
    }
    ops
}

fn metadata_ops(
    field: &str,
    entries: Option<&BTreeMap<String, String>>,
    filter: &KeyFilter,
) -> Vec<Value> {
    entries
        .into_iter()
        .flat_map(BTreeMap::keys)
        .filter(|key| key.as_str() != LAST_RESTORE_ANNOTATION && !filter.keeps(key))
        .map(|key| {
            json!({
                "op": "remove",
                "path": format!("/metadata/{field}/{}", escape_json_pointer(key)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::TypedLocalObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::ResourceExt;
    use virtsnap_common::crd::{Firmware, Interface, VirtualMachine};

    // =========================================================================
    // Helpers
    // =========================================================================

    fn spec() -> VirtualMachineCloneSpec {
        VirtualMachineCloneSpec {
            source: TypedLocalObjectReference {
                api_group: Some("kubevirt.io".into()),
                kind: "VirtualMachine".into(),
                name: "vm-a".into(),
            },
            ..Default::default()
        }
    }

    fn snapshot_vm() -> SnapshotVirtualMachine {
        SnapshotVirtualMachine {
            metadata: ObjectMeta {
                name: Some("vm-a".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn interface(name: &str, mac: Option<&str>) -> Interface {
        Interface {
            name: name.into(),
            mac_address: mac.map(str::to_string),
            ..Default::default()
        }
    }

    /// Apply the patches the way the restore applies them to its generated VM
    fn patched(source: &SnapshotVirtualMachine, patches: &[String]) -> VirtualMachine {
        let mut vm = VirtualMachine::new("clone-target", source.spec.clone());
        vm.metadata.labels = source.metadata.labels.clone();
        vm.metadata.annotations = source.metadata.annotations.clone();
        let mut doc = serde_json::to_value(&vm).unwrap();
        let patch: json_patch::Patch =
            serde_json::from_str(&format!("[{}]", patches.join(","))).unwrap();
        json_patch::patch(&mut doc, &patch.0).unwrap();
        serde_json::from_value(doc).unwrap()
    }

    fn sample_filters() -> Vec<String> {
        ["prefix*", "!prefix1/something2", "!prefix2/*", "somePrefix2/something"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn keyed(keys: &[&str]) -> BTreeMap<String, String> {
        keys.iter().map(|k| (k.to_string(), "true".to_string())).collect()
    }

    // =========================================================================
    // Filters
    // =========================================================================

    #[test]
    fn negation_wins_over_inclusion() {
        let filters = sample_filters();
        let filter = KeyFilter::new(&filters).unwrap();

        assert!(filter.keeps("prefix1/something1"));
        assert!(!filter.keeps("prefix1/something2"));
        assert!(!filter.keeps("prefix2/something1"));
        assert!(!filter.keeps("somePrefix/something"));
        assert!(filter.keeps("somePrefix2/something"));
    }

    #[test]
    fn globs_are_anchored_and_literal() {
        let filter = KeyFilter::new(&["app.kubernetes.io/*".to_string()]).unwrap();
        assert!(filter.keeps("app.kubernetes.io/name"));
        assert!(!filter.keeps("appXkubernetes.io/name"));
        assert!(!filter.keeps("my.app.kubernetes.io/name"));
    }

    #[test]
    fn negations_alone_remove_only_what_they_name() {
        let filter = KeyFilter::new(&["!foo/*".to_string()]).unwrap();
        assert!(!filter.keeps("foo/bar"));
        assert!(filter.keeps("app"));
        assert!(filter.keeps("foo"));
    }

    #[test]
    fn no_filters_keep_everything() {
        assert!(KeyFilter::new(&[]).unwrap().keeps("anything/at-all"));
    }

    // =========================================================================
    // Generated patches
    // =========================================================================

    #[test]
    fn macs_are_replaced_or_dropped() {
        let mut source = snapshot_vm();
        source.spec.template.spec.domain.devices.interfaces = vec![
            interface("default", Some("DE-AD-00-00-BE-00")),
            interface("secondary", Some("DE-AD-00-00-BE-01")),
            interface("plain", None),
        ];
        let mut spec = spec();
        spec.new_mac_addresses
            .insert("default".into(), "DE-AD-00-00-BE-09".into());

        let vm = patched(&source, &clone_patches(&spec, &source).unwrap());

        let interfaces = &vm.spec.template.spec.domain.devices.interfaces;
        assert_eq!(interfaces[0].mac_address.as_deref(), Some("DE-AD-00-00-BE-09"));
        assert_eq!(interfaces[1].mac_address, None);
        assert_eq!(interfaces[2].mac_address, None);
    }

    #[test]
    fn serial_is_cleared_unless_requested() {
        let mut source = snapshot_vm();
        source.spec.template.spec.domain.firmware = Some(Firmware {
            serial: Some("original-serial".into()),
            ..Default::default()
        });

        let vm = patched(&source, &clone_patches(&spec(), &source).unwrap());
        let firmware = vm.spec.template.spec.domain.firmware.unwrap();
        assert_eq!(firmware.serial, None);

        let mut requested = spec();
        requested.new_smbios_serial = Some("manually-set-serial".into());
        let vm = patched(&source, &clone_patches(&requested, &source).unwrap());
        let firmware = vm.spec.template.spec.domain.firmware.unwrap();
        assert_eq!(firmware.serial.as_deref(), Some("manually-set-serial"));
    }

    #[test]
    fn serial_without_firmware_adds_the_section() {
        let source = snapshot_vm();
        let mut spec = spec();
        spec.new_smbios_serial = Some("serial-2".into());

        let vm = patched(&source, &clone_patches(&spec, &source).unwrap());
        let firmware = vm.spec.template.spec.domain.firmware.unwrap();
        assert_eq!(firmware.serial.as_deref(), Some("serial-2"));
    }

    #[test]
    fn firmware_uuid_is_stripped() {
        let mut source = snapshot_vm();
        source.spec.template.spec.domain.firmware = Some(Firmware {
            uuid: Some("source-fake-uuid".into()),
            ..Default::default()
        });

        let vm = patched(&source, &clone_patches(&spec(), &source).unwrap());
        assert_eq!(vm.spec.template.spec.domain.firmware.unwrap().uuid, None);
    }

    #[test]
    fn labels_and_annotations_follow_their_filters() {
        let keys = [
            "prefix1/something1",
            "prefix1/something2",
            "prefix2/something1",
            "somePrefix/something",
            "somePrefix2/something",
        ];
        let filters = sample_filters();
        let mut source = snapshot_vm();
        source.metadata.labels = Some(keyed(&keys));
        source.metadata.annotations = Some(keyed(&keys));
        let mut spec = spec();
        spec.label_filters = filters.clone();
        spec.annotation_filters = filters;

        let vm = patched(&source, &clone_patches(&spec, &source).unwrap());

        let expected = keyed(&["prefix1/something1", "somePrefix2/something"]);
        assert_eq!(vm.metadata.labels, Some(expected.clone()));
        assert_eq!(vm.metadata.annotations, Some(expected));
    }

    #[test]
    fn last_restore_annotation_is_never_filtered() {
        let mut source = snapshot_vm();
        source.metadata.annotations = Some(keyed(&[LAST_RESTORE_ANNOTATION, "other/key"]));
        let mut spec = spec();
        spec.annotation_filters = vec!["somekey/*".into()];

        let patches = clone_patches(&spec, &source).unwrap();

        assert_eq!(
            patches,
            vec![r#"{"op":"remove","path":"/metadata/annotations/other~1key"}"#.to_string()]
        );
        let vm = patched(&source, &patches);
        assert!(vm.annotations().contains_key(LAST_RESTORE_ANNOTATION));
    }

    #[test]
    fn user_patches_come_last() {
        let mut source = snapshot_vm();
        source.spec.template.spec.domain.firmware = Some(Firmware {
            uuid: Some("u".into()),
            ..Default::default()
        });
        let mut spec = spec();
        spec.patches =
            vec![r#"{"op":"add","path":"/metadata/labels","value":{"team":"b"}}"#.into()];

        let patches = clone_patches(&spec, &source).unwrap();

        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1], spec.patches[0]);
        let vm = patched(&source, &patches);
        assert_eq!(vm.labels().get("team").map(String::as_str), Some("b"));
    }

    #[test]
    fn regex_metacharacters_match_literally() {
        let filter = KeyFilter::new(&["a(b)+".to_string()]).unwrap();
        assert!(filter.keeps("a(b)+"));
        assert!(!filter.keeps("abb"));
    }
}
