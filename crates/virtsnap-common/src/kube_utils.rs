//! Helpers for metadata, JSON patches, owner references and unit parsing

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde_json::{json, Value};

use crate::{Error, Result};

/// JSON patch document accepted by the cluster client
pub type JsonPatch = json_patch::Patch;

/// Build a JSON patch from a list of operations
pub fn json_patch(ops: Value) -> Result<JsonPatch> {
    serde_json::from_value(ops).map_err(|e| Error::serialization(format!("invalid patch: {e}")))
}

/// `test` operation guarding a patch with the object's resource version
pub fn resource_version_test(meta: &ObjectMeta) -> Value {
    json!({
        "op": "test",
        "path": "/metadata/resourceVersion",
        "value": meta.resource_version.clone().unwrap_or_default(),
    })
}

/// Escape a map key for use in a JSON pointer
pub fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Annotation value
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Label value
pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Set an annotation, returning whether it changed
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    if annotations.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    annotations.insert(key.to_string(), value.to_string());
    true
}

/// Set a label, returning whether it changed
pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    let labels = meta.labels.get_or_insert_with(Default::default);
    if labels.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    labels.insert(key.to_string(), value.to_string());
    true
}

/// Whether the object carries a finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add a finalizer, returning whether it was missing
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove a finalizer, returning whether it was present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if !has_finalizer(meta, finalizer) {
        return false;
    }
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    true
}

/// Patch replacing the finalizer list, guarded by the resource version
pub fn finalizers_patch(meta: &ObjectMeta, finalizers: &[String]) -> Result<JsonPatch> {
    json_patch(json!([
        resource_version_test(meta),
        { "op": "add", "path": "/metadata/finalizers", "value": finalizers },
    ]))
}

/// Whether the object is being deleted
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Controller owner reference pointing at `owner`
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("owner has no name or uid"))
}

/// The controller owner reference of an object, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Whether the object is controlled by the owner with this uid
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    controller_of(meta).is_some_and(|r| r.uid == owner_uid)
}

/// Make `owner` the object's controller, replacing any previous controller
///
/// Returns whether the references changed.
pub fn set_controller(meta: &mut ObjectMeta, owner: OwnerReference) -> bool {
    if is_controlled_by(meta, &owner.uid) {
        return false;
    }
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true) && r.uid != owner.uid);
    refs.push(owner);
    true
}

/// Parse a Go-style duration such as `"5m"`, `"1h30m"`, `"90s"` or `"250ms"`
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }
    if raw.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let value: f64 = number.parse().ok()?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * scale;
        rest = next;
    }
    Some(Duration::from_secs_f64(total))
}

/// Format a duration the way Go prints whole-second durations
pub fn format_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

/// Parse a resource quantity into bytes
///
/// Supports binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes, milli
/// units and exponents. Fractional byte counts round up.
pub fn parse_quantity(quantity: &Quantity) -> Option<u128> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            10f64.powi(exp[1..].parse::<i32>().ok()?)
        }
        _ => return None,
    };
    let bytes = value * multiplier;
    if bytes < 0.0 {
        return None;
    }
    Some(bytes.ceil() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_go_syntax() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2m30s"), Some(Duration::from_secs(150)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("5 minutes"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn quantities_compare_across_units() {
        let q = |s: &str| parse_quantity(&Quantity(s.to_string()));
        assert_eq!(q("1Gi"), Some(1_073_741_824));
        assert_eq!(q("1G"), Some(1_000_000_000));
        assert_eq!(q("1536Mi"), Some(1_610_612_736));
        assert_eq!(q("1.5Gi"), Some(1_610_612_736));
        assert_eq!(q("2e3"), Some(2000));
        assert_eq!(q("10"), Some(10));
        assert!(q("1Gi") > q("1G"));
        assert_eq!(q("ten"), None);
    }

    #[test]
    fn finalizers_add_and_remove_once() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, "a/b"));
        assert!(!add_finalizer(&mut meta, "a/b"));
        assert!(has_finalizer(&meta, "a/b"));
        assert!(remove_finalizer(&mut meta, "a/b"));
        assert!(!remove_finalizer(&mut meta, "a/b"));
        assert_eq!(meta.finalizers, Some(vec![]));
    }

    #[test]
    fn finalizer_patch_is_guarded_by_resource_version() {
        let meta = ObjectMeta {
            resource_version: Some("42".into()),
            ..Default::default()
        };
        let patch = finalizers_patch(&meta, &["x".to_string()]).unwrap();
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json[0]["op"], "test");
        assert_eq!(json[0]["value"], "42");
        assert_eq!(json[1]["path"], "/metadata/finalizers");
    }

    #[test]
    fn controller_reference_replaces_previous_controller() {
        let owner = |uid: &str| OwnerReference {
            api_version: "kubevirt.io/v1".into(),
            kind: "VirtualMachine".into(),
            name: format!("vm-{uid}"),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let mut meta = ObjectMeta::default();
        assert!(set_controller(&mut meta, owner("1")));
        assert!(!set_controller(&mut meta, owner("1")));
        assert!(set_controller(&mut meta, owner("2")));
        assert!(is_controlled_by(&meta, "2"));
        assert_eq!(meta.owner_references.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn json_pointer_escaping() {
        assert_eq!(escape_json_pointer("app.kubernetes.io/name"), "app.kubernetes.io~1name");
        assert_eq!(escape_json_pointer("a~b"), "a~0b");
    }
}
