//! Semantic comparison of desired and deployed objects.
//!
//! A desired object is satisfied when every field it sets is present with the same
//! value in the deployed object once server populated fields are stripped. Fields the
//! API server adds or defaults never trigger a patch. The maps listed by
//! [`owned_maps`] are written only by the controller and must match key for key.
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use kube::api::DynamicObject;
use serde_json::{Map, Value};

const SERVER_METADATA: [&str; 8] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// Maps of a kind whose keys are all set by the controller, as JSON pointers
pub fn owned_maps(kind: &str) -> &'static [&'static str] {
    match kind {
        "ConfigMap" => &["/data", "/binaryData"],
        "Secret" => &["/data"],
        "Service" => &["/spec/selector"],
        "StatefulSet" => &["/spec/selector/matchLabels", "/spec/template/metadata/labels"],
        _ => &[],
    }
}

fn kind_of(resource: &DynamicObject) -> &str {
    resource.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
}

/// JSON view of an object without status, server metadata and kind specific defaults
pub fn normalize(resource: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(resource)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA {
                metadata.remove(field);
            }
        }
    }
    match kind_of(resource) {
        "Secret" => normalize_secret(&mut value),
        "Service" => normalize_service(&mut value),
        "StatefulSet" => normalize_statefulset(&mut value),
        _ => {}
    }
    Ok(value)
}

/// `stringData` is write only, the API server stores it encoded in `data`
fn normalize_secret(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    let Some(Value::Object(string_data)) = object.remove("stringData") else {
        return;
    };
    let data = object
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(data) = data.as_object_mut() {
        for (key, entry) in string_data {
            if let Some(text) = entry.as_str() {
                data.insert(key, Value::String(STANDARD.encode(text)));
            }
        }
    }
}

/// Cluster IPs are allocated by the API server, only headless services set them
fn normalize_service(value: &mut Value) {
    let Some(spec) = value.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    if spec.get("clusterIP").and_then(Value::as_str) != Some("None") {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
    }
}

fn normalize_statefulset(value: &mut Value) {
    let templates = value
        .pointer_mut("/spec/volumeClaimTemplates")
        .and_then(Value::as_array_mut);
    for template in templates.into_iter().flatten() {
        if let Some(template) = template.as_object_mut() {
            template.remove("status");
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(object) => object.is_empty(),
        Value::Array(array) => array.is_empty(),
        _ => false,
    }
}

/// Every field set in `desired` has the same value in `deployed`.
///
/// Arrays must have the same length and are compared element by element.
pub fn is_contained(desired: &Value, deployed: &Value) -> bool {
    match (desired, deployed) {
        (Value::Object(desired), Value::Object(deployed)) => {
            desired.iter().all(|(key, value)| match deployed.get(key) {
                Some(deployed) => is_contained(value, deployed),
                None => is_empty(value),
            })
        }
        (Value::Array(desired), Value::Array(deployed)) => {
            desired.len() == deployed.len()
                && desired
                    .iter()
                    .zip(deployed)
                    .all(|(desired, deployed)| is_contained(desired, deployed))
        }
        _ => desired == deployed || (is_empty(desired) && is_empty(deployed)),
    }
}

/// Minimal JSON merge patch turning `deployed` into a superset of `desired`
pub fn merge_patch(desired: &Value, deployed: &Value) -> Value {
    match (desired, deployed) {
        (Value::Object(desired), Value::Object(deployed)) => {
            let mut patch = Map::new();
            for (key, value) in desired {
                match deployed.get(key) {
                    Some(current) if is_contained(value, current) => {}
                    None if is_empty(value) => {}
                    Some(current @ Value::Object(_)) if value.is_object() => {
                        patch.insert(key.clone(), merge_patch(value, current));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// Keys of the map at `pointer` in `deployed` that `desired` does not set
fn removed_keys(desired: &Value, deployed: &Value, pointer: &str) -> Vec<String> {
    let Some(Value::Object(deployed)) = deployed.pointer(pointer) else {
        return vec![];
    };
    let desired = desired.pointer(pointer).and_then(Value::as_object);
    deployed
        .keys()
        .filter(|key| !desired.is_some_and(|desired| desired.contains_key(*key)))
        .cloned()
        .collect()
}

/// Set `key` to `null` in the object at `pointer`, creating the missing parents
fn remove_in_patch(patch: &mut Value, pointer: &str, key: String) {
    let mut current = patch;
    for segment in pointer.split('/').skip(1) {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(key, Value::Null);
    }
}

pub fn semantically_equal(desired: &DynamicObject, deployed: &DynamicObject) -> Result<bool> {
    let (desired_value, deployed_value) = (normalize(desired)?, normalize(deployed)?);
    Ok(is_contained(&desired_value, &deployed_value)
        && owned_maps(kind_of(desired))
            .iter()
            .all(|pointer| removed_keys(&desired_value, &deployed_value, pointer).is_empty()))
}

/// Merge patch setting the desired fields and removing the keys of the owned maps
/// that are no longer desired
pub fn patch_for(desired: &DynamicObject, deployed: &DynamicObject) -> Result<Value> {
    let (desired_value, deployed_value) = (normalize(desired)?, normalize(deployed)?);
    let mut patch = merge_patch(&desired_value, &deployed_value);
    for pointer in owned_maps(kind_of(desired)) {
        for key in removed_keys(&desired_value, &deployed_value, pointer) {
            remove_in_patch(&mut patch, pointer, key);
        }
    }
    Ok(patch)
}
