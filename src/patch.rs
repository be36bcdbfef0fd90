//! JSON-Patch synthesis over object metadata.
//!
//! Produces the minimal patch that makes a rule's additions present on an
//! object: `add` for missing submaps and keys, `replace` for keys that
//! carry a different value, nothing for keys that already agree.

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use serde_json::{Map, Value};

use crate::rule::Additions;

/// Build the patch that applies `additions` to `object`.
///
/// Returns `None` when nothing needs to change; callers must then omit the
/// patch from the admission response entirely.
///
/// Operation order is fixed: submap creations, then additions, then
/// replacements; labels before annotations within each group, keys in
/// configuration order. `add` cannot create a missing `metadata.labels`
/// container through a per-key path, so absent submaps are probed first and
/// created whole.
pub fn synthesize(object: &Value, additions: &Additions) -> Option<Patch> {
    let mut creations = Vec::new();
    let mut adds = Vec::new();
    let mut replacements = Vec::new();

    for (submap, desired) in [
        ("labels", &additions.labels),
        ("annotations", &additions.annotations),
    ] {
        if desired.is_empty() {
            continue;
        }
        let current = object
            .pointer(&format!("/metadata/{submap}"))
            .and_then(Value::as_object);
        match current {
            None => creations.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", submap]),
                value: Value::Object(
                    desired
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect::<Map<_, _>>(),
                ),
            })),
            Some(current) => {
                for (key, value) in desired {
                    let path = PointerBuf::from_tokens(["metadata", submap, key.as_str()]);
                    match current.get(key) {
                        None => adds.push(PatchOperation::Add(AddOperation {
                            path,
                            value: Value::String(value.clone()),
                        })),
                        Some(present) if present.as_str() == Some(value.as_str()) => {}
                        Some(_) => replacements.push(PatchOperation::Replace(ReplaceOperation {
                            path,
                            value: Value::String(value.clone()),
                        })),
                    }
                }
            }
        }
    }

    let operations: Vec<PatchOperation> = creations
        .into_iter()
        .chain(adds)
        .chain(replacements)
        .collect();
    if operations.is_empty() {
        None
    } else {
        Some(Patch(operations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn additions(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Additions {
        let to_map = |pairs: &[(&str, &str)]| -> IndexMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        Additions {
            labels: to_map(labels),
            annotations: to_map(annotations),
        }
    }

    fn as_json(patch: &Patch) -> Value {
        serde_json::to_value(patch).unwrap()
    }

    #[test]
    fn missing_submap_is_created_whole() {
        let patch = synthesize(&json!({"metadata": {"name": "x"}}), &additions(&[("a", "1")], &[]))
            .unwrap();
        assert_eq!(
            as_json(&patch),
            json!([{"op": "add", "path": "/metadata/labels", "value": {"a": "1"}}])
        );
    }

    #[test]
    fn conflicting_keys_are_replaced_and_agreeing_keys_left_alone() {
        let object = json!({"metadata": {"labels": {"a": "old", "b": "keep"}}});
        let patch = synthesize(&object, &additions(&[("a", "new")], &[])).unwrap();
        assert_eq!(
            as_json(&patch),
            json!([{"op": "replace", "path": "/metadata/labels/a", "value": "new"}])
        );
    }

    #[test]
    fn equal_values_produce_the_empty_patch() {
        let object = json!({"metadata": {"labels": {"a": "1"}}});
        assert!(synthesize(&object, &additions(&[("a", "1")], &[])).is_none());
    }

    #[test]
    fn keys_are_escaped_per_json_pointer_rules() {
        let wanted = additions(&[], &[("my.co/slashy~key", "v")]);

        let bare = synthesize(&json!({"metadata": {}}), &wanted).unwrap();
        assert_eq!(
            as_json(&bare),
            json!([{
                "op": "add",
                "path": "/metadata/annotations",
                "value": {"my.co/slashy~key": "v"}
            }])
        );

        let occupied = synthesize(&json!({"metadata": {"annotations": {"other": "x"}}}), &wanted)
            .unwrap();
        assert_eq!(
            as_json(&occupied),
            json!([{
                "op": "add",
                "path": "/metadata/annotations/my.co~1slashy~0key",
                "value": "v"
            }])
        );
    }

    #[test]
    fn creations_come_before_adds_before_replaces() {
        let object = json!({"metadata": {"labels": {"a": "old"}}});
        let patch = synthesize(
            &object,
            &additions(&[("a", "new"), ("b", "2")], &[("note", "hi")]),
        )
        .unwrap();
        assert_eq!(
            as_json(&patch),
            json!([
                {"op": "add", "path": "/metadata/annotations", "value": {"note": "hi"}},
                {"op": "add", "path": "/metadata/labels/b", "value": "2"},
                {"op": "replace", "path": "/metadata/labels/a", "value": "new"}
            ])
        );
    }

    #[test]
    fn keys_keep_configuration_order() {
        let patch = synthesize(
            &json!({"metadata": {"labels": {}}}),
            &additions(&[("z", "1"), ("a", "2"), ("m", "3")], &[]),
        )
        .unwrap();
        let paths: Vec<String> = as_json(&patch)
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            paths,
            ["/metadata/labels/z", "/metadata/labels/a", "/metadata/labels/m"]
        );
    }

    #[test]
    fn a_null_submap_is_treated_as_missing() {
        let patch = synthesize(
            &json!({"metadata": {"labels": null}}),
            &additions(&[("a", "1")], &[]),
        )
        .unwrap();
        assert_eq!(
            as_json(&patch),
            json!([{"op": "add", "path": "/metadata/labels", "value": {"a": "1"}}])
        );
    }

    #[test]
    fn every_operation_stays_inside_metadata() {
        let object = json!({"metadata": {"labels": {"a": "old"}}, "spec": {"replicas": 1}});
        let patch = synthesize(
            &object,
            &additions(&[("a", "new"), ("b", "2")], &[("c", "3")]),
        )
        .unwrap();
        for op in as_json(&patch).as_array().unwrap() {
            let path = op["path"].as_str().unwrap();
            assert!(
                path.starts_with("/metadata/labels") || path.starts_with("/metadata/annotations"),
                "operation escaped metadata: {path}"
            );
        }
    }

    #[test]
    fn applying_the_patch_makes_the_rerun_empty() {
        let wanted = additions(&[("a", "new"), ("b", "2")], &[("note", "hi")]);
        let mut object = json!({"metadata": {"name": "x", "labels": {"a": "old"}}});

        let patch = synthesize(&object, &wanted).unwrap();
        json_patch::patch(&mut object, &patch.0).unwrap();

        assert!(synthesize(&object, &wanted).is_none());
        assert_eq!(object["metadata"]["labels"]["a"], "new");
        assert_eq!(object["metadata"]["annotations"]["note"], "hi");
    }

    #[test]
    fn empty_additions_produce_no_patch() {
        assert!(synthesize(&json!({"metadata": {}}), &additions(&[], &[])).is_none());
    }
}
