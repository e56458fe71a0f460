//! JSON-level snapshot diffing
//!
//! Snapshots store each resource as one JSON object. Diffing happens at the
//! JSON level only: nested metadata blobs are compared as opaque values,
//! never interpreted. Applying the emitted diff to the previous snapshot
//! must reproduce the current one exactly; `apply_fields` exists so tests
//! can assert that round trip.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::change::{Operation, ResourceChange};

/// Minimal field-by-field diff between two snapshot objects.
///
/// Emits every key whose value differs, keys new in `curr`, and keys that
/// vanished from `prev` (as explicit nulls, so applying the diff removes
/// them observably).
pub fn field_diff(prev: &Map<String, Value>, curr: &Map<String, Value>) -> Map<String, Value> {
    let mut diff = Map::new();

    for (key, curr_value) in curr {
        match prev.get(key) {
            Some(prev_value) if prev_value == curr_value => {}
            _ => {
                diff.insert(key.clone(), curr_value.clone());
            }
        }
    }

    for key in prev.keys() {
        if !curr.contains_key(key) {
            diff.insert(key.clone(), Value::Null);
        }
    }

    diff
}

/// Classify the transition of one resource between two snapshots.
///
/// Returns `None` when the row is unchanged (present on both sides with
/// identical fields) or absent on both sides.
pub fn classify(
    id: Uuid,
    prev: Option<&Map<String, Value>>,
    curr: Option<&Map<String, Value>>,
) -> Option<ResourceChange> {
    match (prev, curr) {
        (None, None) => None,
        (None, Some(curr)) => Some(ResourceChange {
            id,
            operation: Operation::Insert,
            changes: Some(Value::Object(curr.clone())),
        }),
        (Some(_), None) => Some(ResourceChange {
            id,
            operation: Operation::Delete,
            changes: None,
        }),
        (Some(prev), Some(curr)) => {
            let diff = field_diff(prev, curr);
            if diff.is_empty() {
                None
            } else {
                Some(ResourceChange {
                    id,
                    operation: Operation::Update,
                    changes: Some(Value::Object(diff)),
                })
            }
        }
    }
}

/// Apply a field diff to a snapshot object, in place.
///
/// Null-valued diff entries delete the key, mirroring how `field_diff`
/// encodes removals.
pub fn apply_fields(state: &mut Map<String, Value>, diff: &Map<String, Value>) {
    for (key, value) in diff {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_field_diff_emits_only_changed_fields() {
        let prev = obj(json!({"name": "a", "position": {"x": 1}, "color": "red"}));
        let curr = obj(json!({"name": "a", "position": {"x": 2}, "color": "red"}));

        let diff = field_diff(&prev, &curr);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["position"], json!({"x": 2}));
    }

    #[test]
    fn test_field_diff_removed_key_becomes_null() {
        let prev = obj(json!({"name": "a", "tag": "x"}));
        let curr = obj(json!({"name": "a"}));

        let diff = field_diff(&prev, &curr);
        assert_eq!(diff["tag"], Value::Null);
    }

    #[test]
    fn test_classify_insert_carries_full_record() {
        let curr = obj(json!({"name": "fresh", "meta": {"a": 1}}));
        let change = classify(Uuid::new_v4(), None, Some(&curr)).unwrap();

        assert_eq!(change.operation, Operation::Insert);
        assert_eq!(change.changes.unwrap(), Value::Object(curr));
    }

    #[test]
    fn test_classify_delete_has_no_fields() {
        let prev = obj(json!({"name": "gone"}));
        let change = classify(Uuid::new_v4(), Some(&prev), None).unwrap();

        assert_eq!(change.operation, Operation::Delete);
        assert!(change.changes.is_none());
    }

    #[test]
    fn test_classify_unchanged_is_none() {
        let row = obj(json!({"name": "same", "meta": {"nested": [1, 2]}}));
        assert!(classify(Uuid::new_v4(), Some(&row), Some(&row)).is_none());
    }

    #[test]
    fn test_diff_apply_round_trip() {
        let prev = obj(json!({
            "general__entity_name": "Test WS Update Entity",
            "meta__data": {"test_script_1": {"test_property": "lol"}},
            "group__sync": "public.NORMAL",
            "stale": true
        }));
        let curr = obj(json!({
            "general__entity_name": "Test WS Update Entity",
            "meta__data": {"test_script_1": {"test_property": "updated"}},
            "group__sync": "public.NORMAL",
            "fresh": 1
        }));

        let diff = field_diff(&prev, &curr);
        let mut applied = prev.clone();
        apply_fields(&mut applied, &diff);

        assert_eq!(applied, curr);
    }

    #[test]
    fn test_metadata_compared_as_opaque_value() {
        // Same nested structure, different leaf: the whole blob is re-emitted,
        // never a partial path into it.
        let prev = obj(json!({"meta__data": {"a": {"b": 1, "c": 2}}}));
        let curr = obj(json!({"meta__data": {"a": {"b": 1, "c": 3}}}));

        let diff = field_diff(&prev, &curr);
        assert_eq!(diff["meta__data"], json!({"a": {"b": 1, "c": 3}}));
    }
}
