use serde_json::Value;

/// Merge `patch` into `target`: objects merge key by key, recursively;
/// anything else in the patch (arrays, scalars, null) replaces the target value.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, incoming) in src {
                let slot = dst.entry(key.clone()).or_insert(Value::Null);
                if slot.is_object() && incoming.is_object() {
                    deep_merge(slot, incoming);
                } else {
                    *slot = incoming.clone();
                }
            }
        }
        (slot, incoming) => *slot = incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_merge() {
        let mut doc = json!({"data": {"a": 1, "nested": {"keep": true}}, "status": "initialized"});
        deep_merge(&mut doc, &json!({"data": {"b": 2, "nested": {"add": 3}}, "status": "active"}));
        assert_eq!(
            doc,
            json!({"data": {"a": 1, "b": 2, "nested": {"keep": true, "add": 3}}, "status": "active"})
        );
    }

    #[test]
    fn test_arrays_and_scalars_replaced() {
        let mut doc = json!({"list": [1, 2, 3], "n": 1, "obj": {"x": 1}});
        deep_merge(&mut doc, &json!({"list": [9], "n": {"now": "object"}, "obj": 5}));
        assert_eq!(doc, json!({"list": [9], "n": {"now": "object"}, "obj": 5}));
    }

    #[test]
    fn test_null_replaces() {
        let mut doc = json!({"pnl": 10.0});
        deep_merge(&mut doc, &json!({"pnl": null}));
        assert_eq!(doc["pnl"], Value::Null);
    }

    #[test]
    fn test_non_object_target_replaced_wholesale() {
        let mut doc = json!(42);
        deep_merge(&mut doc, &json!({"x": 1}));
        assert_eq!(doc, json!({"x": 1}));
    }
}
