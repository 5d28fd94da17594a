use serde_json::Value;

/// Deep-merges `overlay` into `base`. Plain objects merge recursively;
/// arrays and primitives replace; `null` overlay keys are ignored so sparse
/// documents can omit leaves without clearing them.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

/// Convenience form returning the merged document.
pub fn merged(base: &Value, overlay: &Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, overlay);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_recursively() {
        let base = json!({"css": {"minify": true, "inlineCritical": true}});
        let overlay = json!({"css": {"minify": false}});
        let out = merged(&base, &overlay);
        assert_eq!(out, json!({"css": {"minify": false, "inlineCritical": true}}));
    }

    #[test]
    fn arrays_and_primitives_replace() {
        let base = json!({"list": [1, 2, 3], "n": 1});
        let overlay = json!({"list": [9], "n": 2});
        assert_eq!(merged(&base, &overlay), json!({"list": [9], "n": 2}));
    }

    #[test]
    fn null_overlay_keys_are_ignored() {
        let base = json!({"keep": "me", "nested": {"a": 1}});
        let overlay = json!({"keep": null, "nested": {"a": null, "b": 2}});
        assert_eq!(
            merged(&base, &overlay),
            json!({"keep": "me", "nested": {"a": 1, "b": 2}})
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let base = json!({"a": {"b": 1}, "c": [1, 2]});
        let overlay = json!({"a": {"b": 2}, "c": [3]});
        let once = merged(&base, &overlay);
        let twice = merged(&once, &overlay);
        assert_eq!(once, twice);
    }
}
