use serde_json::{Map, Value};

/// Walks the override tree against the defaults and emits a tree of `true`
/// booleans wherever a leaf present in the override differs from the
/// default. Untouched leaves are omitted.
pub fn overridden_leaves(default: &Value, override_doc: &Value) -> Value {
    match (default, override_doc) {
        (Value::Object(default_map), Value::Object(override_map)) => {
            let mut out = Map::new();
            for (key, override_value) in override_map {
                if override_value.is_null() {
                    continue;
                }
                match default_map.get(key) {
                    Some(default_value)
                        if default_value.is_object() && override_value.is_object() =>
                    {
                        let nested = overridden_leaves(default_value, override_value);
                        if nested.as_object().is_some_and(|m| !m.is_empty()) {
                            out.insert(key.clone(), nested);
                        }
                    }
                    Some(default_value) => {
                        if default_value != override_value {
                            out.insert(key.clone(), Value::Bool(true));
                        }
                    }
                    None => {
                        out.insert(key.clone(), Value::Bool(true));
                    }
                }
            }
            Value::Object(out)
        }
        _ => {
            if default == override_doc {
                Value::Object(Map::new())
            } else {
                Value::Bool(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_differing_leaves_appear() {
        let default = json!({"css": {"minify": true, "inlineCritical": true}, "js": {"defer": true}});
        let override_doc = json!({"css": {"minify": false, "inlineCritical": true}});
        assert_eq!(
            overridden_leaves(&default, &override_doc),
            json!({"css": {"minify": true}})
        );
    }

    #[test]
    fn identical_override_produces_empty_tree() {
        let default = json!({"a": {"b": 1}});
        assert_eq!(
            overridden_leaves(&default, &default),
            json!({})
        );
    }

    #[test]
    fn diff_round_trips_with_merge() {
        // Every leaf present in the sparse override that differs from the
        // default appears in the diff, and nothing else does.
        let default = serde_json::to_value(mls_types::SiteSettings::default()).unwrap();
        let sparse = json!({
            "css": {"purgeAggressiveness": "aggressive"},
            "images": {"standardQuality": 70}
        });
        let merged = crate::merge::merged(&default, &sparse);
        let diff = overridden_leaves(&default, &merged);
        // standardQuality 70 equals the default, so only the css leaf shows.
        assert_eq!(diff, json!({"css": {"purgeAggressiveness": true}}));
    }
}
