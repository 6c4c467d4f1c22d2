use serde_json::Value;

/// Resolve a dot-separated path against a JSON document.
///
/// Traversal returns `None` as soon as it meets `null`, a non-object, or an
/// absent key. Array elements are not addressable by numeric segments.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_keys() {
        let doc = serde_json::json!({"a": {"b": {"c": 7}}});
        assert_eq!(resolve(&doc, "a.b.c"), Some(&serde_json::json!(7)));
        assert_eq!(resolve(&doc, "a.b"), Some(&serde_json::json!({"c": 7})));
    }

    #[test]
    fn missing_intermediate_returns_none() {
        let doc = serde_json::json!({"a": {"b": 1}});
        assert_eq!(resolve(&doc, "a.x.c"), None);
        assert_eq!(resolve(&doc, "x"), None);
    }

    #[test]
    fn null_and_scalars_stop_traversal() {
        let doc = serde_json::json!({"a": null, "b": 3});
        assert_eq!(resolve(&doc, "a.c"), None);
        assert_eq!(resolve(&doc, "b.c"), None);
        assert_eq!(resolve(&doc, "a"), Some(&Value::Null));
    }

    #[test]
    fn arrays_are_not_indexable() {
        let doc = serde_json::json!({"a": [1, 2, 3]});
        assert_eq!(resolve(&doc, "a.0"), None);
    }

    #[test]
    fn empty_segment_is_undefined() {
        let doc = serde_json::json!({"a": 1});
        assert_eq!(resolve(&doc, ""), None);
        assert_eq!(resolve(&doc, "a."), None);
    }
}
