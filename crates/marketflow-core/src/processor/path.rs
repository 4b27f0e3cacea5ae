//! Dot-notation access into JSON values
//!
//! `user.profile.name` walks object keys; a numeric segment such as the `0`
//! in `items.0.id` indexes into an array.

use serde_json::{Map, Value};

/// Borrow the value at `path`, or `None` if any segment is missing.
///
/// An empty path addresses the value itself.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Clone the value at `path`; anything missing reads as `null`.
pub fn lookup(value: &Value, path: &str) -> Value {
    get_path(value, path).cloned().unwrap_or(Value::Null)
}

/// Write `new_value` at `path`, creating intermediate objects as needed.
///
/// A non-container found on the way is replaced by an object. Existing array
/// elements can be overwritten by index, arrays are never grown.
pub fn set_path(target: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = target;
    for segment in parents {
        current = child_mut(current, segment);
    }

    match (array_index(current, last), current) {
        (Some(index), Value::Array(items)) => items[index] = new_value,
        (_, other) => {
            ensure_object(other).insert((*last).to_string(), new_value);
        }
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> &'a mut Value {
    match (array_index(value, segment), value) {
        (Some(index), Value::Array(items)) => &mut items[index],
        (_, other) => ensure_object(other)
            .entry(segment.to_string())
            .or_insert(Value::Null),
    }
}

fn array_index(value: &Value, segment: &str) -> Option<usize> {
    match value {
        Value::Array(items) => segment.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_object() {
        let data = json!({"user": {"profile": {"name": "john"}}});
        assert_eq!(get_path(&data, "user.profile.name"), Some(&json!("john")));
    }

    #[test]
    fn test_get_array_index() {
        let data = json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(get_path(&data, "items.1.id"), Some(&json!(2)));
        assert_eq!(get_path(&data, "items.5.id"), None);
        assert_eq!(get_path(&data, "items.x"), None);
    }

    #[test]
    fn test_missing_intermediate_is_none() {
        let data = json!({"user": "plain"});
        assert_eq!(get_path(&data, "user.profile.name"), None);
        assert_eq!(lookup(&data, "nope.deeper"), Value::Null);
    }

    #[test]
    fn test_empty_path_is_whole_value() {
        let data = json!({"a": 1});
        assert_eq!(get_path(&data, ""), Some(&data));
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut out = json!({});
        set_path(&mut out, "a.b.c", json!(1));
        assert_eq!(out, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_replaces_scalar_parent() {
        let mut out = json!({"a": 5});
        set_path(&mut out, "a.b", json!("x"));
        assert_eq!(out, json!({"a": {"b": "x"}}));
    }

    #[test]
    fn test_set_into_existing_array_element() {
        let mut out = json!({"items": [{"id": 1}, {"id": 2}]});
        set_path(&mut out, "items.1.id", json!(20));
        assert_eq!(out, json!({"items": [{"id": 1}, {"id": 20}]}));
    }

    #[test]
    fn test_set_on_null_root() {
        let mut out = Value::Null;
        set_path(&mut out, "name", json!("x"));
        assert_eq!(out, json!({"name": "x"}));
    }

    #[test]
    fn test_last_write_wins() {
        let mut out = json!({});
        set_path(&mut out, "name", json!("first"));
        set_path(&mut out, "name", json!("second"));
        assert_eq!(out["name"], "second");
    }
}
