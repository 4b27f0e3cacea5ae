//! `{{ path }}` placeholder substitution
//!
//! Placeholders are resolved against the run context with dot-path lookup.
//! An unresolved placeholder (missing or null) is left in the text as-is so
//! it stays visible in step results.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::processor::get_path;
use crate::processor::value::display;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Replace every placeholder in `template` with its context value.
pub fn substitute(template: &str, context: &Value) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match get_path(context, &caps[1]) {
            Some(value) if !value.is_null() => display(value),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute every string inside `value`, recursing through arrays and
/// objects. Keys are left untouched.
pub fn substitute_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, context)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(substitute_map(map, context)),
        other => other.clone(),
    }
}

/// [`substitute_value`] over a parameter map
pub fn substitute_map(map: &Map<String, Value>, context: &Value) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, context)))
        .collect()
}

/// The path of a string that is exactly one placeholder, e.g. `{{ a.b }}`
pub fn sole_placeholder(text: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(text.trim())?;
    let whole = caps.get(0)?;
    if whole.as_str().len() != text.trim().len() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "keyword": "rust",
            "fetch": {"count": 3, "items": [{"url": "a"}], "empty": null},
        })
    }

    #[test]
    fn test_substitute_scalars() {
        let out = substitute("{{keyword}} x{{ fetch.count }}", &context());
        assert_eq!(out, "rust x3");
    }

    #[test]
    fn test_substitute_containers_as_json() {
        let out = substitute("items={{fetch.items}}", &context());
        assert_eq!(out, r#"items=[{"url":"a"}]"#);
    }

    #[test]
    fn test_unresolved_placeholder_left_visible() {
        let out = substitute("{{ missing.path }} / {{fetch.empty}}", &context());
        assert_eq!(out, "{{ missing.path }} / {{fetch.empty}}");
    }

    #[test]
    fn test_substitute_value_recurses() {
        let params = json!({"q": "{{keyword}}", "opts": [{"n": "{{fetch.count}}"}, 5]});
        let out = substitute_value(&params, &context());
        assert_eq!(out, json!({"q": "rust", "opts": [{"n": "3"}, 5]}));
    }

    #[test]
    fn test_sole_placeholder() {
        assert_eq!(sole_placeholder("{{ fetch.items }}"), Some("fetch.items"));
        assert_eq!(sole_placeholder("x {{a}}"), None);
        assert_eq!(sole_placeholder("a.b"), None);
    }
}
