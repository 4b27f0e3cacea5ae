//! Data-shaping configuration
//!
//! These are the declarative pieces a workflow attaches to connections and
//! steps. They are parsed here and applied by the [`crate::processor`].
//!
//! # Example
//!
//! ```json
//! {
//!   "field_mapping": [
//!     { "source": "user.profile.name", "target": "full_name" }
//!   ],
//!   "transformations": [
//!     { "field": "full_name", "function": "uppercase" }
//!   ],
//!   "validation_rules": {
//!     "full_name": [{ "rule": "required" }]
//!   }
//! }
//! ```

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Parameters passed to a transform function or validation rule
pub type Params = Map<String, Value>;

/// Copy one value from a dot path in the source to a dot path in the output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dot-notation path read from the source
    #[serde(rename = "source", alias = "source_path", default)]
    pub source_path: String,

    /// Dot-notation path written in the output
    #[serde(rename = "target", alias = "target_path", default)]
    pub target_path: String,

    /// Whether a missing source value should be reported
    #[serde(default)]
    pub required: bool,

    /// Value written when the source resolves to null
    #[serde(
        rename = "default",
        alias = "default_value",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<Value>,
}

impl FieldMapping {
    /// Create a plain source -> target mapping
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_path: source.into(),
            target_path: target.into(),
            required: false,
            default_value: None,
        }
    }

    /// Mark the mapping as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the fallback value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Mappings with an empty path on either side are skipped
    pub fn is_usable(&self) -> bool {
        !self.source_path.is_empty() && !self.target_path.is_empty()
    }
}

/// Apply a named transform function to the value at a path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    /// Dot-notation path of the value to transform
    #[serde(rename = "field", alias = "field_path")]
    pub field_path: String,

    /// Name of a function in the transform registry
    #[serde(rename = "function", alias = "function_name")]
    pub function_name: String,

    /// Function parameters
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Params,
}

impl Transformation {
    /// Create a transformation without parameters
    pub fn new(field: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            field_path: field.into(),
            function_name: function.into(),
            params: Params::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// One named predicate applied to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Name of a rule in the validation registry
    #[serde(rename = "rule", alias = "rule_name")]
    pub rule_name: String,

    /// Rule parameters
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Params,

    /// Replaces the rule's default message on failure
    #[serde(
        rename = "message",
        alias = "custom_message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_message: Option<String>,
}

impl ValidationRule {
    /// Create a rule without parameters
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule_name: rule.into(),
            params: Params::new(),
            custom_message: None,
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Override the failure message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.custom_message = Some(message.into());
        self
    }
}

/// Validation rules keyed by field path, in declaration order
///
/// On the wire this is a JSON object `{ "<path>": [rule, ...] }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationRules(Vec<(String, Vec<ValidationRule>)>);

impl ValidationRules {
    /// Create an empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ValidationRules::insert`]
    pub fn field(mut self, path: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        self.insert(path, rules);
        self
    }

    /// Set the rules for a field, replacing any previous entry
    pub fn insert(&mut self, path: impl Into<String>, rules: Vec<ValidationRule>) {
        let path = path.into();
        match self.0.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = rules,
            None => self.0.push((path, rules)),
        }
    }

    /// Iterate fields and their rules
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ValidationRule])> {
        self.0.iter().map(|(p, r)| (p.as_str(), r.as_slice()))
    }

    /// Number of fields with rules
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no field has rules
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ValidationRules {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (path, rules) in &self.0 {
            map.serialize_entry(path, rules)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ValidationRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut rules = ValidationRules::new();
        for (path, value) in raw {
            let list: Vec<ValidationRule> = serde_json::from_value(value)
                .map_err(|e| D::Error::custom(format!("rules for '{}': {}", path, e)))?;
            rules.insert(path, list);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_field_mapping() {
        let mapping: FieldMapping =
            serde_json::from_value(json!({"source": "user.name", "target": "name"})).unwrap();
        assert_eq!(mapping.source_path, "user.name");
        assert_eq!(mapping.target_path, "name");
        assert!(!mapping.required);
        assert!(mapping.default_value.is_none());
    }

    #[test]
    fn test_parse_field_mapping_long_names() {
        let mapping: FieldMapping = serde_json::from_value(json!({
            "source_path": "a.b",
            "target_path": "c",
            "required": true,
            "default_value": "n/a"
        }))
        .unwrap();
        assert_eq!(mapping.source_path, "a.b");
        assert!(mapping.required);
        assert_eq!(mapping.default_value, Some(json!("n/a")));
    }

    #[test]
    fn test_field_mapping_usable() {
        assert!(FieldMapping::new("a", "b").is_usable());
        assert!(!FieldMapping::new("", "b").is_usable());
        assert!(!FieldMapping::new("a", "").is_usable());
    }

    #[test]
    fn test_parse_transformation() {
        let t: Transformation = serde_json::from_value(json!({
            "field": "title",
            "function": "truncate",
            "params": {"length": 10}
        }))
        .unwrap();
        assert_eq!(t.field_path, "title");
        assert_eq!(t.function_name, "truncate");
        assert_eq!(t.params["length"], 10);
    }

    #[test]
    fn test_parse_validation_rules_keeps_order() {
        let rules: ValidationRules = serde_json::from_value(json!({
            "zeta": [{"rule": "required"}],
            "alpha": [{"rule": "email", "message": "bad email"}]
        }))
        .unwrap();
        let fields: Vec<&str> = rules.iter().map(|(p, _)| p).collect();
        assert_eq!(fields, vec!["zeta", "alpha"]);
        let (_, alpha) = rules.iter().nth(1).unwrap();
        assert_eq!(alpha[0].custom_message.as_deref(), Some("bad email"));
    }

    #[test]
    fn test_validation_rules_serialize_as_object() {
        let rules = ValidationRules::new().field(
            "email",
            vec![ValidationRule::new("min_length").with_param("length", json!(3))],
        );
        let value = serde_json::to_value(&rules).unwrap();
        assert_eq!(
            value,
            json!({"email": [{"rule": "min_length", "params": {"length": 3}}]})
        );
    }

    #[test]
    fn test_validation_rules_reject_bad_entry() {
        let result: Result<ValidationRules, _> =
            serde_json::from_value(json!({"email": "required"}));
        assert!(result.is_err());
    }
}
