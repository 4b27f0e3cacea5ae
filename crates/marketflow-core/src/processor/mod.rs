//! Data processing between workflow units
//!
//! The processor is a set of pure operations over JSON values:
//!
//! - **field mapping**: copy values from dot paths in a source document to
//!   dot paths in a fresh output document
//! - **transformations**: run named functions from the [`TransformRegistry`]
//!   over individual fields
//! - **validation**: run named rules from the [`RuleRegistry`] over fields
//!   and collect every failure
//!
//! Both registries can be extended at runtime; the last registration for a
//! name wins.

mod functions;
mod pattern;
mod rules;

pub mod path;
pub mod value;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::transforms::{FieldMapping, Params, Transformation, ValidationRules};

pub use functions::{TransformFn, TransformRegistry};
pub use path::{get_path, lookup, set_path};
pub use rules::{RuleFn, RuleRegistry};

/// Outcome of [`DataProcessor::validate_data`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when `errors` is empty
    pub valid: bool,

    /// One formatted message per failed rule
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Field mapping, transformation and validation with pluggable registries
#[derive(Debug, Clone, Default)]
pub struct DataProcessor {
    transforms: TransformRegistry,
    rules: RuleRegistry,
}

impl DataProcessor {
    /// Processor with all built-in functions and rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor with custom registries
    pub fn with_registries(transforms: TransformRegistry, rules: RuleRegistry) -> Self {
        Self { transforms, rules }
    }

    /// The transform function registry
    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// The validation rule registry
    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Register an additional transform function
    pub fn register_transform<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Value, &Params) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.transforms.register(name, function);
    }

    /// Register an additional validation rule
    pub fn register_rule<F>(&mut self, name: impl Into<String>, rule: F)
    where
        F: Fn(&Value, &Params) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.register(name, rule);
    }

    /// Build a new document from `source` according to `mapping`.
    ///
    /// An empty mapping list is the identity. Otherwise the output starts
    /// empty and each usable mapping copies a non-null value across, in list
    /// order, so overlapping targets resolve last-write-wins.
    pub fn apply_field_mapping(&self, source: &Value, mapping: &[FieldMapping]) -> Value {
        if mapping.is_empty() {
            return source.clone();
        }

        let mut output = Value::Object(Map::new());
        for entry in mapping.iter().filter(|m| m.is_usable()) {
            let value = match get_path(source, &entry.source_path) {
                Some(v) if !v.is_null() => v.clone(),
                _ => match &entry.default_value {
                    Some(default) => default.clone(),
                    None => {
                        if entry.required {
                            tracing::warn!(
                                source = %entry.source_path,
                                target = %entry.target_path,
                                "required mapping has no value"
                            );
                        }
                        continue;
                    }
                },
            };
            set_path(&mut output, &entry.target_path, value);
        }
        output
    }

    /// Run `transformations` in order over a copy of `data`.
    ///
    /// Null fields are skipped. The first failure (including an unknown
    /// function name) aborts the batch and nothing is returned.
    pub fn apply_transformations(
        &self,
        data: &Value,
        transformations: &[Transformation],
    ) -> Result<Value> {
        let mut working = data.clone();
        for transformation in transformations {
            let current = lookup(&working, &transformation.field_path);
            if current.is_null() {
                if !self.transforms.contains(&transformation.function_name) {
                    return Err(Error::UnknownTransform {
                        function: transformation.function_name.clone(),
                    });
                }
                continue;
            }
            let transformed = self.transforms.apply(
                &transformation.function_name,
                &current,
                &transformation.params,
            )?;
            if transformation.field_path.is_empty() {
                working = transformed;
            } else {
                set_path(&mut working, &transformation.field_path, transformed);
            }
        }
        Ok(working)
    }

    /// Evaluate every rule for every field and collect all failures.
    ///
    /// Messages read `Field "<path>": <message>`. A rule name missing from the
    /// registry produces a failure message rather than an error.
    pub fn validate_data(&self, data: &Value, rules: &ValidationRules) -> ValidationReport {
        let mut errors = Vec::new();
        for (path, field_rules) in rules.iter() {
            let value = lookup(data, path);
            for rule in field_rules {
                let message = match self.rules.check(&rule.rule_name, &value, &rule.params) {
                    Ok(Ok(())) => continue,
                    Ok(Err(default_message)) => rule
                        .custom_message
                        .clone()
                        .unwrap_or(default_message),
                    Err(unknown) => unknown.to_string(),
                };
                errors.push(format!("Field \"{}\": {}", path, message));
            }
        }
        ValidationReport::from_errors(errors)
    }
}
