//! Validation rule registry and the built-in rules
//!
//! A rule returns `Ok(())` when the value passes and `Err(message)` with its
//! default message when it does not. Rules are applied to `null` too, so that
//! `email` on a missing field fails instead of being silently skipped.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::pattern;
use super::value::{as_number, display, is_blank, scalar_text};
use crate::error::{Error, Result};
use crate::transforms::Params;

/// A validation predicate: `(value, params) -> Ok | Err(default message)`
pub type RuleFn = Arc<dyn Fn(&Value, &Params) -> std::result::Result<(), String> + Send + Sync>;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("email pattern is valid")
});

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://[^\s/?#@]+(?:@[^\s/?#]+)?(?:[/?#]\S*)?$")
        .expect("url pattern is valid")
});

/// Name -> rule map. Registering an existing name replaces it.
#[derive(Clone)]
pub struct RuleRegistry {
    rules: HashMap<String, RuleFn>,
}

impl RuleRegistry {
    /// Registry holding every built-in rule
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtins();
        registry
    }

    /// Registry with no rules at all
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Register (or replace) a named rule
    pub fn register<F>(&mut self, name: impl Into<String>, rule: F)
    where
        F: Fn(&Value, &Params) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.insert(name.into(), Arc::new(rule));
    }

    /// Whether a rule with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Evaluate a rule by name.
    ///
    /// The outer error is for an unknown rule; the inner result is the
    /// verdict.
    pub fn check(
        &self,
        name: &str,
        value: &Value,
        params: &Params,
    ) -> Result<std::result::Result<(), String>> {
        let rule = self.rules.get(name).ok_or_else(|| Error::UnknownValidationRule {
            rule: name.to_string(),
        })?;
        Ok(rule(value, params))
    }

    fn register_builtins(&mut self) {
        self.register("required", |v, _| {
            verdict(!is_blank(v), || "This field is required".into())
        });
        self.register("string", |v, _| verdict(v.is_string(), || "Must be a string".into()));
        self.register("integer", |v, _| {
            let ok = match v {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
                _ => false,
            };
            verdict(ok, || "Must be an integer".into())
        });
        self.register("number", |v, _| {
            verdict(as_number(v).is_some(), || "Must be a number".into())
        });
        self.register("email", |v, _| {
            let ok = v.as_str().is_some_and(|s| EMAIL.is_match(s));
            verdict(ok, || "Must be a valid email address".into())
        });
        self.register("url", |v, _| {
            let ok = v.as_str().is_some_and(|s| URL.is_match(s));
            verdict(ok, || "Must be a valid URL".into())
        });
        self.register("min_length", |v, p| {
            let length = param_usize(p, "length")?;
            let ok = text_length(v).is_some_and(|n| n >= length);
            verdict(ok, || format!("Must be at least {} characters long", length))
        });
        self.register("max_length", |v, p| {
            let length = param_usize(p, "length")?;
            let ok = text_length(v).is_some_and(|n| n <= length);
            verdict(ok, || format!("Must not exceed {} characters", length))
        });
        self.register("min_value", |v, p| {
            let (limit, shown) = param_number(p, "value")?;
            let ok = as_number(v).is_some_and(|n| n >= limit);
            verdict(ok, || format!("Must be at least {}", shown))
        });
        self.register("max_value", |v, p| {
            let (limit, shown) = param_number(p, "value")?;
            let ok = as_number(v).is_some_and(|n| n <= limit);
            verdict(ok, || format!("Must not exceed {}", shown))
        });
        self.register("in", |v, p| {
            let values = param_list(p, "values")?;
            verdict(values.contains(v), || {
                format!("Must be one of: {}", joined(values))
            })
        });
        self.register("not_in", |v, p| {
            let values = param_list(p, "values")?;
            verdict(!values.contains(v), || {
                format!("Must not be one of: {}", joined(values))
            })
        });
        self.register("regex", |v, p| {
            let raw = p
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| "Rule parameter 'pattern' is missing".to_string())?;
            let regex = pattern::compile(raw).map_err(|_| format!("Invalid pattern '{}'", raw))?;
            let ok = scalar_text(v).is_some_and(|s| regex.is_match(&s));
            verdict(ok, || "Does not match the required pattern".into())
        });
        self.register("array", |v, _| verdict(v.is_array(), || "Must be an array".into()));
        self.register("array_min_length", |v, p| {
            let length = param_usize(p, "length")?;
            let ok = v.as_array().is_some_and(|items| items.len() >= length);
            verdict(ok, || format!("Must contain at least {} items", length))
        });
        self.register("array_max_length", |v, p| {
            let length = param_usize(p, "length")?;
            let ok = v.as_array().is_some_and(|items| items.len() <= length);
            verdict(ok, || format!("Must not contain more than {} items", length))
        });
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.names())
            .finish()
    }
}

fn verdict(ok: bool, message: impl FnOnce() -> String) -> std::result::Result<(), String> {
    if ok { Ok(()) } else { Err(message()) }
}

/// Character count of a scalar; `null` counts as empty.
fn text_length(value: &Value) -> Option<usize> {
    match value {
        Value::Null => Some(0),
        other => scalar_text(other).map(|s| s.chars().count()),
    }
}

fn param_usize(params: &Params, key: &str) -> std::result::Result<usize, String> {
    params
        .get(key)
        .and_then(as_number)
        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
        .map(|n| n as usize)
        .ok_or_else(|| format!("Rule parameter '{}' is missing or invalid", key))
}

fn param_number(params: &Params, key: &str) -> std::result::Result<(f64, String), String> {
    let raw = params
        .get(key)
        .ok_or_else(|| format!("Rule parameter '{}' is missing or invalid", key))?;
    let number =
        as_number(raw).ok_or_else(|| format!("Rule parameter '{}' is missing or invalid", key))?;
    Ok((number, display(raw)))
}

fn param_list<'a>(params: &'a Params, key: &str) -> std::result::Result<&'a Vec<Value>, String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("Rule parameter '{}' is missing or invalid", key))
}

fn joined(values: &[Value]) -> String {
    values.iter().map(display).collect::<Vec<_>>().join(", ")
}
