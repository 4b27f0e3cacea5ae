//! Transform function registry and the built-in functions
//!
//! # Built-in Functions
//!
//! | name | params |
//! |------|--------|
//! | `uppercase`, `lowercase` | - |
//! | `trim` | `chars` (default: whitespace) |
//! | `truncate` | `length`, `suffix` (default `...`) |
//! | `replace` | `search`, `replace` |
//! | `regex_replace` | `pattern`, `replacement` |
//! | `format_date` | `format` (strftime), `input_format` |
//! | `number_format` | `decimals` (2), `decimal_separator` (`.`), `thousands_separator` (`,`) |
//! | `json_encode`, `json_decode` | - |
//! | `array_slice` | `offset`, `length` |
//! | `array_filter` | - |
//! | `array_map` | `field` |
//! | `concatenate` | `strings`, `separator` (empty) |
//! | `default_value` | `default` |

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::pattern;
use super::path::lookup;
use super::value::{as_number, display, is_truthy, scalar_text};
use crate::error::{Error, Result};
use crate::transforms::Params;

/// A transform function: `(value, params) -> new value`, or a failure message.
///
/// Functions are never called with `null`.
pub type TransformFn = Arc<dyn Fn(&Value, &Params) -> std::result::Result<Value, String> + Send + Sync>;

/// Name -> function map. Registering an existing name replaces it.
#[derive(Clone)]
pub struct TransformRegistry {
    functions: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    /// Registry holding every built-in function
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtins();
        registry
    }

    /// Registry with no functions at all
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register (or replace) a named function
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Value, &Params) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Whether a function with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run a function by name
    pub fn apply(&self, name: &str, value: &Value, params: &Params) -> Result<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| Error::UnknownTransform {
                function: name.to_string(),
            })?;
        function(value, params).map_err(|message| Error::Transform {
            transform: name.to_string(),
            message,
        })
    }

    fn register_builtins(&mut self) {
        self.register("uppercase", |v, _| Ok(map_text(v, |s| s.to_uppercase())));
        self.register("lowercase", |v, _| Ok(map_text(v, |s| s.to_lowercase())));
        self.register("trim", trim);
        self.register("truncate", truncate);
        self.register("replace", replace);
        self.register("regex_replace", regex_replace);
        self.register("format_date", format_date);
        self.register("number_format", number_format);
        self.register("json_encode", |v, _| {
            serde_json::to_string(v)
                .map(Value::String)
                .map_err(|e| e.to_string())
        });
        self.register("json_decode", json_decode);
        self.register("array_slice", array_slice);
        self.register("array_filter", array_filter);
        self.register("array_map", array_map);
        self.register("concatenate", concatenate);
        self.register("default_value", default_value);
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

type FnResult = std::result::Result<Value, String>;

/// Apply `f` to the text of a scalar; other values pass through untouched.
fn map_text(value: &Value, f: impl FnOnce(&str) -> String) -> Value {
    match scalar_text(value) {
        Some(text) => Value::String(f(&text)),
        None => value.clone(),
    }
}

fn opt_str(params: &Params, key: &str) -> Option<String> {
    params.get(key).and_then(scalar_text)
}

fn opt_i64(params: &Params, key: &str) -> std::result::Result<Option<i64>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_number(v)
            .filter(|n| n.fract() == 0.0)
            .map(|n| Some(n as i64))
            .ok_or_else(|| format!("parameter '{}' must be an integer", key)),
    }
}

fn opt_usize(params: &Params, key: &str) -> std::result::Result<Option<usize>, String> {
    match opt_i64(params, key)? {
        Some(n) if n < 0 => Err(format!("parameter '{}' must not be negative", key)),
        other => Ok(other.map(|n| n as usize)),
    }
}

fn require<T>(value: Option<T>, key: &str) -> std::result::Result<T, String> {
    value.ok_or_else(|| format!("missing parameter '{}'", key))
}

fn trim(value: &Value, params: &Params) -> FnResult {
    Ok(match opt_str(params, "chars") {
        Some(chars) => map_text(value, |s| s.trim_matches(|c: char| chars.contains(c)).to_string()),
        None => map_text(value, |s| {
            s.trim_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string()
        }),
    })
}

fn truncate(value: &Value, params: &Params) -> FnResult {
    let length = require(opt_usize(params, "length")?, "length")?;
    let suffix = opt_str(params, "suffix").unwrap_or_else(|| "...".to_string());
    Ok(map_text(value, |s| truncate_text(s, length, &suffix)))
}

fn truncate_text(text: &str, length: usize, suffix: &str) -> String {
    if text.chars().count() <= length {
        return text.to_string();
    }
    let suffix_len = suffix.chars().count();
    if length <= suffix_len {
        return suffix.chars().take(length).collect();
    }
    let mut out: String = text.chars().take(length - suffix_len).collect();
    out.push_str(suffix);
    out
}

fn replace(value: &Value, params: &Params) -> FnResult {
    let search = require(opt_str(params, "search"), "search")?;
    let replacement = opt_str(params, "replace").unwrap_or_default();
    if search.is_empty() {
        return Ok(value.clone());
    }
    Ok(map_text(value, |s| s.replace(&search, &replacement)))
}

fn regex_replace(value: &Value, params: &Params) -> FnResult {
    let raw = require(opt_str(params, "pattern"), "pattern")?;
    let regex = pattern::compile(&raw).map_err(|e| format!("invalid pattern '{}': {}", raw, e))?;
    let replacement = pattern::replacement(&opt_str(params, "replacement").unwrap_or_default());
    Ok(map_text(value, |s| {
        regex.replace_all(s, replacement.as_str()).into_owned()
    }))
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%d %B %Y",
];

fn parse_with_format(text: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

fn parse_date(value: &Value, input_format: Option<&str>) -> Option<NaiveDateTime> {
    if let Value::Number(n) = value {
        return DateTime::from_timestamp(n.as_i64()?, 0).map(|dt| dt.naive_utc());
    }

    let text = value.as_str()?.trim();
    if let Some(format) = input_format {
        return parse_with_format(text, format);
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        return DateTime::from_timestamp(text.parse().ok()?, 0).map(|dt| dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.naive_local());
    }
    DATETIME_FORMATS
        .iter()
        .chain(DATE_FORMATS)
        .find_map(|format| parse_with_format(text, format))
}

fn format_date(value: &Value, params: &Params) -> FnResult {
    let format = opt_str(params, "format").unwrap_or_else(|| "%Y-%m-%d".to_string());
    let input_format = opt_str(params, "input_format");

    let Some(parsed) = parse_date(value, input_format.as_deref()) else {
        return Ok(value.clone());
    };

    let mut out = String::new();
    write!(out, "{}", parsed.format(&format))
        .map_err(|_| format!("invalid date format '{}'", format))?;
    Ok(Value::String(out))
}

fn number_format(value: &Value, params: &Params) -> FnResult {
    let Some(number) = as_number(value) else {
        return Ok(value.clone());
    };
    let decimals = opt_usize(params, "decimals")?.unwrap_or(2);
    let decimal_separator = opt_str(params, "decimal_separator").unwrap_or_else(|| ".".into());
    let thousands_separator =
        opt_str(params, "thousands_separator").unwrap_or_else(|| ",".into());

    let factor = 10f64.powi(decimals as i32);
    let rounded = (number * factor).round() / factor;
    let fixed = format!("{:.*}", decimals, rounded.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));

    let digits: Vec<char> = whole.chars().collect();
    let mut grouped = String::new();
    for (i, digit) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(&thousands_separator);
        }
        grouped.push(*digit);
    }

    let mut out = String::new();
    if rounded < 0.0 {
        out.push('-');
    }
    out.push_str(&grouped);
    if decimals > 0 {
        out.push_str(&decimal_separator);
        out.push_str(fraction);
    }
    Ok(Value::String(out))
}

fn json_decode(value: &Value, _params: &Params) -> FnResult {
    match value {
        Value::String(s) => serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e)),
        other => Ok(other.clone()),
    }
}

fn array_slice(value: &Value, params: &Params) -> FnResult {
    let Value::Array(items) = value else {
        return Ok(value.clone());
    };
    let len = items.len() as i64;
    let offset = opt_i64(params, "offset")?.unwrap_or(0);
    let start = if offset < 0 {
        (len + offset).max(0)
    } else {
        offset.min(len)
    };
    let end = match opt_i64(params, "length")? {
        None => len,
        Some(l) if l < 0 => (len + l).max(start),
        Some(l) => start.saturating_add(l).min(len),
    };
    Ok(Value::Array(items[start as usize..end as usize].to_vec()))
}

fn array_filter(value: &Value, _params: &Params) -> FnResult {
    Ok(match value {
        Value::Array(items) => Value::Array(items.iter().filter(|v| is_truthy(v)).cloned().collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| is_truthy(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    })
}

fn array_map(value: &Value, params: &Params) -> FnResult {
    let field = require(opt_str(params, "field"), "field")?;
    let Value::Array(items) = value else {
        return Ok(value.clone());
    };
    Ok(Value::Array(
        items
            .iter()
            .map(|item| match item {
                Value::Object(_) => lookup(item, &field),
                _ => Value::Null,
            })
            .collect(),
    ))
}

fn concatenate(value: &Value, params: &Params) -> FnResult {
    let separator = opt_str(params, "separator").unwrap_or_default();
    let mut parts: Vec<String> = match value {
        Value::Array(items) => items.iter().map(display).collect(),
        other => vec![display(other)],
    };
    match params.get("strings") {
        Some(Value::Array(extra)) => parts.extend(extra.iter().map(display)),
        Some(Value::Null) | None => {}
        Some(other) => parts.push(display(other)),
    }
    Ok(Value::String(parts.join(&separator)))
}

fn default_value(value: &Value, params: &Params) -> FnResult {
    let empty = value.is_null() || value.as_str().is_some_and(str::is_empty);
    if empty {
        Ok(params.get("default").cloned().unwrap_or(Value::Null))
    } else {
        Ok(value.clone())
    }
}
