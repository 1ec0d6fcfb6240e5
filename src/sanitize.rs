//! Metadata sanitizer.
//!
//! Turns a host-supplied value tree into a bounded, markup-free JSON tree.
//! Strings are always cleaned and truncated. Whether the container limits
//! (depth, key count, array length) truncate or reject depends on the
//! [`Mode`] of the [`Limits`] in use: custom-event metadata is strict,
//! everything else is lenient. The serialized size limit always rejects.
//!
//! Host values may share structure and may contain cycles, so shared nodes
//! are modeled as [`SharedValue`] and tracked by address along the current
//! path. A node revisited on its own path is a cycle.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::model::Metadata;

/// A shared, possibly self-referencing node of a host value tree.
pub type SharedValue = Arc<RwLock<RawValue>>;

/// A value as handed over by the embedding page, before sanitizing.
#[derive(Debug, Clone)]
pub enum RawValue {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RawValue>),
    Object(Vec<(String, RawValue)>),
    Function,
    Symbol(String),
    /// An instance of something other than a plain object (a date, a map,
    /// a DOM node, ...). Carries the constructor name for error messages.
    Instance(String),
    Shared(SharedValue),
}

impl RawValue {
    pub fn shared(value: RawValue) -> SharedValue {
        Arc::new(RwLock::new(value))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, RawValue)>) -> Self {
        RawValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Undefined => "undefined",
            RawValue::Bool(_) => "boolean",
            RawValue::Number(_) => "number",
            RawValue::String(_) => "string",
            RawValue::Array(_) => "array",
            RawValue::Object(_) => "object",
            RawValue::Function => "function",
            RawValue::Symbol(_) => "symbol",
            RawValue::Instance(_) => "instance",
            RawValue::Shared(_) => "reference",
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => RawValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => RawValue::String(s),
            Value::Array(items) => RawValue::Array(items.into_iter().map(RawValue::from).collect()),
            Value::Object(map) => {
                RawValue::Object(map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect())
            }
        }
    }
}

/// Why a value was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("object has {actual} keys, limit is {limit}")]
    TooManyKeys { limit: usize, actual: usize },

    #[error("array has {actual} items, limit is {limit}")]
    ArrayTooLong { limit: usize, actual: usize },

    #[error("nesting exceeds depth limit of {limit}")]
    TooDeep { limit: usize },

    #[error("serialized size is {actual} bytes, limit is {limit}")]
    TooLarge { limit: usize, actual: usize },

    #[error("value contains a circular reference")]
    Circular,

    #[error("unsupported value type: {found}")]
    UnsupportedType { found: &'static str },

    #[error("invalid event name: {0}")]
    InvalidName(String),
}

/// How container limits are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Truncate arrays and objects, prune too-deep or circular branches.
    Lenient,
    /// Reject outright.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_depth: usize,
    pub max_string_len: usize,
    pub max_key_len: usize,
    pub max_array_len: usize,
    pub max_object_keys: usize,
    pub max_serialized_bytes: usize,
    pub mode: Mode,
}

impl Limits {
    /// Global metadata, error context and other agent-shaped values.
    pub const GENERAL: Limits = Limits {
        max_depth: 3,
        max_string_len: 1000,
        max_key_len: 100,
        max_array_len: 100,
        max_object_keys: 50,
        max_serialized_bytes: 64 * 1024,
        mode: Mode::Lenient,
    };

    /// Metadata attached by the embedding page to a custom event.
    pub const CUSTOM_EVENT: Limits = Limits {
        max_depth: 1,
        max_string_len: 500,
        max_key_len: 100,
        max_array_len: 10,
        max_object_keys: 10,
        max_serialized_bytes: 8 * 1024,
        mode: Mode::Strict,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Self::GENERAL
    }
}

pub const MAX_EVENT_NAME_LEN: usize = 120;

static DANGEROUS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<(?:script|iframe|object|embed|style)\b[^>]*>.*?</(?:script|iframe|object|embed|style)\s*>",
    )
    .expect("invalid block regex")
});
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</?[a-zA-Z!][^>]*>").expect("invalid tag regex"));
static SCRIPT_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:javascript|vbscript|livescript)\s*:|data\s*:\s*text/html")
        .expect("invalid scheme regex")
});
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bon[a-z]+\s*=").expect("invalid handler regex"));

/// Strip markup and script-like schemes, then truncate to `max_len` chars.
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    let cleaned = DANGEROUS_BLOCK.replace_all(input, "");
    let cleaned = MARKUP_TAG.replace_all(&cleaned, "");
    let cleaned = SCRIPT_SCHEME.replace_all(&cleaned, "");
    let cleaned = EVENT_HANDLER.replace_all(&cleaned, "");
    let trimmed = cleaned.trim();

    if trimmed.chars().count() > max_len {
        trimmed.chars().take(max_len).collect()
    } else {
        trimmed.to_string()
    }
}

/// Validate and clean a custom event name.
pub fn validate_event_name(name: &str) -> Result<String, Rejection> {
    if name.chars().count() > MAX_EVENT_NAME_LEN {
        return Err(Rejection::InvalidName(format!(
            "longer than {MAX_EVENT_NAME_LEN} characters"
        )));
    }
    let cleaned = sanitize_string(name, MAX_EVENT_NAME_LEN);
    if cleaned.is_empty() {
        return Err(Rejection::InvalidName("empty after sanitizing".to_string()));
    }
    Ok(cleaned)
}

/// Sanitize an arbitrary value.
///
/// Top-level values of an unsupported type are rejected; nested ones are
/// omitted.
pub fn sanitize(value: &RawValue, limits: &Limits) -> Result<Value, Rejection> {
    let mut walker = Walker {
        limits,
        path: HashSet::new(),
    };
    let out = walker
        .walk(value, 0)?
        .ok_or_else(|| Rejection::UnsupportedType {
            found: resolve_type_name(value),
        })?;

    let size = out.to_string().len();
    if size > limits.max_serialized_bytes {
        return Err(Rejection::TooLarge {
            limit: limits.max_serialized_bytes,
            actual: size,
        });
    }
    Ok(out)
}

/// Sanitize a metadata object. The top level must be a plain object.
pub fn sanitize_metadata(value: &RawValue, limits: &Limits) -> Result<Metadata, Rejection> {
    match sanitize(value, limits)? {
        Value::Object(map) => Ok(map),
        other => Err(Rejection::UnsupportedType {
            found: json_type_name(&other),
        }),
    }
}

struct Walker<'a> {
    limits: &'a Limits,
    /// Addresses of shared nodes on the current path.
    path: HashSet<usize>,
}

impl Walker<'_> {
    fn strict(&self) -> bool {
        self.limits.mode == Mode::Strict
    }

    /// `Ok(None)` means "omit this value".
    fn walk(&mut self, value: &RawValue, depth: usize) -> Result<Option<Value>, Rejection> {
        match value {
            RawValue::Null => Ok(Some(Value::Null)),
            RawValue::Bool(b) => Ok(Some(Value::Bool(*b))),
            RawValue::Number(n) => Ok(number(*n).map(Value::Number)),
            RawValue::String(s) => Ok(Some(Value::String(sanitize_string(
                s,
                self.limits.max_string_len,
            )))),
            RawValue::Undefined
            | RawValue::Function
            | RawValue::Symbol(_)
            | RawValue::Instance(_) => Ok(None),
            RawValue::Shared(node) => self.walk_shared(node, depth),
            RawValue::Array(items) => {
                if depth > self.limits.max_depth {
                    return self.too_deep();
                }
                self.walk_array(items, depth)
            }
            RawValue::Object(entries) => {
                if depth > self.limits.max_depth {
                    return self.too_deep();
                }
                self.walk_object(entries, depth)
            }
        }
    }

    fn walk_shared(&mut self, node: &SharedValue, depth: usize) -> Result<Option<Value>, Rejection> {
        let addr = Arc::as_ptr(node) as usize;
        if self.path.contains(&addr) {
            return if self.strict() {
                Err(Rejection::Circular)
            } else {
                Ok(None)
            };
        }

        self.path.insert(addr);
        let inner = node.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = self.walk(&inner, depth);
        drop(inner);
        self.path.remove(&addr);
        result
    }

    fn walk_array(&mut self, items: &[RawValue], depth: usize) -> Result<Option<Value>, Rejection> {
        let limit = self.limits.max_array_len;
        if items.len() > limit && self.strict() {
            return Err(Rejection::ArrayTooLong {
                limit,
                actual: items.len(),
            });
        }

        let mut out = Vec::with_capacity(items.len().min(limit));
        for item in items {
            if out.len() == limit {
                break;
            }
            if let Some(v) = self.walk(item, depth + 1)? {
                out.push(v);
            }
        }
        Ok(Some(Value::Array(out)))
    }

    fn walk_object(
        &mut self,
        entries: &[(String, RawValue)],
        depth: usize,
    ) -> Result<Option<Value>, Rejection> {
        let limit = self.limits.max_object_keys;
        if entries.len() > limit && self.strict() {
            return Err(Rejection::TooManyKeys {
                limit,
                actual: entries.len(),
            });
        }

        let mut out = Map::new();
        for (key, value) in entries {
            if out.len() == limit {
                break;
            }
            let key = sanitize_string(key, self.limits.max_key_len);
            if key.is_empty() {
                continue;
            }
            if let Some(v) = self.walk(value, depth + 1)? {
                out.insert(key, v);
            }
        }
        Ok(Some(Value::Object(out)))
    }

    fn too_deep(&self) -> Result<Option<Value>, Rejection> {
        if self.strict() {
            Err(Rejection::TooDeep {
                limit: self.limits.max_depth,
            })
        } else {
            Ok(None)
        }
    }
}

/// Integral values come back as integers, non-finite ones are omitted.
fn number(n: f64) -> Option<Number> {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Some(Number::from(n as i64))
    } else {
        Number::from_f64(n)
    }
}

fn resolve_type_name(value: &RawValue) -> &'static str {
    match value {
        RawValue::Shared(node) => {
            let inner = node.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match &*inner {
                // one level is enough for the message; never chase cycles
                RawValue::Shared(_) => "reference",
                other => other.type_name(),
            }
        }
        other => other.type_name(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawValue {
        RawValue::from(value)
    }

    #[test]
    fn strips_markup_and_script_schemes() {
        let out = sanitize_string(
            r#"hello <script>alert(1)</script><b>world</b> javascript:void(0) <img onerror=x>"#,
            1000,
        );
        assert!(!out.contains("<"));
        assert!(!out.to_lowercase().contains("javascript:"));
        assert!(!out.contains("alert"));
        assert!(out.starts_with("hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        let out = sanitize_string("ééééé", 3);
        assert_eq!(out, "ééé");
    }

    #[test]
    fn omits_functions_symbols_and_undefined() {
        let value = RawValue::object([
            ("keep", RawValue::Number(1.0)),
            ("f", RawValue::Function),
            ("s", RawValue::Symbol("x".into())),
            ("u", RawValue::Undefined),
            ("d", RawValue::Instance("Date".into())),
        ]);
        let out = sanitize(&value, &Limits::GENERAL).unwrap();
        assert_eq!(out, json!({"keep": 1}));
    }

    #[test]
    fn top_level_function_is_rejected() {
        let err = sanitize(&RawValue::Function, &Limits::GENERAL).unwrap_err();
        assert_eq!(err, Rejection::UnsupportedType { found: "function" });
    }

    #[test]
    fn metadata_must_be_an_object() {
        let err = sanitize_metadata(&raw(json!([1, 2])), &Limits::CUSTOM_EVENT).unwrap_err();
        assert_eq!(err, Rejection::UnsupportedType { found: "array" });
    }

    #[test]
    fn strict_mode_rejects_too_many_keys() {
        let entries: Vec<(String, RawValue)> = (0..11)
            .map(|i| (format!("k{i}"), RawValue::Number(i as f64)))
            .collect();
        let err = sanitize_metadata(&RawValue::Object(entries), &Limits::CUSTOM_EVENT).unwrap_err();
        assert_eq!(
            err,
            Rejection::TooManyKeys {
                limit: 10,
                actual: 11
            }
        );
    }

    #[test]
    fn strict_mode_rejects_long_arrays() {
        let err = sanitize_metadata(
            &raw(json!({"items": [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]})),
            &Limits::CUSTOM_EVENT,
        )
        .unwrap_err();
        assert_eq!(
            err,
            Rejection::ArrayTooLong {
                limit: 10,
                actual: 11
            }
        );
    }

    #[test]
    fn custom_metadata_rejects_objects_beyond_depth_one() {
        let ok = sanitize_metadata(&raw(json!({"a": {"b": 1}})), &Limits::CUSTOM_EVENT);
        assert!(ok.is_ok());

        let err =
            sanitize_metadata(&raw(json!({"a": {"b": {"c": 1}}})), &Limits::CUSTOM_EVENT).unwrap_err();
        assert_eq!(err, Rejection::TooDeep { limit: 1 });
    }

    #[test]
    fn lenient_mode_caps_instead_of_rejecting() {
        let items: Vec<Value> = (0..500).map(Value::from).collect();
        let out = sanitize(&raw(json!({ "items": items })), &Limits::GENERAL).unwrap();
        assert_eq!(out["items"].as_array().unwrap().len(), 100);

        let out = sanitize(
            &raw(json!({"a": {"b": {"c": {"d": {"e": 1}}}}, "x": 1})),
            &Limits::GENERAL,
        )
        .unwrap();
        assert_eq!(out, json!({"a": {"b": {"c": {}}}, "x": 1}));
    }

    #[test]
    fn circular_reference_is_rejected_in_strict_mode() {
        let node = RawValue::shared(RawValue::Null);
        let cyclic = RawValue::object([("self", RawValue::Shared(Arc::clone(&node)))]);
        *node.write().unwrap() = cyclic;

        let err = sanitize(&RawValue::Shared(Arc::clone(&node)), &Limits::CUSTOM_EVENT).unwrap_err();
        assert_eq!(err, Rejection::Circular);

        let pruned = sanitize(&RawValue::Shared(Arc::clone(&node)), &Limits::GENERAL).unwrap();
        assert_eq!(pruned, json!({}));

        // break the cycle so the Arc can drop
        *node.write().unwrap() = RawValue::Null;
    }

    #[test]
    fn shared_but_acyclic_nodes_are_fine() {
        let shared = RawValue::shared(RawValue::String("v".into()));
        let value = RawValue::object([
            ("a", RawValue::Shared(Arc::clone(&shared))),
            ("b", RawValue::Shared(Arc::clone(&shared))),
        ]);
        let out = sanitize(&value, &Limits::CUSTOM_EVENT).unwrap();
        assert_eq!(out, json!({"a": "v", "b": "v"}));
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let big: Vec<(String, RawValue)> = (0..10)
            .map(|i| (format!("k{i}"), RawValue::String("x".repeat(500))))
            .collect();
        let limits = Limits {
            max_serialized_bytes: 1024,
            ..Limits::CUSTOM_EVENT
        };
        let err = sanitize_metadata(&RawValue::Object(big), &limits).unwrap_err();
        assert!(matches!(err, Rejection::TooLarge { limit: 1024, .. }));
    }

    #[test]
    fn non_finite_numbers_are_dropped() {
        let value = RawValue::object([
            ("nan", RawValue::Number(f64::NAN)),
            ("ok", RawValue::Number(2.5)),
        ]);
        let out = sanitize(&value, &Limits::GENERAL).unwrap();
        assert_eq!(out, json!({"ok": 2.5}));
    }

    #[test]
    fn event_names_are_validated() {
        assert_eq!(validate_event_name(" purchase ").unwrap(), "purchase");
        assert!(validate_event_name("<b></b>").is_err());
        assert!(validate_event_name(&"x".repeat(121)).is_err());
    }
}
