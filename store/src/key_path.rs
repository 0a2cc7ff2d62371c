//! Key paths: extracting keys from records and injecting generated ones.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::key::{to_valid_key, Key};
use crate::value::Value;

/// A dotted accessor (`"author.name"`), the empty path (`""`, the whole
/// value) or a list of dotted accessors producing an array key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    Single(String),
    Multi(Vec<String>),
}

impl KeyPath {
    /// Reject paths that are not dot-separated identifiers.
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            KeyPath::Single(path) => validate_path(path),
            KeyPath::Multi(paths) => {
                if paths.is_empty() {
                    return Err(StoreError::data("array key path must not be empty"));
                }
                paths.iter().try_for_each(|p| validate_path(p))
            }
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, KeyPath::Multi(_))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Multi(paths.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(p) => write!(f, "'{}'", p),
            KeyPath::Multi(ps) => write!(f, "[{}]", ps.join(", ")),
        }
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if path.is_empty() {
        return Ok(());
    }
    let ok = path.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {
                chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
            }
            _ => false,
        }
    });
    if ok {
        Ok(())
    } else {
        Err(StoreError::data(format!("'{}' is not a valid key path", path)))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a single dotted path. `None` when a segment is missing.
pub fn evaluate_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::String(s) if segment == "length" && segments.peek().is_none() => {
                return Some(Value::Number(s.chars().count() as f64));
            }
            Value::Array(items) if segment == "length" && segments.peek().is_none() => {
                return Some(Value::Number(items.len() as f64));
            }
            _ => return None,
        }
    }
    if current.is_undefined() {
        return None;
    }
    Some(current.clone())
}

/// Extract a key, or `None` when the path does not resolve.
///
/// A path that resolves to something that is not a valid key is a
/// `DataError`.
pub fn try_extract_key(value: &Value, key_path: &KeyPath) -> StoreResult<Option<Key>> {
    match key_path {
        KeyPath::Single(path) => match evaluate_path(value, path) {
            Some(v) => to_valid_key(&v).map(Some),
            None => Ok(None),
        },
        KeyPath::Multi(paths) => {
            let mut parts = Vec::with_capacity(paths.len());
            for path in paths {
                match evaluate_path(value, path) {
                    Some(v) => parts.push(to_valid_key(&v)?),
                    None => return Ok(None),
                }
            }
            Ok(Some(Key::Array(parts)))
        }
    }
}

/// Extract a key that must exist.
pub fn extract_key(value: &Value, key_path: &KeyPath) -> StoreResult<Key> {
    try_extract_key(value, key_path)?
        .ok_or_else(|| StoreError::data(format!("key path {} did not yield a value", key_path)))
}

/// Return a copy of `value` with `key` written at `path`, creating missing
/// intermediate objects. Fails when the path crosses a non-object.
pub fn inject_key(value: &Value, path: &str, key: &Key) -> StoreResult<Value> {
    if path.is_empty() {
        return Err(StoreError::data("cannot inject a key at the empty key path"));
    }
    let mut out = value.clone();
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(StoreError::data("cannot inject a key at the empty key path")),
    };

    let mut current = &mut out;
    for segment in parents {
        let map = match current {
            Value::Object(map) => map,
            _ => {
                return Err(StoreError::data(format!(
                    "cannot inject key: '{}' crosses a non-object",
                    path
                )))
            }
        };
        current = map.entry(segment.to_string()).or_insert_with(Value::object);
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), key.to_value());
            Ok(out)
        }
        _ => Err(StoreError::data(format!(
            "cannot inject key: '{}' crosses a non-object",
            path
        ))),
    }
}

/// Index keys contributed by one record.
///
/// For `multi_entry` indexes an array result yields one entry per distinct
/// valid element (invalid elements are skipped). Otherwise the record
/// contributes a single key, or nothing when the path does not resolve to a
/// valid key.
pub fn index_keys(value: &Value, key_path: &KeyPath, multi_entry: bool) -> Vec<Key> {
    if multi_entry {
        if let KeyPath::Single(path) = key_path {
            return match evaluate_path(value, path) {
                Some(Value::Array(items)) => {
                    let mut keys: Vec<Key> =
                        items.iter().filter_map(|v| to_valid_key(v).ok()).collect();
                    keys.sort();
                    keys.dedup();
                    keys
                }
                Some(other) => to_valid_key(&other).ok().into_iter().collect(),
                None => Vec::new(),
            };
        }
    }
    match try_extract_key(value, key_path) {
        Ok(Some(key)) => vec![key],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
