//! # Keys and the Total Key Order
//!
//! A [`Key`] is a small closed set of tagged variants with one comparison
//! function dispatching on the tag:
//!
//! ```text
//!   Number  <  Date  <  String  <  Binary  <  Array
//! ```
//!
//! Within a tag: numbers and dates numerically, strings by code point,
//! binary byte-wise, arrays element-wise with a strict prefix sorting first.
//! Keys are only ever built through [`to_valid_key`] or the checked
//! constructors, which is what keeps `NaN` out and lets `Ord` be total.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::value::{float_repr, Value};

/// A valid key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    Number(#[serde(with = "float_repr")] f64),
    /// Milliseconds since the Unix epoch.
    Date(#[serde(with = "float_repr")] f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Binary(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Checked numeric key. Non-finite numbers are rejected; `-0` becomes `0`.
    pub fn number(n: f64) -> StoreResult<Self> {
        if !n.is_finite() {
            return Err(StoreError::data(format!("{} is not a valid key", n)));
        }
        Ok(Key::Number(canonical_zero(n)))
    }

    /// Checked date key (milliseconds since the epoch).
    pub fn date(millis: f64) -> StoreResult<Self> {
        if !millis.is_finite() {
            return Err(StoreError::data("invalid date is not a valid key"));
        }
        Ok(Key::Date(canonical_zero(millis)))
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Key::Binary(bytes.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    /// The key as a storable value, used when injecting generated keys.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => Value::Number(*n),
            Key::Date(d) => Value::Date(*d),
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(b) => Value::Binary(b.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }
}

fn canonical_zero(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) | (Key::Date(a), Key::Date(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Key::Number(n) | Key::Date(n) => n.to_bits().hash(state),
            Key::String(s) => s.hash(state),
            Key::Binary(b) => b.hash(state),
            Key::Array(items) => items.hash(state),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(canonical_zero(n as f64))
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(canonical_zero(f64::from(n)))
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

impl<Tz: chrono::TimeZone> From<chrono::DateTime<Tz>> for Key {
    fn from(dt: chrono::DateTime<Tz>) -> Self {
        Key::Date(dt.timestamp_millis() as f64)
    }
}

impl TryFrom<f64> for Key {
    type Error = StoreError;

    fn try_from(n: f64) -> StoreResult<Self> {
        Key::number(n)
    }
}

impl TryFrom<&Value> for Key {
    type Error = StoreError;

    fn try_from(v: &Value) -> StoreResult<Self> {
        to_valid_key(v)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate and canonicalize a candidate key.
///
/// Fails with `DataError` for non-finite numbers, invalid dates and any
/// value type that has no place in the key order (booleans, null,
/// undefined, objects). Arrays are valid when every element is.
pub fn to_valid_key(value: &Value) -> StoreResult<Key> {
    match value {
        Value::Number(n) => Key::number(*n),
        Value::Date(d) => Key::date(*d),
        Value::String(s) => Ok(Key::String(s.clone())),
        Value::Binary(b) => Ok(Key::Binary(b.clone())),
        Value::Array(items) => items
            .iter()
            .map(to_valid_key)
            .collect::<StoreResult<Vec<_>>>()
            .map(Key::Array),
        other => Err(StoreError::data(format!(
            "{} is not a valid key",
            type_name(other)
        ))),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Undefined => "undefined",
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Date(_) => "date",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
