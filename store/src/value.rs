//! Structured record values.
//!
//! [`Value`] is the engine's structured-clone model: everything a record may
//! contain, including the `undefined` sentinel, dates and binary blobs. Values
//! are owned trees, so a cyclic value cannot be constructed in the first
//! place.
//!
//! Typed application records travel through `serde_json`:
//! [`Value::from_serialize`] and [`Value::deserialize_into`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Float Encoding
// ---------------------------------------------------------------------------

/// Serde adapter for `f64` that survives JSON.
///
/// JSON has no spelling for `NaN` or the infinities, so human-readable
/// formats write them as the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`. Binary formats (bincode) get the raw `f64`.
pub(crate) mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() && !v.is_finite() {
            let text = if v.is_nan() {
                "NaN"
            } else if *v > 0.0 {
                "Infinity"
            } else {
                "-Infinity"
            };
            s.serialize_str(text)
        } else {
            s.serialize_f64(*v)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        if !d.is_human_readable() {
            return f64::deserialize(d);
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(f64),
            Text(String),
        }

        match Repr::deserialize(d)? {
            Repr::Num(n) => Ok(n),
            Repr::Text(t) => match t.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid number literal '{}'", other))),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A structured record value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(#[serde(with = "float_repr")] f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(#[serde(with = "float_repr")] f64),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

fn same_number(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Deep equality where `NaN` equals `NaN`, so round-trip checks work for
/// every value the engine can store.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) | (Value::Date(a), Value::Date(b)) => {
                same_number(*a, *b)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// An empty object.
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Builder-style field insertion; a no-op on non-objects.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self {
            map.insert(name.to_string(), value.into());
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(field),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Convert any serializable type into a `Value` via its JSON form.
    pub fn from_serialize<T: Serialize>(item: &T) -> StoreResult<Self> {
        Ok(Value::from(serde_json::to_value(item)?))
    }

    /// Inverse of [`Value::from_serialize`]. Dates become millisecond
    /// numbers and binary blobs become byte arrays on the way out.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.to_json())
            .map_err(|e| StoreError::data(format!("cannot decode record: {}", e)))
    }

    /// Lossy projection to plain JSON.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Undefined | Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) | Value::Date(n) => number_to_json(*n),
            Value::String(s) => J::String(s.clone()),
            Value::Binary(bytes) => J::Array(bytes.iter().map(|b| J::from(*b)).collect()),
            Value::Array(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => J::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    // Integral values go out as integers so `u64` fields decode cleanly.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        if n >= 0.0 {
            return serde_json::Value::from(n as u64);
        }
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            J::String(s) => Value::String(s),
            J::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            J::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::object()
            .with_field("n", 1.5)
            .with_field("nan", f64::NAN)
            .with_field("inf", f64::NEG_INFINITY)
            .with_field("s", "text")
            .with_field("d", Value::Date(1_700_000_000_000.0))
            .with_field("b", Value::Binary(vec![0, 1, 255]))
            .with_field("u", Value::Undefined)
            .with_field("nested", Value::Array(vec![Value::Null, Value::Bool(true)]))
    }

    #[test]
    fn json_roundtrip_preserves_special_values() {
        let v = sample();
        let text = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn bincode_roundtrip() {
        let v = sample();
        let bytes = bincode::serialize(&v).unwrap();
        let back: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn nan_equals_nan_but_types_differ() {
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Number(1.0), Value::Date(1.0));
    }

    #[test]
    fn typed_records_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Book {
            isbn: u64,
            title: String,
        }
        let book = Book {
            isbn: 9780000000001,
            title: "Rust".into(),
        };
        let v = Value::from_serialize(&book).unwrap();
        assert_eq!(v.get("title").and_then(Value::as_str), Some("Rust"));
        let back: Book = v.deserialize_into().unwrap();
        assert_eq!(back, book);
    }
}
