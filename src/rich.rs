//! Lossless-ish encode/decode of rich values and a stable comparable form.
//!
//! The full rich-value serializer (arbitrary Map/Set/Date/BigInt/Regex
//! fidelity through an opaque, user-supplied state type) sits outside
//! the core's own concerns; what the core actually needs is a canonical
//! form it can diff, compare and round-trip through the store's opaque
//! bytes. [`RichValue`] is that
//! form. Application state that wants exact Map/Set/Date/BigInt/Regex
//! fidelity in patches and equality checks should hold those values as
//! [`RichValue`] fields directly (it round-trips through its own
//! `Serialize`/`Deserialize` impl losslessly); values reached through the
//! generic [`to_rich`]/[`from_rich`] bridge for an arbitrary `T` are
//! canonicalized the way `serde_json` would canonicalize them (a `Date`
//! behind a plain `chrono::DateTime` field, for instance, becomes a
//! `RichValue::Str` of its RFC3339 form, same as it would over the wire in
//! a JSON-based store).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::RichError;

/// The canonical, comparable representation of any entity state value,
/// command/query argument or return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum RichValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(#[serde(with = "bigint_serde")] BigInt),
    Str(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    Regex { pattern: String, flags: String },
    Array(Vec<RichValue>),
    /// A plain object (struct/record shape). Field order is preserved for
    /// raw encoding and patch diffing but ignored by [`deep_equal`] (see
    /// DESIGN.md Open Question #4).
    Object(IndexMap<String, RichValue>),
    /// A `Map`-like collection: arbitrary key/value pairs, order-insensitive
    /// for equality purposes (see DESIGN.md Open Question #4).
    Map(Vec<(RichValue, RichValue)>),
    /// A `Set`-like collection, order-insensitive for equality purposes.
    Set(Vec<RichValue>),
}

mod bigint_serde {
    use super::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigInt, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(d)?;
        BigInt::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl PartialEq for RichValue {
    fn eq(&self, other: &Self) -> bool {
        deep_equal(self, other)
    }
}

impl RichValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RichValue::Null)
    }

    /// Builds a `Regex` value, validating the pattern eagerly so a
    /// malformed literal fails at the call site rather than surfacing
    /// later as an opaque decode error on whatever consumes it.
    pub fn new_regex(pattern: impl Into<String>, flags: impl Into<String>) -> Result<RichValue, RichError> {
        let pattern = pattern.into();
        regex::Regex::new(&pattern).map_err(|e| RichError::Encode(e.into()))?;
        Ok(RichValue::Regex {
            pattern,
            flags: flags.into(),
        })
    }

    /// Best-effort conversion to a `serde_json::Value`, used when decoding
    /// a dynamic `RichValue` into a concrete Rust type via `serde_json`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            RichValue::Null => J::Null,
            RichValue::Bool(b) => J::Bool(*b),
            RichValue::Int(i) => J::from(*i),
            RichValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            RichValue::BigInt(b) => J::String(b.to_string()),
            RichValue::Str(s) => J::String(s.clone()),
            RichValue::Bytes(b) => J::Array(b.iter().map(|byte| J::from(*byte)).collect()),
            RichValue::Date(d) => J::String(d.to_rfc3339()),
            RichValue::Regex { pattern, flags } => {
                let mut map = serde_json::Map::new();
                map.insert("pattern".into(), J::String(pattern.clone()));
                map.insert("flags".into(), J::String(flags.clone()));
                J::Object(map)
            }
            RichValue::Array(items) => J::Array(items.iter().map(RichValue::to_json).collect()),
            RichValue::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                J::Object(map)
            }
            RichValue::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(rich_key_to_string(k), v.to_json());
                }
                J::Object(map)
            }
            RichValue::Set(items) => J::Array(items.iter().map(RichValue::to_json).collect()),
        }
    }

    /// Converts a `serde_json::Value` into its `RichValue` shape. Never
    /// produces `BigInt`/`Date`/`Regex`/`Map`/`Set`/`Bytes` — those are only
    /// reachable by constructing a `RichValue` directly.
    pub fn from_json(value: serde_json::Value) -> RichValue {
        use serde_json::Value as J;
        match value {
            J::Null => RichValue::Null,
            J::Bool(b) => RichValue::Bool(b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RichValue::Int(i)
                } else {
                    RichValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            J::String(s) => RichValue::Str(s),
            J::Array(items) => RichValue::Array(items.into_iter().map(RichValue::from_json).collect()),
            J::Object(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, RichValue::from_json(v));
                }
                RichValue::Object(out)
            }
        }
    }
}

fn rich_key_to_string(key: &RichValue) -> String {
    match key {
        RichValue::Str(s) => s.clone(),
        other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
    }
}

/// Encodes any serializable value into its canonical [`RichValue`] form.
pub fn to_rich<T: Serialize>(value: &T) -> Result<RichValue, RichError> {
    let json = serde_json::to_value(value).map_err(|e| RichError::Encode(e.into()))?;
    Ok(RichValue::from_json(json))
}

/// Decodes a [`RichValue`] back into a concrete Rust type.
pub fn from_rich<T: serde::de::DeserializeOwned>(value: &RichValue) -> Result<T, RichError> {
    serde_json::from_value(value.to_json()).map_err(|e| RichError::Decode(e.into()))
}

/// Returns an independent deep copy of `value` by round-tripping it
/// through its canonical encoding, so callers can't mutate runtime-owned
/// state through the returned value.
pub fn clone_state<T>(value: &T) -> Result<T, RichError>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    from_rich(&to_rich(value)?)
}

/// Canonicalizes a value for stable byte comparison: `Map`/`Set` entries
/// are sorted by their own canonical bytes so that two values built in a
/// different insertion order but with identical content compare equal.
fn canonicalize(value: &RichValue) -> RichValue {
    match value {
        RichValue::Array(items) => RichValue::Array(items.iter().map(canonicalize).collect()),
        RichValue::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut out = IndexMap::with_capacity(fields.len());
            for k in keys {
                out.insert(k.clone(), canonicalize(&fields[k]));
            }
            RichValue::Object(out)
        }
        RichValue::Map(entries) => {
            let mut canon: Vec<(RichValue, RichValue)> = entries
                .iter()
                .map(|(k, v)| (canonicalize(k), canonicalize(v)))
                .collect();
            canon.sort_by(|a, b| canonical_bytes(&a.0).cmp(&canonical_bytes(&b.0)));
            RichValue::Map(canon)
        }
        RichValue::Set(items) => {
            let mut canon: Vec<RichValue> = items.iter().map(canonicalize).collect();
            canon.sort_by(|a, b| canonical_bytes(a).cmp(canonical_bytes(b)));
            RichValue::Set(canon)
        }
        other => other.clone(),
    }
}

fn canonical_bytes(value: &RichValue) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

/// True iff `a` and `b` serialize to the identical stable byte sequence.
/// Rust values have no shared-mutable identity to fall back on, so a
/// serialization failure (which cannot happen for a well-formed
/// `RichValue`) is treated as "not equal" rather than compared by
/// reference.
pub fn deep_equal(a: &RichValue, b: &RichValue) -> bool {
    canonical_bytes(a) == canonical_bytes(b)
}

/// Same as [`deep_equal`] but takes two arbitrary serializable values,
/// encoding each to its canonical form first.
pub fn deep_equal_values<T: Serialize>(a: &T, b: &T) -> bool {
    match (to_rich(a), to_rich(b)) {
        (Ok(ra), Ok(rb)) => deep_equal(&ra, &rb),
        _ => false,
    }
}

pub fn cmp_bytes(a: &RichValue, b: &RichValue) -> Ordering {
    canonical_bytes(a).cmp(&canonical_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_equal_ignores_map_insertion_order() {
        let a = RichValue::Map(vec![
            (RichValue::Str("a".into()), RichValue::Int(1)),
            (RichValue::Str("b".into()), RichValue::Int(2)),
        ]);
        let b = RichValue::Map(vec![
            (RichValue::Str("b".into()), RichValue::Int(2)),
            (RichValue::Str("a".into()), RichValue::Int(1)),
        ]);
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn deep_equal_distinguishes_different_map_contents() {
        let a = RichValue::Map(vec![(RichValue::Str("a".into()), RichValue::Int(1))]);
        let b = RichValue::Map(vec![(RichValue::Str("a".into()), RichValue::Int(2))]);
        assert!(!deep_equal(&a, &b));
    }

    #[test]
    fn object_field_order_is_significant_in_raw_encoding_but_not_equality() {
        let mut m1 = IndexMap::new();
        m1.insert("x".to_string(), RichValue::Int(1));
        m1.insert("y".to_string(), RichValue::Int(2));
        let mut m2 = IndexMap::new();
        m2.insert("y".to_string(), RichValue::Int(2));
        m2.insert("x".to_string(), RichValue::Int(1));
        assert!(deep_equal(&RichValue::Object(m1), &RichValue::Object(m2)));
    }

    #[test]
    fn round_trips_plain_struct() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Counter {
            count: i64,
        }
        let original = Counter { count: 42 };
        let rich = to_rich(&original).unwrap();
        let decoded: Counter = from_rich(&rich).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn new_regex_rejects_invalid_patterns() {
        assert!(RichValue::new_regex("[a-z", "i").is_err());
        assert!(RichValue::new_regex("[a-z]+", "i").is_ok());
    }

    #[test]
    fn clone_state_is_independent() {
        #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
        struct S {
            values: Vec<i64>,
        }
        let original = S { values: vec![1, 2, 3] };
        let mut cloned = clone_state(&original).unwrap();
        cloned.values.push(4);
        assert_eq!(original.values, vec![1, 2, 3]);
        assert_eq!(cloned.values, vec![1, 2, 3, 4]);
    }
}
