//! # Value Module
//!
//! Loosely-typed document payloads. Counter, shard and partial documents are
//! nested maps of [`Value`]; only numeric leaves ever take part in aggregation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Neg};

/// Top-level fields of a document.
pub type Fields = BTreeMap<String, Value>;

/// A numeric leaf. Integer arithmetic is kept exact until it overflows or
/// meets a double, after which the result is a double.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Double(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(value) => value as f64,
            Number::Double(value) => value,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Number::Integer(value) => value == 0,
            Number::Double(value) => value == 0.0,
        }
    }
}

impl Default for Number {
    fn default() -> Self {
        Number::Integer(0)
    }
}

impl Add for Number {
    type Output = Number;

    fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => match a.checked_add(b) {
                Some(sum) => Number::Integer(sum),
                None => Number::Double(a as f64 + b as f64),
            },
            (a, b) => Number::Double(a.as_f64() + b.as_f64()),
        }
    }
}

impl Neg for Number {
    type Output = Number;

    fn neg(self) -> Number {
        match self {
            Number::Integer(value) => match value.checked_neg() {
                Some(negated) => Number::Integer(negated),
                None => Number::Double(-(value as f64)),
            },
            Number::Double(value) => Number::Double(-value),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => a.partial_cmp(b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Integer(value) => write!(f, "{value}"),
            Number::Double(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Integer(value)
    }
}

impl From<i32> for Number {
    fn from(value: i32) -> Self {
        Number::Integer(value as i64)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Double(value)
    }
}

/// A document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(value) => Some(Number::Integer(*value)),
            Value::Double(value) => Some(Number::Double(*value)),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Number> for Value {
    fn from(number: Number) -> Self {
        match number {
            Number::Integer(value) => Value::Integer(value),
            Number::Double(value) => Value::Double(value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Map(fields)
    }
}

/// Read a dotted field path such as `stats.cnt`.
pub fn get_field<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = fields.get(first)?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Write a dotted field path, creating intermediate maps and replacing any
/// non-map value that sits on the way.
pub fn set_field(fields: &mut Fields, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = fields
                .entry(head.to_string())
                .or_insert_with(|| Value::Map(Fields::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(Fields::new());
            }
            if let Value::Map(child) = entry {
                set_field(child, rest, value);
            }
        }
    }
}

/// Every numeric leaf as `(dotted path, number)`, in key order. Strings,
/// booleans, nulls and arrays are skipped.
pub fn numeric_leaves(fields: &Fields) -> Vec<(String, Number)> {
    let mut leaves = Vec::new();
    collect_numeric(fields, "", &mut leaves);
    leaves
}

fn collect_numeric(fields: &Fields, prefix: &str, out: &mut Vec<(String, Number)>) {
    for (key, value) in fields {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Integer(_) | Value::Double(_) => {
                if let Some(number) = value.as_number() {
                    out.push((path, number));
                }
            }
            Value::Map(child) => collect_numeric(child, &path, out),
            // arrays are opaque
            _ => {}
        }
    }
}

/// Encode a typed document body into fields.
pub fn to_fields<T: Serialize>(value: &T) -> serde_json::Result<Fields> {
    serde_json::from_value(serde_json::to_value(value)?)
}

/// Decode fields into a typed document body.
pub fn from_fields<T: DeserializeOwned>(fields: &Fields) -> serde_json::Result<T> {
    serde_json::from_value(serde_json::to_value(fields)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_number_addition() {
        assert_eq!(Number::from(2) + Number::from(3), Number::Integer(5));
        assert_eq!(Number::from(2) + Number::from(0.5), Number::Double(2.5));
        assert_eq!(
            Number::Integer(i64::MAX) + Number::Integer(1),
            Number::Double(i64::MAX as f64 + 1.0)
        );
        assert_eq!(-Number::from(4), Number::Integer(-4));
        assert!(Number::Double(0.0).is_zero());
    }

    #[test]
    fn test_value_deserializes_numbers_by_kind() {
        let doc = fields(json!({"a": 1, "b": 1.5, "c": "x", "d": [1, 2], "e": null}));
        assert_eq!(doc["a"], Value::Integer(1));
        assert_eq!(doc["b"], Value::Double(1.5));
        assert_eq!(doc["c"], Value::String("x".to_string()));
        assert_eq!(doc["e"], Value::Null);
        assert!(doc["d"].as_array().is_some());
    }

    #[test]
    fn test_get_and_set_dotted_fields() {
        let mut doc = fields(json!({"stats": {"cnt": 2}, "name": "hello"}));
        assert_eq!(get_field(&doc, "stats.cnt"), Some(&Value::Integer(2)));
        assert_eq!(get_field(&doc, "stats.missing"), None);

        set_field(&mut doc, "stats.cnt", Value::Integer(7));
        set_field(&mut doc, "name.first", Value::Integer(1));
        assert_eq!(get_field(&doc, "stats.cnt"), Some(&Value::Integer(7)));
        assert_eq!(get_field(&doc, "name.first"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_numeric_leaves_skip_other_values() {
        let doc = fields(json!({
            "visits": 2,
            "label": "x",
            "flags": [1, 2, 3],
            "stats": {"load": 1.5, "ok": true, "deep": {"n": -1}}
        }));
        let leaves = numeric_leaves(&doc);
        assert_eq!(
            leaves,
            vec![
                ("stats.deep.n".to_string(), Number::Integer(-1)),
                ("stats.load".to_string(), Number::Double(1.5)),
                ("visits".to_string(), Number::Integer(2)),
            ]
        );
    }
}
