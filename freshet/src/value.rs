//! The dynamic record payload flowing through a dataflow.
//!
//! Payloads are heterogeneous, so records carry a tagged [`Value`] covering
//! the common shapes: scalars, byte strings, sequences, and insertion-ordered
//! maps. Stateful operators additionally require their input to be a
//! `(key, value)` pair, represented as a two-element [`Value::List`].
//!
//! `Display` renders values the way the system's error messages quote them:
//! strings single-quoted, maps `{'k': v}` in insertion order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically typed record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The unit/missing value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A text string.
    Text(String),
    /// A raw byte string.
    Bytes(Vec<u8>),
    /// A sequence of values. A two-element list doubles as the
    /// `(key, value)` pair consumed by stateful operators.
    List(Vec<Value>),
    /// A string-keyed map preserving insertion order.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Builds the `(key, value)` pair shape.
    pub fn pair(key: impl Into<Value>, value: impl Into<Value>) -> Value {
        Value::List(vec![key.into(), value.into()])
    }

    /// Builds a map from entries, keeping their order.
    pub fn map<K: Into<String>, V: Into<Value>>(entries: Vec<(K, V)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Views this value as a `(key, value)` pair, if it is one.
    pub fn as_pair(&self) -> Option<(&Value, &Value)> {
        match self {
            Value::List(items) if items.len() == 2 => Some((&items[0], &items[1])),
            _ => None,
        }
    }

    /// Consumes this value into a `(key, value)` pair, if it is one.
    pub fn into_pair(self) -> Result<(Value, Value), Value> {
        match self {
            Value::List(mut items) if items.len() == 2 => {
                let value = items.pop().expect("len checked");
                let key = items.pop().expect("len checked");
                Ok((key, value))
            }
            other => Err(other),
        }
    }

    /// Looks up a key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Inserts into a map value, replacing an existing entry in place.
    ///
    /// No-op on non-map values.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Value::Map(entries) = self {
            let key = key.into();
            let value = value.into();
            if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
            } else {
                entries.push((key, value));
            }
        }
    }

    /// The integer inside, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string inside, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "'")?;
    for c in s.chars() {
        match c {
            '\'' => write!(f, "\\'")?,
            '\\' => write!(f, "\\\\")?,
            c => write!(f, "{}", c)?,
        }
    }
    write!(f, "'")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Text(s) => write_quoted(f, s),
            Value::Bytes(bytes) => {
                write!(f, "b'")?;
                for b in bytes {
                    if b.is_ascii_graphic() || *b == b' ' {
                        write!(f, "{}", *b as char)?;
                    } else {
                        write!(f, "\\x{:02x}", b)?;
                    }
                }
                write!(f, "'")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_quoted(f, k)?;
                    write!(f, ": {}", v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_source_repr() {
        let event = Value::map(vec![("user", "a"), ("type", "login")]);
        assert_eq!(event.to_string(), "{'user': 'a', 'type': 'login'}");

        let key = Value::map(vec![("id", Value::Int(1))]);
        assert_eq!(key.to_string(), "{'id': 1}");

        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::from("it's").to_string(), "'it\\'s'");
        assert_eq!(Value::Null.to_string(), "None");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::from("x")]).to_string(),
            "[1, 'x']"
        );
    }

    #[test]
    fn pair_shape_round_trips() {
        let pair = Value::pair("k", 3_i64);
        let (key, value) = pair.as_pair().unwrap();
        assert_eq!(key, &Value::from("k"));
        assert_eq!(value, &Value::Int(3));

        let (key, value) = pair.into_pair().unwrap();
        assert_eq!(key, Value::from("k"));
        assert_eq!(value, Value::Int(3));

        assert!(Value::List(vec![Value::Int(1)]).into_pair().is_err());
    }

    #[test]
    fn map_insert_replaces_in_place() {
        let mut counts = Value::map::<&str, Value>(vec![]);
        counts.insert("login", 1_i64);
        counts.insert("post", 1_i64);
        counts.insert("login", 2_i64);
        assert_eq!(counts.to_string(), "{'login': 2, 'post': 1}");
        assert_eq!(counts.get("post"), Some(&Value::Int(1)));
    }

    #[test]
    fn snapshot_encoding_round_trips() {
        let value = Value::map(vec![
            ("user", Value::from("a")),
            ("hits", Value::List(vec![Value::Int(1), Value::Float(0.5)])),
        ]);
        let bytes = bincode::serialize(&value).unwrap();
        let back: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
