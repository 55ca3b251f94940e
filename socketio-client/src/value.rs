//! The dynamic value tree carried by Socket.IO packets.
//!
//! Packet data is arbitrary JSON that may contain raw byte sequences at any
//! leaf. On the wire those leaves travel out-of-band: the encoder replaces
//! each one with a `{"_placeholder":true,"num":N}` object and appends the
//! bytes to an ordered attachment list, and the decoder reverses the
//! substitution as attachments arrive.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Number;

const PLACEHOLDER: &str = "_placeholder";
const NUM: &str = "num";

/// A JSON value extended with a binary leaf.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(bin) => Some(bin),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Deep scan for a binary leaf anywhere in the tree.
    pub fn contains_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Array(items) => items.iter().any(Value::contains_binary),
            Value::Object(map) => map.values().any(Value::contains_binary),
            _ => false,
        }
    }

    pub(crate) fn is_placeholder(&self) -> bool {
        match self {
            Value::Object(map) => matches!(map.get(PLACEHOLDER), Some(Value::Bool(true))),
            _ => false,
        }
    }

    /// Produce the JSON shadow of this tree, replacing every binary leaf
    /// with a placeholder object numbered in depth-first container order,
    /// and collecting the leaves into `attachments` in the same order.
    pub(crate) fn to_json_with_placeholders(
        &self,
        attachments: &mut Vec<Bytes>,
    ) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(bin) => {
                let num = attachments.len();
                attachments.push(bin.clone());
                let mut placeholder = serde_json::Map::new();
                placeholder.insert(PLACEHOLDER.to_owned(), serde_json::Value::Bool(true));
                placeholder.insert(NUM.to_owned(), serde_json::Value::Number(num.into()));
                serde_json::Value::Object(placeholder)
            }
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json_with_placeholders(attachments))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json_with_placeholders(attachments));
                }
                serde_json::Value::Object(out)
            }
        }
    }

    /// Replace the next placeholder in depth-first container order with
    /// `data`. Returns false when no placeholder is left.
    pub(crate) fn fill_next_placeholder(&mut self, data: &Bytes) -> bool {
        if self.is_placeholder() {
            *self = Value::Binary(data.clone());
            return true;
        }
        match self {
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if item.fill_next_placeholder(data) {
                        return true;
                    }
                }
                false
            }
            Value::Object(map) => {
                for value in map.values_mut() {
                    if value.fill_next_placeholder(data) {
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bin: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(bin))
    }
}

impl From<Bytes> for Value {
    fn from(bin: Bytes) -> Self {
        Value::Binary(bin)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}
