//! Tagged value type used at the host/script boundary.
//!
//! `JSValue` represents everything a cell hands back to the host: it keeps
//! NaN and ±Infinity, preserves object key order and refers to script
//! functions by handle instead of copying them.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted when converting script values.
pub const MAX_JS_DEPTH: usize = 100;
/// Maximum size in bytes accepted when converting script values.
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// A script value as seen by the host.
///
/// `Function` cannot be serialized; call it through the owning cell.
#[derive(Clone, Debug, PartialEq)]
pub enum JSValue {
    /// `null` or `undefined`
    Null,
    Bool(bool),
    /// Integral number within i64 range
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    Array(Vec<JSValue>),
    /// Object with insertion-ordered keys
    Object(IndexMap<String, JSValue>),
    /// Handle into the owning interpreter's function registry
    Function { id: u32 },
}

impl JSValue {
    pub fn is_null(&self) -> bool {
        matches!(self, JSValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JSValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JSValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JSValue::Int(i) => Some(*i),
            JSValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JSValue::Int(i) => Some(*i as f64),
            JSValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Look up a key on an object value.
    pub fn get(&self, key: &str) -> Option<&JSValue> {
        match self {
            JSValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Convert into JSON. Non-finite floats become `null`, as `JSON.stringify` does.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            JSValue::Null => serde_json::Value::Null,
            JSValue::Bool(b) => serde_json::Value::Bool(*b),
            JSValue::Int(i) => serde_json::Value::from(*i),
            JSValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            JSValue::String(s) => serde_json::Value::String(s.clone()),
            JSValue::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(JSValue::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            JSValue::Object(map) => {
                let mut obj = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    obj.insert(key.clone(), value.to_json()?);
                }
                serde_json::Value::Object(obj)
            }
            JSValue::Function { id } => {
                return Err(Error::conversion(format!(
                    "function handle {id} has no JSON representation"
                )))
            }
        })
    }
}

impl From<bool> for JSValue {
    fn from(value: bool) -> Self {
        JSValue::Bool(value)
    }
}

impl From<i64> for JSValue {
    fn from(value: i64) -> Self {
        JSValue::Int(value)
    }
}

impl From<f64> for JSValue {
    fn from(value: f64) -> Self {
        JSValue::Float(value)
    }
}

impl From<&str> for JSValue {
    fn from(value: &str) -> Self {
        JSValue::String(value.to_string())
    }
}

impl From<String> for JSValue {
    fn from(value: String) -> Self {
        JSValue::String(value)
    }
}

impl From<serde_json::Value> for JSValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JSValue::Null,
            serde_json::Value::Bool(b) => JSValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => JSValue::Int(i),
                None => JSValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => JSValue::String(s),
            serde_json::Value::Array(items) => {
                JSValue::Array(items.into_iter().map(JSValue::from).collect())
            }
            serde_json::Value::Object(map) => JSValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, JSValue::from(value)))
                    .collect(),
            ),
        }
    }
}

// Function handles refuse to serialize.
impl Serialize for JSValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            JSValue::Null => serializer.serialize_none(),
            JSValue::Bool(b) => serializer.serialize_bool(*b),
            JSValue::Int(i) => serializer.serialize_i64(*i),
            JSValue::Float(f) => serializer.serialize_f64(*f),
            JSValue::String(s) => serializer.serialize_str(s),
            JSValue::Array(arr) => arr.serialize(serializer),
            JSValue::Object(obj) => obj.serialize(serializer),
            JSValue::Function { id } => Err(S::Error::custom(format!(
                "cannot serialize function handle {id}; call it through its cell"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for JSValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JSValueVisitor;

        impl<'de> Visitor<'de> for JSValueVisitor {
            type Value = JSValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("null, bool, number, string, array or object")
            }

            fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E> {
                Ok(i64::try_from(value)
                    .map(JSValue::Int)
                    .unwrap_or(JSValue::Float(value as f64)))
            }

            fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::String(value))
            }

            fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(JSValue::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JSValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JSValueVisitor)
    }
}

/// Depth and size budget for one conversion pass.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    pub fn enter(&mut self) -> Result<()> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(Error::conversion(format!(
                "depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<()> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(Error::conversion(format!(
                "size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new(MAX_JS_DEPTH, MAX_JS_BYTES)
    }
}
