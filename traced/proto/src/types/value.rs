use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const TRUNCATED_MARKER: &str = "<truncated>";
pub const UNSERIALIZABLE_MARKER: &str = "<unserializable>";

/// Captured value of an argument or result.
///
/// The set of variants is closed on purpose: anything that does not map onto
/// one of them is recorded as `Opaque` with its type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    Opaque(String),
}

impl Value {
    /// Natural JSON rendering, used for display, size accounting and diffs.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Nil => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::UInt(u) => Json::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(f.to_string())),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Opaque(type_name) => Json::String(format!("<opaque {type_name}>")),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Size in bytes of the compact JSON rendering.
    pub fn encoded_len(&self) -> usize {
        self.to_string().len()
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Size-bounded record of an argument list or a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Snapshot {
    /// The full value, small enough to keep in the span record.
    Inline(Value),
    /// Prefix of the rendering of a value that exceeded the payload limit.
    Truncated { preview: String, original_bytes: u64 },
    /// Rendering moved to the blob store under a content-derived key.
    Blob { key: String, bytes: u64 },
    /// The value could not be captured at all.
    Unserializable { type_name: String },
}

impl Snapshot {
    pub fn nil() -> Self {
        Snapshot::Inline(Value::Nil)
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Snapshot::Truncated { .. })
    }

    /// Textual form used by the comparator and the dashboard.
    pub fn render(&self) -> String {
        match self {
            Snapshot::Inline(value) => value.to_string(),
            Snapshot::Truncated {
                preview,
                original_bytes,
            } => format!("{preview}{TRUNCATED_MARKER}({original_bytes} bytes)"),
            Snapshot::Blob { key, bytes } => format!("<blob {key} ({bytes} bytes)>"),
            Snapshot::Unserializable { type_name } => {
                format!("{UNSERIALIZABLE_MARKER}({type_name})")
            }
        }
    }

    /// Size of the rendering kept in the span record.
    pub fn inline_len(&self) -> usize {
        match self {
            Snapshot::Inline(value) => value.encoded_len(),
            Snapshot::Truncated { preview, .. } => preview.len(),
            Snapshot::Blob { key, .. } => key.len(),
            Snapshot::Unserializable { type_name } => type_name.len(),
        }
    }
}
