use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use ordered_float::OrderedFloat;

/// Dynamic value tree shared by raw documents and resolved fields.
///
/// Mappings are sorted so that two resolutions of the same input compare
/// and serialize identically.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Number(OrderedFloat<f64>),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(OrderedFloat(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
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

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Number(OrderedFloat(f))
                } else {
                    Value::Number(OrderedFloat(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::Number(serde_json::Number::from(*i)),
            Value::Number(n) => serde_json::Number::from_f64(n.into_inner())
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(|v| v.into()).collect()),
            Value::Map(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

/// Renders the value the way it appears when spliced into surrounding text.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n.into_inner()),
            Value::String(s) => f.write_str(s),
            Value::Array(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::Value::from(self))
            }
        }
    }
}

// Type-safe extraction from Value
pub trait TryGetValue<T> {
    fn try_get(v: &Value) -> Option<T>;
}

impl TryGetValue<f64> for f64 {
    fn try_get(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(n.into_inner()),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl TryGetValue<i64> for i64 {
    fn try_get(v: &Value) -> Option<i64> {
        match v {
            Value::Integer(i) => Some(*i),
            Value::Number(n) => {
                // Only whole numbers that fit
                if n.fract().abs() < f64::EPSILON
                    && *n >= OrderedFloat(i64::MIN as f64)
                    && *n <= OrderedFloat(i64::MAX as f64)
                {
                    Some(n.into_inner() as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl TryGetValue<u64> for u64 {
    fn try_get(v: &Value) -> Option<u64> {
        i64::try_get(v).and_then(|i| u64::try_from(i).ok())
    }
}

impl TryGetValue<String> for String {
    fn try_get(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

// YAML 1.2 parsers hand back `yes`/`no` as strings; Kurfiles use them freely.
impl TryGetValue<bool> for bool {
    fn try_get(v: &Value) -> Option<bool> {
        match v {
            Value::Boolean(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "yes" | "true" | "on" | "y" => Some(true),
                "no" | "false" | "off" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl TryGetValue<Vec<Value>> for Vec<Value> {
    fn try_get(v: &Value) -> Option<Vec<Value>> {
        match v {
            Value::Array(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl TryGetValue<BTreeMap<String, Value>> for BTreeMap<String, Value> {
    fn try_get(v: &Value) -> Option<BTreeMap<String, Value>> {
        match v {
            Value::Map(map) => Some(map.clone()),
            _ => None,
        }
    }
}

impl Value {
    pub fn get_as<T: TryGetValue<T>>(&self) -> Option<T> {
        T::try_get(self)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
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
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "sequence",
            Value::Map(_) => "mapping",
        }
    }

    /// Look up a dotted path (`rnn.depth`) through nested mappings.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Map(map) => map.get(segment),
            _ => None,
        })
    }
}

/// Build a `Value::Map` from `key => value` pairs.
#[macro_export]
macro_rules! value_map {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::<String, $crate::Value>::new();
        $(map.insert($key.to_string(), $crate::Value::from($value));)*
        $crate::Value::Map(map)
    }};
}
