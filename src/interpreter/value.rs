use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value inside the sandbox.
///
/// Values cross the sandbox boundary only as JSON; see [`Value::to_json`] and
/// [`Value::from_json`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping.
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Convert into the JSON form used outside the sandbox.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Nil => Json::Null,
            Value::Bool(flag) => Json::Bool(*flag),
            Value::Int(num) => Json::Number((*num).into()),
            Value::Float(num) => Number::from_f64(*num).map_or(Json::Null, Json::Number),
            Value::Str(text) => Json::String(text.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Dict(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json());
                }
                Json::Object(map)
            }
        }
    }

    /// Build a sandbox value from JSON handed in by the host.
    pub fn from_json(value: &Json) -> Value {
        match value {
            Json::Null => Value::Nil,
            Json::Bool(flag) => Value::Bool(*flag),
            Json::Number(num) => match num.as_i64() {
                Some(int) => Value::Int(int),
                None => Value::Float(num.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(text) => Value::Str(text.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Dict(
                map.iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Truthiness used by `if`, `while`, `and`, `or`, `not`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(flag) => *flag,
            Value::Int(num) => *num != 0,
            Value::Float(num) => *num != 0.0,
            Value::Str(text) => !text.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.is_empty(),
        }
    }

    /// Type name reported by `type` and in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }

    /// Numeric view, for arithmetic and ordering.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(num) => Some(*num as f64),
            Value::Float(num) => Some(*num),
            _ => None,
        }
    }

    /// Structural equality with int/float unification.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            _ => self == other,
        }
    }
}

/// Display form used by `str` and string concatenation: strings verbatim,
/// everything else as compact JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(text) => f.write_str(text),
            Value::Nil => f.write_str("nil"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}
