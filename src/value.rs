use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A primary key value as found in the flat JSON representation.
///
/// Keys are either integers or strings on the wire. `Ord` is derived so
/// resolved key sets iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pk {
    Int(i64),
    Text(String),
}

impl Pk {
    /// read a primary key out of a raw JSON value. floats, booleans and
    /// containers are not valid keys.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Pk::Int),
            Value::String(string) => Some(Pk::Text(string.to_owned())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Pk::Int(i) => Value::from(*i),
            Pk::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl Display for Pk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Pk::Int(i) => write!(f, "{}", i),
            Pk::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Pk {
    fn from(value: i64) -> Self {
        Pk::Int(value)
    }
}

impl From<&str> for Pk {
    fn from(value: &str) -> Self {
        Pk::Text(value.to_owned())
    }
}

/// The scalar representations the catalog can declare for a field.
///
/// Temporal, decimal and uuid values stay in their string wire form: the api
/// serializes them as strings and callers get them back as `DbValue::Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Date,
    DateTime,
    Uuid,
    Json,
}

impl ScalarType {
    /// convert a raw JSON value into its native representation.
    /// `None` means the shape is not acceptable for this scalar type.
    pub fn convert(&self, raw: &Value) -> Option<DbValue> {
        if raw.is_null() {
            return Some(DbValue::Null);
        }
        match self {
            ScalarType::Bool => raw.as_bool().map(DbValue::Bool),
            ScalarType::Int => match raw {
                Value::Number(number) => number.as_i64().map(DbValue::Int),
                Value::String(string) => string.parse().ok().map(DbValue::Int),
                _ => None,
            },
            ScalarType::Float => match raw {
                Value::Number(number) => number.as_f64().map(DbValue::Float),
                Value::String(string) => string.parse().ok().map(DbValue::Float),
                _ => None,
            },
            ScalarType::Decimal
            | ScalarType::Date
            | ScalarType::DateTime
            | ScalarType::Uuid
            | ScalarType::Text => match raw {
                Value::String(string) => Some(DbValue::Text(string.to_owned())),
                Value::Number(number) => Some(DbValue::Text(number.to_string())),
                _ => None,
            },
            ScalarType::Json => Some(DbValue::Json(raw.to_owned())),
        }
    }
}

/// A native-typed result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl DbValue {
    /// best-effort conversion used for values without a declared scalar type,
    /// such as foreign key ids or fanned-out relation members.
    /// containers are rejected, the caller decides how to report them.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        match raw {
            Value::Null => Some(DbValue::Null),
            Value::Bool(b) => Some(DbValue::Bool(*b)),
            Value::Number(number) => number
                .as_i64()
                .map(DbValue::Int)
                .or_else(|| number.as_f64().map(DbValue::Float)),
            Value::String(string) => Some(DbValue::Text(string.to_owned())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pk_from_json_accepts_integers_and_strings() {
        assert_eq!(Pk::from_json(&json!(42)), Some(Pk::Int(42)));
        assert_eq!(Pk::from_json(&json!("abc")), Some(Pk::Text("abc".into())));
        assert_eq!(Pk::from_json(&json!(1.5)), None);
        assert_eq!(Pk::from_json(&json!([1])), None);
    }

    #[test]
    fn scalar_conversion() {
        assert_eq!(ScalarType::Int.convert(&json!(3)), Some(DbValue::Int(3)));
        assert_eq!(ScalarType::Int.convert(&json!("3")), Some(DbValue::Int(3)));
        assert_eq!(ScalarType::Int.convert(&json!(null)), Some(DbValue::Null));
        assert_eq!(ScalarType::Int.convert(&json!({"a": 1})), None);
        assert_eq!(
            ScalarType::Float.convert(&json!(1.25)),
            Some(DbValue::Float(1.25))
        );
        assert_eq!(
            ScalarType::Decimal.convert(&json!("10.50")),
            Some(DbValue::Text("10.50".into()))
        );
        assert_eq!(
            ScalarType::Json.convert(&json!([1, 2])),
            Some(DbValue::Json(json!([1, 2])))
        );
    }
}
