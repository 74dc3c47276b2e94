//! Value and row representation for OpenDSR.
//!
//! Every connector returns rows in this shape, the masking strategies
//! rewrite these values in place of store-native ones, and the result
//! filter walks them when projecting onto requested data categories.
//! Rows are insertion-ordered so that results render in the column
//! order the collection declares.

use std::fmt;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single row retrieved from (or written back to) a collection.
///
/// Values may themselves be rows or arrays of rows for document
/// stores; SQL stores only ever produce scalar-valued rows.
pub type Row = IndexMap<String, Value>;

/// A value observed in some data store, converted to the engine-native
/// representation.
///
/// The variant order matters for untagged deserialization: `Text`
/// comes before `Timestamp` so arbitrary strings do not get eagerly
/// parsed as datetimes, and `Bytes` comes last so integer arrays stay
/// arrays. `Bytes` only arises from store-native binary columns, never
/// from deserialized documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Array(Vec<Value>),
    Object(Row),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `{}` and `[]`, the shapes the result filter prunes.
    pub fn is_empty_container(&self) -> bool {
        match self {
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Row> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// An empty container of the same shape, or the value itself for
    /// scalars. Seeds the accumulators used by the result filter.
    pub fn empty_like(&self) -> Value {
        match self {
            Value::Array(_) => Value::Array(Vec::new()),
            Value::Object(_) => Value::Object(Row::new()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{ts}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(ts: NaiveDateTime) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        Value::Object(row)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Value::from(*d),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_string()),
            Value::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Build a [`Row`] from `(name, value)` pairs, converting values on
/// the way in. Mostly a test convenience.
#[macro_export]
macro_rules! row {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut row = $crate::Row::new();
        $(row.insert($name.to_string(), $crate::Value::from($value));)*
        row
    }};
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn untagged_round_trip_preserves_scalars() {
        let row = row! {
            "id" => 7,
            "email" => "c@x.com",
            "active" => true,
            "score" => 1.5,
            "deleted" => Value::Null,
        };
        let json = serde_json::to_string(&Value::Object(row.clone())).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Object(row));
    }

    #[test]
    fn strings_stay_text_not_timestamps() {
        let v: Value = serde_json::from_str(r#""2020-04-01 11:47:42""#).unwrap();
        assert_eq!(v, Value::Text("2020-04-01 11:47:42".into()));
    }

    #[test]
    fn empty_like_matches_shape() {
        assert_eq!(
            Value::Array(vec![Value::Int(1)]).empty_like(),
            Value::Array(vec![])
        );
        assert_eq!(
            Value::Object(row! {"a" => 1}).empty_like(),
            Value::Object(Row::new())
        );
        assert_eq!(Value::Int(3).empty_like(), Value::Int(3));
    }

    #[test]
    fn empty_container_detection() {
        assert!(Value::Array(vec![]).is_empty_container());
        assert!(Value::Object(Row::new()).is_empty_container());
        assert!(!Value::Null.is_empty_container());
        assert!(!Value::Array(vec![Value::Null]).is_empty_container());
    }
}
