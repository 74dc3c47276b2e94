use std::fmt;
use std::str::FromStr;

use opendsr_data::{Row, Value};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An ordered sequence of field names descending into nested
/// documents. `a.b.c` addresses field `c` inside object `b` inside
/// top-level field `a`; for SQL collections paths are always a single
/// level deep.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldPath(levels.into_iter().map(Into::into).collect())
    }

    pub fn levels(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The top-level field name, which doubles as the column name for
    /// SQL collections.
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Extend this path one level deeper.
    pub fn child(&self, name: &str) -> FieldPath {
        let mut levels = self.0.clone();
        levels.push(name.to_owned());
        FieldPath(levels)
    }

    /// All values found in `row` along this path. Arrays are
    /// transparent: a path descending through an array yields one
    /// value per element.
    pub fn values_in<'a>(&self, row: &'a Row) -> Vec<&'a Value> {
        fn walk<'a>(value: &'a Value, levels: &[String], out: &mut Vec<&'a Value>) {
            match value {
                Value::Array(items) => {
                    for item in items {
                        walk(item, levels, out);
                    }
                }
                Value::Object(map) => {
                    if let Some((head, rest)) = levels.split_first() {
                        if let Some(child) = map.get(head) {
                            walk(child, rest, out);
                        }
                    }
                }
                scalar => {
                    if levels.is_empty() {
                        out.push(scalar);
                    }
                }
            }
        }

        let mut out = Vec::new();
        if let Some((head, rest)) = self.0.split_first() {
            if let Some(value) = row.get(head) {
                if rest.is_empty() && !matches!(value, Value::Object(_)) {
                    // A path ending on an array or scalar selects the
                    // value(s) directly, flattening arrays.
                    match value {
                        Value::Array(items) => out.extend(items.iter()),
                        other => out.push(other),
                    }
                } else {
                    walk(value, rest, &mut out);
                }
            }
        }
        out
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FieldPath(s.split('.').map(str::to_owned).collect()))
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("field path may not be empty"));
        }
        Ok(s.as_str().into())
    }
}

#[cfg(test)]
mod tests {
    use opendsr_data::{row, Value};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let path = FieldPath::new(["workplace_info", "employer"]);
        assert_eq!(path.to_string(), "workplace_info.employer");
        assert_eq!("workplace_info.employer".parse::<FieldPath>().unwrap(), path);
    }

    #[test]
    fn values_in_walks_nested_objects() {
        let row = row! {
            "id" => 1,
            "workplace_info" => Value::Object(row! {
                "employer" => "Acme",
                "position" => "qa",
            }),
        };
        let path = FieldPath::new(["workplace_info", "employer"]);
        assert_eq!(path.values_in(&row), vec![&Value::Text("Acme".into())]);
    }

    #[test]
    fn values_in_flattens_arrays() {
        let row = row! {
            "emails" => Value::Array(vec![
                Value::Object(row! {"address" => "a@x.com"}),
                Value::Object(row! {"address" => "b@x.com"}),
            ]),
        };
        let path = FieldPath::new(["emails", "address"]);
        assert_eq!(
            path.values_in(&row),
            vec![&Value::Text("a@x.com".into()), &Value::Text("b@x.com".into())]
        );

        let row = row! {"ids" => Value::Array(vec![Value::Int(1), Value::Int(2)])};
        let path = FieldPath::new(["ids"]);
        assert_eq!(path.values_in(&row), vec![&Value::Int(1), &Value::Int(2)]);
    }

    #[test]
    fn values_in_misses_yield_nothing() {
        let row = row! {"id" => 1};
        assert!(FieldPath::new(["email"]).values_in(&row).is_empty());
        assert!(FieldPath::new(["id", "deeper"]).values_in(&row).is_empty());
    }
}
