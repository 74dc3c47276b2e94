use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{DataCategory, FieldPath};

/// Dataset name reserved for the synthetic ROOT node that injects the
/// seed identities into a traversal.
pub const ROOT_DATASET: &str = "__ROOT__";
/// Collection name of the synthetic ROOT node.
pub const ROOT_COLLECTION: &str = "__ROOT__";
/// Collection name of the synthetic logical sink.
pub const TERMINATOR_COLLECTION: &str = "__TERMINATE__";

/// Identifies a collection as `(dataset, collection)`. Renders as
/// `dataset:collection`, which is also the key format of result maps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        CollectionAddress {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    /// Address of the synthetic ROOT node.
    pub fn root() -> Self {
        CollectionAddress::new(ROOT_DATASET, ROOT_COLLECTION)
    }

    /// Address of the synthetic logical sink.
    pub fn terminator() -> Self {
        CollectionAddress::new(ROOT_DATASET, TERMINATOR_COLLECTION)
    }

    pub fn is_root(&self) -> bool {
        self.dataset == ROOT_DATASET && self.collection == ROOT_COLLECTION
    }

    pub fn field(&self, path: impl Into<FieldPath>) -> FieldAddress {
        FieldAddress {
            dataset: self.dataset.clone(),
            collection: self.collection.clone(),
            field_path: path.into(),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

impl FromStr for CollectionAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((dataset, collection)) if !dataset.is_empty() && !collection.is_empty() => {
                Ok(CollectionAddress::new(dataset, collection))
            }
            _ => Err(format!("invalid collection address {s:?}, expected dataset:collection")),
        }
    }
}

impl Serialize for CollectionAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CollectionAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies a single (possibly nested) field:
/// `(dataset, collection, field_path)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldAddress {
    pub dataset: String,
    pub collection: String,
    pub field_path: FieldPath,
}

impl FieldAddress {
    pub fn new(
        dataset: impl Into<String>,
        collection: impl Into<String>,
        field_path: impl Into<FieldPath>,
    ) -> Self {
        FieldAddress {
            dataset: dataset.into(),
            collection: collection.into(),
            field_path: field_path.into(),
        }
    }

    /// Address of the ROOT pseudo-field carrying the given seed key.
    pub fn root(seed_key: &str) -> Self {
        FieldAddress::new(ROOT_DATASET, ROOT_COLLECTION, seed_key)
    }

    pub fn collection_address(&self) -> CollectionAddress {
        CollectionAddress::new(self.dataset.clone(), self.collection.clone())
    }

    pub fn is_root(&self) -> bool {
        self.dataset == ROOT_DATASET && self.collection == ROOT_COLLECTION
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dataset, self.collection, self.field_path)
    }
}

/// Declared type of a field's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Bytes,
    Datetime,
    Object,
    Array,
}

/// Direction of a declared reference, from the point of view of the
/// declaring field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDirection {
    /// Values flow from the referenced field into the declaring field.
    From,
    /// Values flow from the declaring field into the referenced field.
    To,
    /// Both directions; yields two edges.
    #[default]
    Bidirectional,
}

/// A declared inter-collection reference on a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub dataset: String,
    pub collection: String,
    pub field: FieldPath,
    #[serde(default)]
    pub direction: ReferenceDirection,
}

impl Reference {
    pub fn address(&self) -> FieldAddress {
        FieldAddress::new(self.dataset.clone(), self.collection.clone(), self.field.clone())
    }
}

/// A field declaration, possibly carrying nested child fields for
/// document stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<DataType>,
    /// Nested children, for `object` / array-of-object fields.
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub data_categories: Vec<DataCategory>,
    /// Marks this field as seedable from the named identity key
    /// (e.g. `email`).
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            data_type: None,
            fields: Vec::new(),
            primary_key: false,
            data_categories: Vec::new(),
            identity: None,
            references: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn with_identity(mut self, seed_key: impl Into<String>) -> Self {
        self.identity = Some(seed_key.into());
        self
    }

    pub fn with_data_categories<I, C>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<DataCategory>,
    {
        self.data_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reference(
        mut self,
        dataset: impl Into<String>,
        collection: impl Into<String>,
        field: impl Into<FieldPath>,
        direction: ReferenceDirection,
    ) -> Self {
        self.references.push(Reference {
            dataset: dataset.into(),
            collection: collection.into(),
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }
}

/// A table or document collection in some data store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    /// Collections that must be processed before this one even absent
    /// a dataflow edge.
    #[serde(default)]
    pub after: Vec<CollectionAddress>,
}

impl Collection {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Collection {
            name: name.into(),
            fields,
            after: Vec::new(),
        }
    }

    /// Every declared field, nested ones included, keyed by its path
    /// in declaration order. Object fields appear both as their own
    /// path and as the parent of their children's paths.
    pub fn field_paths(&self) -> IndexMap<FieldPath, &Field> {
        fn flatten<'a>(
            prefix: &FieldPath,
            fields: &'a [Field],
            out: &mut IndexMap<FieldPath, &'a Field>,
        ) {
            for field in fields {
                let path = prefix.child(&field.name);
                out.insert(path.clone(), field);
                if !field.fields.is_empty() {
                    flatten(&path, &field.fields, out);
                }
            }
        }

        let mut out = IndexMap::new();
        flatten(&FieldPath::default(), &self.fields, &mut out);
        out
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Field> {
        self.field_paths().get(path).copied()
    }

    /// Paths of fields declared `primary_key = true`.
    pub fn primary_key_paths(&self) -> Vec<FieldPath> {
        self.field_paths()
            .into_iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(p, _)| p)
            .collect()
    }

    /// Top-level field names, in declaration order. These are the
    /// columns of a SQL SELECT over this collection.
    pub fn top_level_field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// A named group of collections belonging to one connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub collections: Vec<Collection>,
    /// Datasets that must be fully processed before any collection of
    /// this one.
    #[serde(default)]
    pub after: Vec<String>,
    /// Key of the connection this dataset is reached through; defaults
    /// to the dataset name.
    #[serde(default)]
    pub connection_key: Option<String>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, collections: Vec<Collection>) -> Self {
        Dataset {
            name: name.into(),
            collections,
            after: Vec::new(),
            connection_key: None,
        }
    }

    pub fn connection_key(&self) -> &str {
        self.connection_key.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn collection_address_round_trips() {
        let addr: CollectionAddress = "postgres_example:customer".parse().unwrap();
        assert_eq!(addr, CollectionAddress::new("postgres_example", "customer"));
        assert_eq!(addr.to_string(), "postgres_example:customer");
        assert!("customer".parse::<CollectionAddress>().is_err());
    }

    #[test]
    fn field_paths_flatten_nested_fields() {
        let collection = Collection::new(
            "customer_details",
            vec![
                Field::new("customer_id"),
                Field::new("workplace_info").with_fields(vec![
                    Field::new("employer"),
                    Field::new("position"),
                ]),
            ],
        );

        let paths: Vec<String> = collection
            .field_paths()
            .keys()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            paths,
            vec![
                "customer_id",
                "workplace_info",
                "workplace_info.employer",
                "workplace_info.position",
            ]
        );
    }

    #[test]
    fn dataset_parses_from_yaml() {
        let yaml = r#"
name: postgres_example
collections:
  - name: customer
    fields:
      - name: id
        primary_key: true
      - name: email
        identity: email
        data_categories: [user.provided.identifiable.contact.email]
      - name: address_id
        references:
          - dataset: postgres_example
            collection: address
            field: id
            direction: to
  - name: address
    fields:
      - name: id
        primary_key: true
      - name: city
        data_categories: [user.provided.identifiable.contact.city]
"#;
        let dataset: Dataset = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(dataset.name, "postgres_example");
        assert_eq!(dataset.collections.len(), 2);
        assert_eq!(dataset.connection_key(), "postgres_example");

        let customer = &dataset.collections[0];
        assert!(customer.fields[0].primary_key);
        assert_eq!(customer.fields[1].identity.as_deref(), Some("email"));
        let reference = &customer.fields[2].references[0];
        assert_eq!(reference.direction, ReferenceDirection::To);
        assert_eq!(
            reference.address(),
            FieldAddress::new("postgres_example", "address", "id")
        );
    }
}
