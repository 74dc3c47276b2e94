use indexmap::IndexMap;
use itertools::Itertools;
use opendsr_data::{Row, Value};
use opendsr_graph::TraversalNode;
use opendsr_policy::{Policy, PrivacyRequest};
use serde_json::json;
use tracing::warn;

use crate::{ConnectorError, InsufficientDataError, QueryError};

/// Filter inputs for one traversal node: for each destination field
/// path (rendered dotted), the de-duplicated values observed at the
/// matching source fields upstream.
pub type InputData = IndexMap<String, Vec<Value>>;

/// A generated SQL statement. Values are always parameter-bound;
/// untrusted data never appears in `sql`.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Quoting and placeholder style of the target store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    /// Postgres-flavored; its connector additionally scopes each
    /// session to a configured `search_path`.
    Redshift,
    Snowflake,
}

impl SqlDialect {
    /// Quote an identifier, escaping embedded quote characters by
    /// doubling them.
    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self {
            SqlDialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            SqlDialect::Postgres | SqlDialect::Redshift | SqlDialect::Snowflake => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }

    /// Parameter placeholder for the 1-based `index`.
    fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres | SqlDialect::Redshift => format!("${index}"),
            SqlDialect::MySql | SqlDialect::Snowflake => "?".to_string(),
        }
    }
}

/// Builds SELECT and UPDATE statements for one traversal node.
#[derive(Clone, Debug)]
pub struct SqlQueryConfig<'a> {
    node: &'a TraversalNode,
    dialect: SqlDialect,
    strict_masking: bool,
}

impl<'a> SqlQueryConfig<'a> {
    pub fn new(node: &'a TraversalNode, dialect: SqlDialect) -> Self {
        SqlQueryConfig {
            node,
            dialect,
            strict_masking: false,
        }
    }

    /// In strict mode a matched erasure rule without a masking
    /// strategy is a hard error instead of a skipped field.
    pub fn with_strict_masking(mut self, strict: bool) -> Self {
        self.strict_masking = strict;
        self
    }

    fn table(&self) -> String {
        self.dialect.quote_identifier(&self.node.address.collection)
    }

    fn select_columns(&self) -> String {
        self.node
            .collection
            .top_level_field_names()
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .join(", ")
    }

    /// The SELECT retrieving every row this node can reach from its
    /// inputs, or `None` when no input field carries a usable value.
    ///
    /// Input fields combine with OR: a row matches if *any* seeded
    /// field matches. Null inputs are dropped before binding.
    pub fn generate_query(
        &self,
        input_data: &InputData,
        _policy: &Policy,
    ) -> Option<SqlStatement> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        for path in self.node.input_field_paths() {
            let Some(column) = path.head() else { continue };
            let values: Vec<&Value> = input_data
                .get(&path.to_string())
                .into_iter()
                .flatten()
                .filter(|v| !v.is_null())
                .collect();
            if values.is_empty() {
                continue;
            }

            let placeholders = values
                .iter()
                .map(|value| {
                    params.push((*value).clone());
                    self.dialect.placeholder(params.len())
                })
                .join(", ");
            clauses.push(format!(
                "{} IN ({placeholders})",
                self.dialect.quote_identifier(column)
            ));
        }

        if clauses.is_empty() {
            return None;
        }

        Some(SqlStatement {
            sql: format!(
                "SELECT {} FROM {} WHERE {}",
                self.select_columns(),
                self.table(),
                clauses.join(" OR ")
            ),
            params,
        })
    }

    /// The UPDATE masking one retrieved row, or `None` when no field
    /// of this collection is targeted by an erasure rule.
    ///
    /// Requires a primary-key field with a non-null value in `row`;
    /// anything less is an [`InsufficientDataError`] and the row is
    /// left untouched by the caller.
    pub fn generate_update_stmt(
        &self,
        row: &Row,
        policy: &Policy,
        _request: &PrivacyRequest,
    ) -> Result<Option<SqlStatement>, ConnectorError> {
        let mut update_map: Vec<(String, Value)> = Vec::new();

        for (path, field) in self.node.collection.field_paths() {
            // SQL collections are flat; nested declarations belong to
            // document stores.
            if path.len() != 1 || field.data_categories.is_empty() {
                continue;
            }
            let Some(current) = row.get(&field.name) else {
                continue;
            };
            let Some(rule) = policy.erasure_rule_for(&field.data_categories) else {
                continue;
            };
            match &rule.masking_strategy {
                Some(strategy) => update_map.push((field.name.clone(), strategy.mask(current))),
                None if self.strict_masking => {
                    let category = rule
                        .matching_target(&field.data_categories)
                        .map(|t| t.data_category.to_string())
                        .unwrap_or_default();
                    return Err(QueryError::MissingMaskingStrategy {
                        rule: rule.key.clone(),
                        category,
                    }
                    .into());
                }
                None => {
                    warn!(
                        rule = %rule.key,
                        field = %field.name,
                        "erasure rule has no masking strategy, skipping field"
                    );
                }
            }
        }

        if update_map.is_empty() {
            return Ok(None);
        }

        let pk_paths = self.node.collection.primary_key_paths();
        if pk_paths.is_empty() {
            return Err(InsufficientDataError {
                collection: self.node.address.to_string(),
                reason: "no primary key is defined for this collection".into(),
            }
            .into());
        }

        let mut params: Vec<Value> = Vec::new();
        let assignments = update_map
            .iter()
            .map(|(column, masked)| {
                params.push(masked.clone());
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(column),
                    self.dialect.placeholder(params.len())
                )
            })
            .join(", ");

        let mut pk_clauses = Vec::new();
        for pk in &pk_paths {
            let column = pk.to_string();
            let value = row.get(&column).filter(|v| !v.is_null()).ok_or_else(|| {
                InsufficientDataError {
                    collection: self.node.address.to_string(),
                    reason: format!("primary key {column} has no value in the retrieved row"),
                }
            })?;
            params.push(value.clone());
            let placeholder = self.dialect.placeholder(params.len());
            pk_clauses.push(format!(
                "{} = {placeholder}",
                self.dialect.quote_identifier(&column)
            ));
        }

        Ok(Some(SqlStatement {
            sql: format!(
                "UPDATE {} SET {assignments} WHERE {}",
                self.table(),
                pk_clauses.join(" AND ")
            ),
            params,
        }))
    }

    /// The SELECT text this node would run, with unbound placeholders,
    /// for the request-preview surface. Never connects to a store.
    pub fn dry_run_query(&self) -> Option<String> {
        let paths = self.node.input_field_paths();
        if paths.is_empty() {
            return None;
        }
        let clauses = paths
            .iter()
            .enumerate()
            .filter_map(|(i, path)| {
                Some(format!(
                    "{} IN ({})",
                    self.dialect.quote_identifier(path.head()?),
                    self.dialect.placeholder(i + 1)
                ))
            })
            .join(" OR ");
        Some(format!(
            "SELECT {} FROM {} WHERE {clauses}",
            self.select_columns(),
            self.table()
        ))
    }
}

/// A generated MongoDB filter document.
#[derive(Clone, Debug, PartialEq)]
pub struct MongoQuery {
    pub collection: String,
    pub filter: serde_json::Value,
}

/// A generated MongoDB update: a filter selecting one document and a
/// `$set` document masking its targeted fields.
#[derive(Clone, Debug, PartialEq)]
pub struct MongoUpdate {
    pub collection: String,
    pub filter: serde_json::Value,
    pub update: serde_json::Value,
}

/// Builds filter and update documents for one traversal node of a
/// document store. Nested fields address with dotted paths, which is
/// Mongo-native.
#[derive(Clone, Debug)]
pub struct MongoQueryConfig<'a> {
    node: &'a TraversalNode,
    strict_masking: bool,
}

impl<'a> MongoQueryConfig<'a> {
    pub fn new(node: &'a TraversalNode) -> Self {
        MongoQueryConfig {
            node,
            strict_masking: false,
        }
    }

    pub fn with_strict_masking(mut self, strict: bool) -> Self {
        self.strict_masking = strict;
        self
    }

    pub fn generate_query(
        &self,
        input_data: &InputData,
        _policy: &Policy,
    ) -> Option<MongoQuery> {
        let mut clauses = Vec::new();
        for path in self.node.input_field_paths() {
            let key = path.to_string();
            let values: Vec<serde_json::Value> = input_data
                .get(&key)
                .into_iter()
                .flatten()
                .filter(|v| !v.is_null())
                .map(serde_json::Value::from)
                .collect();
            if values.is_empty() {
                continue;
            }
            let mut clause = serde_json::Map::new();
            clause.insert(key, json!({ "$in": values }));
            clauses.push(serde_json::Value::Object(clause));
        }

        let filter = match clauses.len() {
            0 => return None,
            1 => clauses.into_iter().next()?,
            _ => json!({ "$or": clauses }),
        };
        Some(MongoQuery {
            collection: self.node.address.collection.clone(),
            filter,
        })
    }

    pub fn generate_update_stmt(
        &self,
        row: &Row,
        policy: &Policy,
        _request: &PrivacyRequest,
    ) -> Result<Option<MongoUpdate>, ConnectorError> {
        let mut set_doc = serde_json::Map::new();

        for (path, field) in self.node.collection.field_paths() {
            if !field.fields.is_empty() || field.data_categories.is_empty() {
                continue;
            }
            let Some(current) = path.values_in(row).into_iter().next() else {
                continue;
            };
            let Some(rule) = policy.erasure_rule_for(&field.data_categories) else {
                continue;
            };
            match &rule.masking_strategy {
                Some(strategy) => {
                    set_doc.insert(
                        path.to_string(),
                        serde_json::Value::from(&strategy.mask(current)),
                    );
                }
                None if self.strict_masking => {
                    let category = rule
                        .matching_target(&field.data_categories)
                        .map(|t| t.data_category.to_string())
                        .unwrap_or_default();
                    return Err(QueryError::MissingMaskingStrategy {
                        rule: rule.key.clone(),
                        category,
                    }
                    .into());
                }
                None => {
                    warn!(
                        rule = %rule.key,
                        field = %path,
                        "erasure rule has no masking strategy, skipping field"
                    );
                }
            }
        }

        if set_doc.is_empty() {
            return Ok(None);
        }

        let pk_paths = self.node.collection.primary_key_paths();
        if pk_paths.is_empty() {
            return Err(InsufficientDataError {
                collection: self.node.address.to_string(),
                reason: "no primary key is defined for this collection".into(),
            }
            .into());
        }

        let mut filter = serde_json::Map::new();
        for pk in &pk_paths {
            let value = pk
                .values_in(row)
                .into_iter()
                .find(|v| !v.is_null())
                .ok_or_else(|| InsufficientDataError {
                    collection: self.node.address.to_string(),
                    reason: format!("primary key {pk} has no value in the retrieved document"),
                })?;
            filter.insert(pk.to_string(), serde_json::Value::from(value));
        }

        Ok(Some(MongoUpdate {
            collection: self.node.address.collection.clone(),
            filter: serde_json::Value::Object(filter),
            update: json!({ "$set": serde_json::Value::Object(set_doc) }),
        }))
    }

    pub fn dry_run_query(&self) -> Option<String> {
        let paths = self.node.input_field_paths();
        if paths.is_empty() {
            return None;
        }
        let clauses: Vec<serde_json::Value> = paths
            .iter()
            .map(|path| {
                let mut clause = serde_json::Map::new();
                clause.insert(path.to_string(), json!({ "$in": ["?"] }));
                serde_json::Value::Object(clause)
            })
            .collect();
        let filter = if clauses.len() == 1 {
            clauses.into_iter().next()?
        } else {
            json!({ "$or": clauses })
        };
        Some(filter.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use opendsr_data::row;
    use opendsr_graph::{Collection, CollectionAddress, Edge, Field, FieldAddress};
    use opendsr_policy::{erasure_policy, ActionType, Rule, RuleTarget};
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(dataset: &str, collection: Collection, incoming: Vec<Edge>) -> TraversalNode {
        TraversalNode {
            address: CollectionAddress::new(dataset, collection.name.clone()),
            collection: Arc::new(collection),
            incoming_edges: incoming.into_iter().collect(),
            outgoing_edges: BTreeSet::new(),
        }
    }

    fn address_collection() -> Collection {
        Collection::new(
            "address",
            vec![
                Field::new("id").with_primary_key(true),
                Field::new("city").with_data_categories(["A"]),
                Field::new("state").with_data_categories(["B"]),
                Field::new("zip").with_data_categories(["C"]),
            ],
        )
    }

    fn address_node() -> TraversalNode {
        node(
            "ex",
            address_collection(),
            vec![Edge::new(
                FieldAddress::new("ex", "customer", "address_id"),
                FieldAddress::new("ex", "address", "id"),
            )],
        )
    }

    #[test]
    fn select_filters_by_incoming_edge_values() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let input = InputData::from([("id".to_string(), vec![Value::from(7)])]);

        let stmt = config.generate_query(&input, &Policy::default()).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"city\", \"state\", \"zip\" FROM \"address\" WHERE \"id\" IN ($1)"
        );
        assert_eq!(stmt.params, vec![Value::from(7)]);
    }

    #[test]
    fn mysql_quotes_and_placeholders_differ() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::MySql);
        let input = InputData::from([(
            "id".to_string(),
            vec![Value::from(7), Value::from(8)],
        )]);

        let stmt = config.generate_query(&input, &Policy::default()).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT `id`, `city`, `state`, `zip` FROM `address` WHERE `id` IN (?, ?)"
        );
    }

    #[test]
    fn empty_or_null_inputs_yield_no_statement() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let policy = Policy::default();

        assert_eq!(config.generate_query(&InputData::new(), &policy), None);
        assert_eq!(
            config.generate_query(
                &InputData::from([("id".to_string(), vec![])]),
                &policy
            ),
            None
        );
        assert_eq!(
            config.generate_query(
                &InputData::from([("id".to_string(), vec![Value::Null])]),
                &policy
            ),
            None
        );
        assert_eq!(
            config.generate_query(
                &InputData::from([("bad_key".to_string(), vec![Value::from(1)])]),
                &policy
            ),
            None
        );
    }

    #[test]
    fn disjunctive_inputs_combine_with_or() {
        let collection = Collection::new(
            "b",
            vec![Field::new("id"), Field::new("x"), Field::new("y")],
        );
        let node = node(
            "ex",
            collection,
            vec![
                Edge::new(
                    FieldAddress::new("ex", "a", "x_out"),
                    FieldAddress::new("ex", "b", "x"),
                ),
                Edge::new(
                    FieldAddress::new("ex", "c", "y_out"),
                    FieldAddress::new("ex", "b", "y"),
                ),
            ],
        );
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);

        // Only one edge group seeded: filter by that group alone.
        let stmt = config
            .generate_query(
                &InputData::from([("x".to_string(), vec![Value::from(1)])]),
                &Policy::default(),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"x\", \"y\" FROM \"b\" WHERE \"x\" IN ($1)"
        );

        // Both seeded: OR across distinct destination fields.
        let stmt = config
            .generate_query(
                &InputData::from([
                    ("x".to_string(), vec![Value::from(1)]),
                    ("y".to_string(), vec![Value::from(2), Value::from(3)]),
                ]),
                &Policy::default(),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"x\", \"y\" FROM \"b\" WHERE \"x\" IN ($1) OR \"y\" IN ($2, $3)"
        );
        assert_eq!(
            stmt.params,
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
    }

    #[test]
    fn seed_values_never_appear_in_query_text() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let input = InputData::from([(
            "id".to_string(),
            vec![Value::from("7; DROP TABLE address")],
        )]);
        let stmt = config.generate_query(&input, &Policy::default()).unwrap();
        assert!(!stmt.sql.contains("DROP TABLE"));
        assert_eq!(stmt.params, vec![Value::from("7; DROP TABLE address")]);
    }

    #[test]
    fn update_masks_targeted_fields_only() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let policy = erasure_policy(["A", "B"]);
        let row = row! {
            "id" => 1,
            "city" => "Exampletown",
            "state" => "NY",
            "zip" => "12345",
        };

        let stmt = config
            .generate_update_stmt(&row, &policy, &PrivacyRequest::with_id("pri_1"))
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"address\" SET \"city\" = $1, \"state\" = $2 WHERE \"id\" = $3"
        );
        assert_eq!(stmt.params, vec![Value::Null, Value::Null, Value::from(1)]);
    }

    #[test]
    fn update_without_matching_categories_is_skipped() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let policy = erasure_policy(["unrelated.category"]);
        let row = row! {"id" => 1, "city" => "Exampletown"};

        let stmt = config
            .generate_update_stmt(&row, &policy, &PrivacyRequest::with_id("pri_1"))
            .unwrap();
        assert_eq!(stmt, None);
    }

    #[test]
    fn update_requires_a_primary_key_field() {
        let mut collection = address_collection();
        collection.fields[0].primary_key = false;
        let node = node("ex", collection, vec![]);
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let row = row! {"id" => 1, "city" => "Exampletown"};

        let err = config
            .generate_update_stmt(&row, &erasure_policy(["A"]), &PrivacyRequest::with_id("p"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InsufficientData(_)));
    }

    #[test]
    fn update_requires_a_primary_key_value() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let row = row! {"id" => Value::Null, "city" => "Exampletown"};

        let err = config
            .generate_update_stmt(&row, &erasure_policy(["A"]), &PrivacyRequest::with_id("p"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InsufficientData(_)));
    }

    #[test]
    fn missing_masking_strategy_skips_unless_strict() {
        let node = address_node();
        let policy = Policy::new("p").with_rule(
            Rule::new("no_strategy", ActionType::Erasure)
                .with_target(RuleTarget::new("t", "A")),
        );
        let row = row! {"id" => 1, "city" => "Exampletown"};

        let lax = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        assert_eq!(
            lax.generate_update_stmt(&row, &policy, &PrivacyRequest::with_id("p"))
                .unwrap(),
            None
        );

        let strict = SqlQueryConfig::new(&node, SqlDialect::Postgres).with_strict_masking(true);
        let err = strict
            .generate_update_stmt(&row, &policy, &PrivacyRequest::with_id("p"))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Query(QueryError::MissingMaskingStrategy { .. })
        ));
    }

    #[test]
    fn fields_absent_from_the_row_are_not_updated() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        let row = row! {"id" => 1, "city" => "Exampletown"};

        let stmt = config
            .generate_update_stmt(&row, &erasure_policy(["A", "B"]), &PrivacyRequest::with_id("p"))
            .unwrap()
            .unwrap();
        // state is targeted but missing from the row, so only city is
        // rewritten.
        assert_eq!(
            stmt.sql,
            "UPDATE \"address\" SET \"city\" = $1 WHERE \"id\" = $2"
        );
    }

    #[test]
    fn dry_run_renders_unbound_placeholders() {
        let node = address_node();
        let config = SqlQueryConfig::new(&node, SqlDialect::Postgres);
        assert_eq!(
            config.dry_run_query().unwrap(),
            "SELECT \"id\", \"city\", \"state\", \"zip\" FROM \"address\" WHERE \"id\" IN ($1)"
        );

        let no_inputs = node_without_inputs();
        let config = SqlQueryConfig::new(&no_inputs, SqlDialect::Postgres);
        assert_eq!(config.dry_run_query(), None);
    }

    fn node_without_inputs() -> TraversalNode {
        node("ex", address_collection(), vec![])
    }

    #[test]
    fn mongo_filter_uses_in_and_or() {
        let collection = Collection::new(
            "users",
            vec![Field::new("_id").with_primary_key(true), Field::new("email")],
        );
        let mongo_node = node(
            "mongo_ex",
            collection,
            vec![
                Edge::new(
                    FieldAddress::new("ex", "customer", "email"),
                    FieldAddress::new("mongo_ex", "users", "email"),
                ),
                Edge::new(
                    FieldAddress::new("ex", "customer", "id"),
                    FieldAddress::new("mongo_ex", "users", "_id"),
                ),
            ],
        );
        let config = MongoQueryConfig::new(&mongo_node);

        let query = config
            .generate_query(
                &InputData::from([
                    ("email".to_string(), vec![Value::from("c@x.com")]),
                    ("_id".to_string(), vec![Value::from(1)]),
                ]),
                &Policy::default(),
            )
            .unwrap();
        assert_eq!(query.collection, "users");
        assert_eq!(
            query.filter,
            json!({"$or": [{"_id": {"$in": [1]}}, {"email": {"$in": ["c@x.com"]}}]})
        );
    }

    #[test]
    fn mongo_update_sets_nested_dotted_paths() {
        let collection = Collection::new(
            "users",
            vec![
                Field::new("_id").with_primary_key(true),
                Field::new("contact").with_fields(vec![
                    Field::new("email").with_data_categories(["A"]),
                    Field::new("phone"),
                ]),
            ],
        );
        let mongo_node = node("mongo_ex", collection, vec![]);
        let config = MongoQueryConfig::new(&mongo_node);
        let row = row! {
            "_id" => 1,
            "contact" => Value::Object(row! {"email" => "c@x.com", "phone" => "555"}),
        };

        let update = config
            .generate_update_stmt(&row, &erasure_policy(["A"]), &PrivacyRequest::with_id("p"))
            .unwrap()
            .unwrap();
        assert_eq!(update.filter, json!({"_id": 1}));
        assert_eq!(update.update, json!({"$set": {"contact.email": null}}));
    }
}
