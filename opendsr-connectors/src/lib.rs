//! Connector contract and per-dialect query generation.
//!
//! A [`Connector`] is the execution engine's only view of a data
//! store: test the connection, retrieve rows for a traversal node,
//! mask retrieved rows back, release resources. The SQL implementation
//! here is generic over a [`SqlClient`] backend so the concrete wire
//! protocol stays outside this crate; query generation itself is fully
//! specified per dialect and always parameter-binds values.

mod error;
mod query_config;
mod secrets;
mod sql;

use async_trait::async_trait;
use opendsr_data::Row;
use opendsr_graph::TraversalNode;
use opendsr_policy::{Policy, PrivacyRequest};

pub use error::{ConnectionError, ConnectorError, InsufficientDataError, QueryError};
pub use query_config::{
    InputData, MongoQuery, MongoQueryConfig, MongoUpdate, SqlDialect, SqlQueryConfig, SqlStatement,
};
pub use secrets::{MongoSecrets, MySqlSecrets, PostgresSecrets, RedshiftSecrets, SnowflakeSecrets};
pub use sql::{SqlClient, SqlConnector};

/// A connector to one data store, shared by every task of the
/// datasets it backs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and run a trivial query.
    async fn test_connection(&self) -> Result<(), ConnectionError>;

    /// Retrieve the rows of `node`'s collection reachable from
    /// `input_data`. An empty or all-null input yields no statement
    /// and an empty result without touching the store.
    async fn retrieve_data(
        &self,
        node: &TraversalNode,
        policy: &Policy,
        input_data: &InputData,
    ) -> Result<Vec<Row>, ConnectorError>;

    /// Mask the given retrieved rows according to the policy's erasure
    /// rules. Returns the number of records masked.
    async fn mask_data(
        &self,
        node: &TraversalNode,
        policy: &Policy,
        request: &PrivacyRequest,
        rows: &[Row],
    ) -> Result<usize, ConnectorError>;

    /// The query text `node` would run, with unbound placeholders.
    /// Never connects to the store.
    fn dry_run_query(&self, node: &TraversalNode) -> Option<String>;

    /// Idempotent release of pooled resources.
    async fn close(&self) -> Result<(), ConnectionError>;
}
