use async_trait::async_trait;
use opendsr_data::Row;
use opendsr_graph::TraversalNode;
use opendsr_policy::{Policy, PrivacyRequest};
use tracing::{debug, info, warn};

use crate::{
    ConnectionError, Connector, ConnectorError, InputData, QueryError, SqlDialect, SqlQueryConfig,
    SqlStatement,
};

/// Minimal async backend a [`SqlConnector`] runs statements through.
///
/// The concrete wire protocol (tokio-postgres, mysql_async, a pool on
/// top of either) lives behind this trait; implementations are
/// expected to be internally thread-safe, since one client is shared
/// by every task of a dataset.
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Execute a SELECT, returning its rows.
    async fn select(&self, stmt: &SqlStatement) -> Result<Vec<Row>, QueryError>;

    /// Execute a write statement, returning the affected-row count.
    async fn execute(&self, stmt: &SqlStatement) -> Result<u64, QueryError>;

    /// Trivial liveness check (`SELECT 1` or the protocol ping).
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Idempotent release of pooled resources.
    async fn close(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// A connector to any store that speaks standard SQL through a
/// [`SqlClient`] backend.
pub struct SqlConnector<C> {
    client: C,
    dialect: SqlDialect,
    /// When set, each session is scoped with `SET search_path` before
    /// statements run (Redshift).
    search_path: Option<String>,
    strict_masking: bool,
}

impl<C: SqlClient> SqlConnector<C> {
    pub fn new(client: C, dialect: SqlDialect) -> Self {
        SqlConnector {
            client,
            dialect,
            search_path: None,
            strict_masking: false,
        }
    }

    pub fn with_search_path(mut self, schema: impl Into<String>) -> Self {
        self.search_path = Some(schema.into());
        self
    }

    pub fn with_strict_masking(mut self, strict: bool) -> Self {
        self.strict_masking = strict;
        self
    }

    fn query_config<'a>(&self, node: &'a TraversalNode) -> SqlQueryConfig<'a> {
        SqlQueryConfig::new(node, self.dialect).with_strict_masking(self.strict_masking)
    }

    async fn scope_session(&self) -> Result<(), QueryError> {
        if let Some(schema) = &self.search_path {
            debug!(%schema, "setting search_path for session");
            self.client
                .execute(&SqlStatement {
                    sql: format!(
                        "SET search_path TO {}",
                        self.dialect.quote_identifier(schema)
                    ),
                    params: vec![],
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: SqlClient> Connector for SqlConnector<C> {
    async fn test_connection(&self) -> Result<(), ConnectionError> {
        self.client.ping().await
    }

    async fn retrieve_data(
        &self,
        node: &TraversalNode,
        policy: &Policy,
        input_data: &InputData,
    ) -> Result<Vec<Row>, ConnectorError> {
        let Some(stmt) = self.query_config(node).generate_query(input_data, policy) else {
            return Ok(vec![]);
        };

        info!(address = %node.address, "starting data retrieval");
        self.scope_session().await?;
        Ok(self.client.select(&stmt).await?)
    }

    async fn mask_data(
        &self,
        node: &TraversalNode,
        policy: &Policy,
        request: &PrivacyRequest,
        rows: &[Row],
    ) -> Result<usize, ConnectorError> {
        let config = self.query_config(node);
        let mut masked = 0usize;
        for row in rows {
            match config.generate_update_stmt(row, policy, request) {
                Ok(Some(stmt)) => {
                    self.scope_session().await?;
                    masked += self.client.execute(&stmt).await? as usize;
                }
                Ok(None) => {}
                Err(ConnectorError::InsufficientData(err)) => {
                    warn!(address = %node.address, %err, "skipping row");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(masked)
    }

    fn dry_run_query(&self, node: &TraversalNode) -> Option<String> {
        self.query_config(node).dry_run_query()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        debug!("disposing of sql connector client");
        self.client.close().await
    }
}
