use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opendsr_connectors::Connector;
use opendsr_graph::{CollectionAddress, TraversalError};
use opendsr_policy::{
    ActionType, ExecutionLog, ExecutionLogStatus, Policy, PrivacyRequest, Store,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::ExecutionConfig;

/// Execution failed before any task ran.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Traversal(#[from] TraversalError),

    #[error("no connector is registered for connection key {0}")]
    MissingConnector(String),
}

/// Everything a running task needs: the request being executed, the
/// policy, one connector per connection key, the log store and the
/// execution settings. Immutable for the lifetime of the request;
/// shared across tasks behind an [`Arc`].
pub struct TaskResources {
    pub request: PrivacyRequest,
    pub policy: Policy,
    connectors: HashMap<String, Arc<dyn Connector>>,
    store: Arc<dyn Store>,
    config: ExecutionConfig,
    cancel: CancellationToken,
}

impl TaskResources {
    pub fn new(
        request: PrivacyRequest,
        policy: Policy,
        connectors: HashMap<String, Arc<dyn Connector>>,
        store: Arc<dyn Store>,
        config: ExecutionConfig,
    ) -> Self {
        TaskResources {
            request,
            policy,
            connectors,
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally-owned cancellation token, so the caller can
    /// abort the request.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The connector registered for a connection key. There is at most
    /// one client per key per request; tasks share it.
    pub fn connector(&self, connection_key: &str) -> Result<Arc<dyn Connector>, ExecutionError> {
        self.connectors
            .get(connection_key)
            .cloned()
            .ok_or_else(|| ExecutionError::MissingConnector(connection_key.to_owned()))
    }

    /// Append one execution-log entry for a collection-level task.
    pub fn log(
        &self,
        address: &CollectionAddress,
        action_type: ActionType,
        status: ExecutionLogStatus,
        fields_affected: Vec<String>,
        message: Option<String>,
    ) {
        self.store.append_execution_log(ExecutionLog {
            privacy_request_id: self.request.id.clone(),
            dataset_name: address.dataset.clone(),
            collection_name: address.collection.clone(),
            fields_affected,
            action_type,
            status,
            message,
            updated_at: Utc::now(),
        });
    }

    /// Release every connector. Idempotent; close failures are logged
    /// by the connectors themselves and do not fail the request.
    pub async fn close_connectors(&self) {
        for (key, connector) in &self.connectors {
            if let Err(error) = connector.close().await {
                warn!(%key, %error, "failed to close connector");
            }
        }
    }
}
