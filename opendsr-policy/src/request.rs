use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::ActionType;

/// An identified privacy request. The seed identities travel with the
/// execution call, not this record; what persists here is the identity
/// of the request itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyRequest {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PrivacyRequest {
    pub fn new() -> Self {
        PrivacyRequest {
            id: format!("pri_{}", Uuid::new_v4()),
            external_id: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        PrivacyRequest {
            id: id.into(),
            external_id: None,
            requested_at: Utc::now(),
        }
    }
}

impl Default for PrivacyRequest {
    fn default() -> Self {
        PrivacyRequest::new()
    }
}

/// Where a collection-level task currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionLogStatus {
    InProcessing,
    Retrying,
    Complete,
    Error,
    Paused,
}

/// One append-only record of task progress. Logs are the only durable
/// artifact of execution besides the side effects in the target
/// stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub privacy_request_id: String,
    pub dataset_name: String,
    pub collection_name: String,
    /// Top-level fields touched by the task, when known.
    #[serde(default)]
    pub fields_affected: Vec<String>,
    pub action_type: ActionType,
    pub status: ExecutionLogStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Response shape for a request status lookup. Execution logs are
/// embedded only when the caller asked for the verbose shape; this is
/// an explicit parameter, never a mutation of the request record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub privacy_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    /// Logs grouped by dataset name; `None` unless verbose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_logs: Option<BTreeMap<String, Vec<ExecutionLog>>>,
}

impl RequestStatus {
    pub fn of(request: &PrivacyRequest, verbose: bool, logs: Vec<ExecutionLog>) -> Self {
        let execution_logs = verbose.then(|| {
            let mut grouped: BTreeMap<String, Vec<ExecutionLog>> = BTreeMap::new();
            for log in logs {
                grouped.entry(log.dataset_name.clone()).or_default().push(log);
            }
            grouped
        });
        RequestStatus {
            privacy_request_id: request.id.clone(),
            external_id: request.external_id.clone(),
            requested_at: request.requested_at,
            execution_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn log(dataset: &str, collection: &str, status: ExecutionLogStatus) -> ExecutionLog {
        ExecutionLog {
            privacy_request_id: "pri_1".into(),
            dataset_name: dataset.into(),
            collection_name: collection.into(),
            fields_affected: vec![],
            action_type: ActionType::Access,
            status,
            message: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_strings_match_the_log_schema() {
        assert_eq!(ExecutionLogStatus::InProcessing.to_string(), "in_processing");
        assert_eq!(ExecutionLogStatus::Retrying.to_string(), "retrying");
        assert_eq!(ExecutionLogStatus::Error.to_string(), "error");
    }

    #[test]
    fn verbose_status_groups_logs_by_dataset() {
        let request = PrivacyRequest::with_id("pri_1");
        let logs = vec![
            log("postgres_example", "customer", ExecutionLogStatus::InProcessing),
            log("mongo_example", "users", ExecutionLogStatus::Complete),
            log("postgres_example", "address", ExecutionLogStatus::Complete),
        ];

        let verbose = RequestStatus::of(&request, true, logs.clone());
        let grouped = verbose.execution_logs.unwrap();
        assert_eq!(grouped["postgres_example"].len(), 2);
        assert_eq!(grouped["mongo_example"].len(), 1);

        let terse = RequestStatus::of(&request, false, logs);
        assert!(terse.execution_logs.is_none());
    }

    #[test]
    fn fresh_requests_get_unique_ids() {
        let a = PrivacyRequest::new();
        let b = PrivacyRequest::new();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("pri_"));
    }
}
