use std::collections::HashMap;

use opendsr_graph::Dataset;
use parking_lot::RwLock;

use crate::{ExecutionLog, Policy};

/// Persistence contract consumed by the execution engine.
///
/// `append_execution_log` is called from concurrently running tasks
/// and must be safe under concurrent writers; the engine never updates
/// a log entry in place.
pub trait Store: Send + Sync {
    fn append_execution_log(&self, entry: ExecutionLog);

    /// The log tail for one privacy request, in append order.
    fn execution_logs(&self, privacy_request_id: &str) -> Vec<ExecutionLog>;

    fn load_policy(&self, key: &str) -> Option<Policy>;

    fn load_dataset_configs(&self, keys: &[String]) -> Vec<Dataset>;
}

/// In-memory [`Store`] for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    logs: RwLock<Vec<ExecutionLog>>,
    policies: RwLock<HashMap<String, Policy>>,
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn insert_policy(&self, policy: Policy) {
        self.policies.write().insert(policy.key.clone(), policy);
    }

    pub fn insert_dataset(&self, dataset: Dataset) {
        self.datasets.write().insert(dataset.name.clone(), dataset);
    }
}

impl Store for MemoryStore {
    fn append_execution_log(&self, entry: ExecutionLog) {
        self.logs.write().push(entry);
    }

    fn execution_logs(&self, privacy_request_id: &str) -> Vec<ExecutionLog> {
        self.logs
            .read()
            .iter()
            .filter(|l| l.privacy_request_id == privacy_request_id)
            .cloned()
            .collect()
    }

    fn load_policy(&self, key: &str) -> Option<Policy> {
        self.policies.read().get(key).cloned()
    }

    fn load_dataset_configs(&self, keys: &[String]) -> Vec<Dataset> {
        let datasets = self.datasets.read();
        keys.iter().filter_map(|k| datasets.get(k).cloned()).collect()
    }
}
