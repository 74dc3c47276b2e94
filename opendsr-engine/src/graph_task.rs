use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use indexmap::IndexMap;
use metrics::counter;
use opendsr_connectors::{Connector, ConnectorError, InputData};
use opendsr_data::{Row, Value};
use opendsr_graph::{CollectionAddress, DatasetGraph, Traversal, TraversalNode};
use opendsr_policy::{ActionType, ExecutionLogStatus};
use tracing::{info, warn};

use crate::{ExecutionError, TaskResources};

/// Rows retrieved per collection by an access request. Errored nodes
/// are absent; completed nodes with no reachable rows map to an empty
/// list.
pub type AccessResults = BTreeMap<CollectionAddress, Vec<Row>>;

/// Rows masked per collection by an erasure request. Every traversed
/// collection is present; errored and skipped nodes report 0.
pub type ErasureResults = BTreeMap<CollectionAddress, usize>;

const CANCELLED_MESSAGE: &str = "cancelled";
const NO_PRIMARY_KEY_MESSAGE: &str =
    "No values were erased since no primary key was defined for this collection";

/// How long an in-flight connector call may keep running after the
/// request is cancelled before it is abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Terminal state of one access task, shared with every downstream
/// task. A failed node publishes an empty row list so downstream tasks
/// can proceed (and typically yield empty too).
#[derive(Clone)]
enum NodeOutcome {
    Complete(Arc<Vec<Row>>),
    Failed(Arc<Vec<Row>>),
}

impl NodeOutcome {
    fn failed() -> Self {
        NodeOutcome::Failed(Arc::new(Vec::new()))
    }

    fn rows(&self) -> &[Row] {
        match self {
            NodeOutcome::Complete(rows) | NodeOutcome::Failed(rows) => rows,
        }
    }
}

enum TaskFailure {
    Cancelled,
    Failed(String),
}

type SharedOutcome = Shared<BoxFuture<'static, NodeOutcome>>;

/// One collection-level task: a traversal node bound to its connector
/// and the request-wide resources.
struct GraphTask {
    node: Arc<TraversalNode>,
    connector: Arc<dyn Connector>,
    resources: Arc<TaskResources>,
}

impl GraphTask {
    fn log(&self, action: ActionType, status: ExecutionLogStatus, message: Option<String>) {
        let fields_affected = match status {
            ExecutionLogStatus::Complete => self.categorized_fields(),
            _ => Vec::new(),
        };
        self.resources
            .log(&self.node.address, action, status, fields_affected, message);
    }

    /// Top-level fields carrying data categories; what an access or
    /// erasure of this collection can touch.
    fn categorized_fields(&self) -> Vec<String> {
        self.node
            .collection
            .fields
            .iter()
            .filter(|f| !f.data_categories.is_empty())
            .map(|f| f.name.clone())
            .collect()
    }

    /// Union the upstream outputs into per-destination-field filter
    /// inputs, de-duplicating values while preserving insertion order.
    fn build_input_data(&self, upstream: &[(CollectionAddress, NodeOutcome)]) -> InputData {
        let by_address: HashMap<&CollectionAddress, &NodeOutcome> =
            upstream.iter().map(|(a, o)| (a, o)).collect();

        let mut input = InputData::new();
        for edge in &self.node.incoming_edges {
            let source = edge.source.collection_address();
            let Some(outcome) = by_address.get(&source) else {
                continue;
            };
            let values = input.entry(edge.destination.field_path.to_string()).or_default();
            for row in outcome.rows() {
                for value in edge.source.field_path.values_in(row) {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
        }
        input
    }

    /// Run one connector call under the per-call timeout, watching the
    /// request's cancellation token. A cancelled in-flight call gets a
    /// short grace window to finish before it is abandoned.
    async fn guarded<T, Fut>(&self, call: Fut) -> Result<T, TaskFailure>
    where
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let timeout = self.resources.config().call_timeout();
        let mut call = std::pin::pin!(tokio::time::timeout(timeout, call));
        tokio::select! {
            biased;
            _ = self.resources.cancellation_token().cancelled() => {
                match tokio::time::timeout(CANCEL_GRACE, &mut call).await {
                    Ok(Ok(Ok(value))) => Ok(value),
                    _ => Err(TaskFailure::Cancelled),
                }
            }
            result = &mut call => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(TaskFailure::Failed(error.to_string())),
                Err(_) => Err(TaskFailure::Failed("connector call timed out".into())),
            }
        }
    }

    /// Drive `f` to success or retry exhaustion, logging `retrying`
    /// between attempts and `error` at the end. The sleep before retry
    /// `n` (0-based) is `delay * backoff^n`.
    async fn with_retries<T, F, Fut>(&self, action: ActionType, f: F) -> Result<T, ()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let config = self.resources.config();
        let mut attempt: u32 = 0;
        loop {
            match self.guarded(f()).await {
                Ok(value) => return Ok(value),
                Err(TaskFailure::Cancelled) => {
                    self.log(action, ExecutionLogStatus::Error, Some(CANCELLED_MESSAGE.into()));
                    return Err(());
                }
                Err(TaskFailure::Failed(message)) if attempt < config.task_retry_count => {
                    warn!(
                        address = %self.node.address,
                        %message,
                        attempt,
                        "task attempt failed, retrying"
                    );
                    self.log(action, ExecutionLogStatus::Retrying, Some(message));
                    tokio::time::sleep(config.retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(TaskFailure::Failed(message)) => {
                    warn!(address = %self.node.address, %message, "task failed, retries exhausted");
                    self.log(action, ExecutionLogStatus::Error, Some(message));
                    return Err(());
                }
            }
        }
    }

    /// The access protocol for one node: wait for upstream (done by
    /// the caller), gather inputs, retrieve, publish downstream.
    async fn access(&self, upstream: Vec<(CollectionAddress, NodeOutcome)>) -> NodeOutcome {
        if self.resources.cancellation_token().is_cancelled() {
            self.log(
                ActionType::Access,
                ExecutionLogStatus::Error,
                Some(CANCELLED_MESSAGE.into()),
            );
            return NodeOutcome::failed();
        }

        self.log(ActionType::Access, ExecutionLogStatus::InProcessing, None);
        let input_data = self.build_input_data(&upstream);

        let retrieved = self
            .with_retries(ActionType::Access, || {
                self.connector
                    .retrieve_data(&self.node, &self.resources.policy, &input_data)
            })
            .await;

        match retrieved {
            Ok(rows) => {
                info!(address = %self.node.address, rows = rows.len(), "access task complete");
                self.log(ActionType::Access, ExecutionLogStatus::Complete, None);
                counter!("opendsr_engine_tasks_completed_total").increment(1);
                NodeOutcome::Complete(Arc::new(rows))
            }
            Err(()) => {
                counter!("opendsr_engine_tasks_failed_total").increment(1);
                NodeOutcome::failed()
            }
        }
    }

    /// The erasure protocol for one node: replay the access rows into
    /// `mask_data`, guarding collections that declare no primary key.
    async fn erasure(&self, rows: Arc<Vec<Row>>) -> usize {
        if self.resources.cancellation_token().is_cancelled() {
            self.log(
                ActionType::Erasure,
                ExecutionLogStatus::Error,
                Some(CANCELLED_MESSAGE.into()),
            );
            return 0;
        }

        self.log(ActionType::Erasure, ExecutionLogStatus::InProcessing, None);

        if self.node.collection.primary_key_paths().is_empty() {
            warn!(address = %self.node.address, "skipping erasure, no primary key");
            self.log(
                ActionType::Erasure,
                ExecutionLogStatus::Complete,
                Some(NO_PRIMARY_KEY_MESSAGE.into()),
            );
            return 0;
        }

        let masked = self
            .with_retries(ActionType::Erasure, || {
                self.connector.mask_data(
                    &self.node,
                    &self.resources.policy,
                    &self.resources.request,
                    &rows,
                )
            })
            .await;

        match masked {
            Ok(count) => {
                info!(address = %self.node.address, count, "erasure task complete");
                self.log(ActionType::Erasure, ExecutionLogStatus::Complete, None);
                counter!("opendsr_engine_rows_masked_total").increment(count as u64);
                count
            }
            Err(()) => 0,
        }
    }
}

/// Resolve one [`GraphTask`] per traversal node, failing fast if any
/// dataset lacks a connector. Nothing runs until every node resolves.
fn resolve_tasks(
    resources: &Arc<TaskResources>,
    graph: &DatasetGraph,
    traversal: &Traversal,
) -> Result<Vec<GraphTask>, ExecutionError> {
    traversal
        .nodes()
        .map(|node| {
            let connector = resources.connector(graph.connection_key(&node.address.dataset))?;
            Ok(GraphTask {
                node: Arc::clone(node),
                connector,
                resources: Arc::clone(resources),
            })
        })
        .collect()
}

/// Execute an access request: plan the traversal from the seed
/// identities, run one task per collection respecting the edge
/// partial order, and collect the retrieved rows.
///
/// Tasks without an edge between them run concurrently; a task starts
/// only after every task it has an incoming edge from reached a
/// terminal state. Node-scoped failures do not abort the request:
/// the failed node is dropped from the result map and its downstream
/// sees empty inputs.
pub async fn run_access_request(
    resources: &Arc<TaskResources>,
    graph: &DatasetGraph,
    identity: IndexMap<String, Value>,
) -> Result<AccessResults, ExecutionError> {
    let traversal = Traversal::new(graph, identity)?;
    let tasks = resolve_tasks(resources, graph, &traversal)?;

    let seed_outcome = NodeOutcome::Complete(Arc::new(vec![traversal.seed_row()]));
    let root_future: SharedOutcome = futures::future::ready(seed_outcome).boxed().shared();

    let mut node_futures: BTreeMap<CollectionAddress, SharedOutcome> = BTreeMap::new();
    for task in tasks {
        let upstream: Vec<(CollectionAddress, SharedOutcome)> = task
            .node
            .upstream_collections()
            .into_iter()
            .filter_map(|address| {
                let future = if address.is_root() {
                    root_future.clone()
                } else {
                    // Present by construction: planner order is edge-sound.
                    node_futures.get(&address)?.clone()
                };
                Some((address, future))
            })
            .collect();

        let address = task.node.address.clone();
        let future: SharedOutcome = async move {
            let mut finished = Vec::with_capacity(upstream.len());
            for (source, future) in upstream {
                finished.push((source, future.await));
            }
            task.access(finished).await
        }
        .boxed()
        .shared();

        // Drive eagerly so siblings overlap; the shared handle below
        // is what downstream tasks and the result collection await.
        tokio::spawn(future.clone());
        node_futures.insert(address, future);
    }

    let mut results = AccessResults::new();
    for (address, future) in node_futures {
        if let NodeOutcome::Complete(rows) = future.await {
            results.insert(address, rows.as_ref().clone());
        }
    }
    Ok(results)
}

/// Execute an erasure request over the rows a prior access pass
/// retrieved. Collections with no access rows mask 0 records;
/// collections without a primary key are skipped with a diagnostic
/// log entry.
pub async fn run_erasure(
    resources: &Arc<TaskResources>,
    graph: &DatasetGraph,
    identity: IndexMap<String, Value>,
    access_request_data: &AccessResults,
) -> Result<ErasureResults, ExecutionError> {
    let traversal = Traversal::new(graph, identity)?;
    let tasks = resolve_tasks(resources, graph, &traversal)?;

    let mut join_set = tokio::task::JoinSet::new();
    for task in tasks {
        let rows = Arc::new(
            access_request_data
                .get(&task.node.address)
                .cloned()
                .unwrap_or_default(),
        );
        join_set.spawn(async move { (task.node.address.clone(), task.erasure(rows).await) });
    }

    let mut results = ErasureResults::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok((address, count)) = joined {
            results.insert(address, count);
        }
    }
    Ok(results)
}
