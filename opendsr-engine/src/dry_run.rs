use std::collections::BTreeMap;

use indexmap::IndexMap;
use opendsr_data::Value;
use opendsr_graph::{CollectionAddress, DatasetGraph, Traversal};

use crate::{ExecutionError, TaskResources};

/// Placeholder identity value used when previewing queries; it is
/// never sent to a store.
const PLACEHOLDER_SEED: &str = "something";

/// The query text each traversal node would run, keyed by collection
/// address. Never connects to a data store.
pub fn collect_queries(
    traversal: &Traversal,
    graph: &DatasetGraph,
    resources: &TaskResources,
) -> Result<BTreeMap<CollectionAddress, String>, ExecutionError> {
    let mut queries = BTreeMap::new();
    for node in traversal.nodes() {
        let connector = resources.connector(graph.connection_key(&node.address.dataset))?;
        if let Some(query) = connector.dry_run_query(node) {
            queries.insert(node.address.clone(), query);
        }
    }
    Ok(queries)
}

/// Dry-run surface: plan a traversal from a placeholder value for
/// every declared identity key and collect each node's query text.
pub fn preview_queries(
    graph: &DatasetGraph,
    resources: &TaskResources,
) -> Result<BTreeMap<CollectionAddress, String>, ExecutionError> {
    let identity_seed: IndexMap<String, Value> = graph
        .identity_keys()
        .values()
        .map(|key| (key.clone(), Value::from(PLACEHOLDER_SEED)))
        .collect();
    let traversal = Traversal::new(graph, identity_seed)?;
    collect_queries(&traversal, graph, resources)
}
