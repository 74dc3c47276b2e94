use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;
use opendsr_data::{Row, Value};
use petgraph::Direction;
use thiserror::Error;
use tracing::debug;

use crate::{Collection, CollectionAddress, DatasetGraph, Edge, FieldPath};

/// A collection scheduled for execution, with the edges the engine
/// must satisfy before running it resolved against the planned order.
#[derive(Clone, Debug)]
pub struct TraversalNode {
    pub address: CollectionAddress,
    pub collection: Arc<Collection>,
    /// Edges whose source is ROOT (seeded) or a collection earlier in
    /// the order. Back-edges of broken cycles are not included.
    pub incoming_edges: BTreeSet<Edge>,
    /// All edges out of this collection.
    pub outgoing_edges: BTreeSet<Edge>,
}

impl TraversalNode {
    /// Distinct destination field paths of the incoming edges, in
    /// address order. These are the fields a generated query may
    /// filter on.
    pub fn input_field_paths(&self) -> Vec<FieldPath> {
        self.incoming_edges
            .iter()
            .map(|e| e.destination.field_path.clone())
            .sorted()
            .dedup()
            .collect()
    }

    /// Collections this node draws inputs from, ROOT included.
    pub fn upstream_collections(&self) -> BTreeSet<CollectionAddress> {
        self.incoming_edges
            .iter()
            .map(|e| e.source.collection_address())
            .collect()
    }
}

/// The planner could not schedule every collection from the given
/// seed identities. No tasks run when this is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraversalError {
    #[error("unable to reach collections from the seed identities: {}", unreachable.iter().join(", "))]
    Unreachable { unreachable: Vec<CollectionAddress> },
}

/// A planned execution of a [`DatasetGraph`] from a seed map: a
/// deterministic order plus per-collection resolved inputs. Immutable
/// once constructed.
#[derive(Clone, Debug)]
pub struct Traversal {
    seed: IndexMap<String, Value>,
    order: Vec<CollectionAddress>,
    nodes: BTreeMap<CollectionAddress, Arc<TraversalNode>>,
}

impl Traversal {
    /// Plan a traversal.
    ///
    /// The walk is a readiness iteration: a collection is ready once
    /// every source collection of its incoming edges is ordered (ROOT
    /// counts only for seed keys present in `seed`). Ready collections
    /// are appended in (dataset, collection) lexical order, which makes
    /// the result deterministic. When the walk stalls with collections
    /// remaining, the cycle is broken at the lexically-first stalled
    /// collection that has at least one satisfied incoming edge; its
    /// unsatisfied back-edges are dropped from `incoming_edges`.
    pub fn new(graph: &DatasetGraph, seed: IndexMap<String, Value>) -> Result<Self, TraversalError> {
        let collection_graph = graph.collection_graph();
        let index_of: BTreeMap<CollectionAddress, petgraph::graph::NodeIndex> = collection_graph
            .node_indices()
            .map(|i| (collection_graph[i].clone(), i))
            .collect();

        // Collections with a seeded identity edge.
        let seeded: BTreeSet<CollectionAddress> = graph
            .edges()
            .iter()
            .filter(|e| e.is_from_root())
            .filter(|e| {
                e.source
                    .field_path
                    .head()
                    .is_some_and(|key| seed.contains_key(key))
            })
            .map(|e| e.destination.collection_address())
            .collect();

        let non_root_sources = |address: &CollectionAddress| -> BTreeSet<CollectionAddress> {
            collection_graph
                .neighbors_directed(index_of[address], Direction::Incoming)
                .map(|i| collection_graph[i].clone())
                .filter(|source| !source.is_root())
                .collect()
        };

        let mut ordered: Vec<CollectionAddress> = Vec::new();
        let mut ordered_set: BTreeSet<CollectionAddress> = BTreeSet::new();
        let mut remaining: BTreeSet<CollectionAddress> =
            graph.collections().map(|(a, _)| a.clone()).collect();

        while !remaining.is_empty() {
            let ready: Vec<CollectionAddress> = remaining
                .iter()
                .filter(|&address| {
                    let sources = non_root_sources(address);
                    let has_input = seeded.contains(address) || !sources.is_empty();
                    has_input
                        && sources.iter().all(|s| ordered_set.contains(s))
                        && graph
                            .after_constraints(address)
                            .iter()
                            .all(|a| ordered_set.contains(a))
                })
                .cloned()
                .collect();

            if !ready.is_empty() {
                for address in ready {
                    remaining.remove(&address);
                    ordered_set.insert(address.clone());
                    ordered.push(address);
                }
                continue;
            }

            // Stalled: break a cycle at the first collection that has
            // at least one satisfied input, if any.
            let breakable = remaining
                .iter()
                .find(|&address| {
                    (seeded.contains(address)
                        || non_root_sources(address)
                            .iter()
                            .any(|s| ordered_set.contains(s)))
                        && graph
                            .after_constraints(address)
                            .iter()
                            .all(|a| ordered_set.contains(a))
                })
                .cloned();

            match breakable {
                Some(address) => {
                    debug!(%address, "breaking reference cycle");
                    remaining.remove(&address);
                    ordered_set.insert(address.clone());
                    ordered.push(address);
                }
                None => break,
            }
        }

        if !remaining.is_empty() {
            return Err(TraversalError::Unreachable {
                unreachable: remaining.into_iter().collect(),
            });
        }

        let position: BTreeMap<&CollectionAddress, usize> =
            ordered.iter().enumerate().map(|(i, a)| (a, i)).collect();

        let mut nodes = BTreeMap::new();
        for address in &ordered {
            let mut incoming_edges = BTreeSet::new();
            for edge in graph.edges_into(address) {
                let satisfied = if edge.is_from_root() {
                    edge.source
                        .field_path
                        .head()
                        .is_some_and(|key| seed.contains_key(key))
                } else {
                    position
                        .get(&edge.source.collection_address())
                        .is_some_and(|p| *p < position[address])
                };
                if satisfied {
                    incoming_edges.insert(edge.clone());
                } else {
                    debug!(%edge, "dropping unsatisfied edge from traversal");
                }
            }

            let outgoing_edges = graph
                .edges()
                .iter()
                .filter(|e| e.source.collection_address() == *address)
                .cloned()
                .collect();

            // Collection presence is guaranteed: `ordered` only ever
            // holds addresses drawn from the graph.
            let collection = graph
                .collection(address)
                .cloned()
                .unwrap_or_else(|| Arc::new(Collection::new(address.collection.clone(), vec![])));

            nodes.insert(
                address.clone(),
                Arc::new(TraversalNode {
                    address: address.clone(),
                    collection,
                    incoming_edges,
                    outgoing_edges,
                }),
            );
        }

        Ok(Traversal { seed, order: ordered, nodes })
    }

    pub fn seed(&self) -> &IndexMap<String, Value> {
        &self.seed
    }

    /// The output of the synthetic ROOT node: a single pseudo-row
    /// carrying one column per seed key.
    pub fn seed_row(&self) -> Row {
        self.seed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Execution order. ROOT and TERMINATOR are implicit: ROOT
    /// precedes everything, TERMINATOR follows everything.
    pub fn order(&self) -> &[CollectionAddress] {
        &self.order
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&Arc<TraversalNode>> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<TraversalNode>> {
        self.order.iter().filter_map(|a| self.nodes.get(a))
    }

    /// Collections with no dataflow into another ordered collection;
    /// the inputs of the synthetic TERMINATOR sink.
    pub fn terminal_addresses(&self) -> Vec<CollectionAddress> {
        self.order
            .iter()
            .filter(|address| {
                self.nodes[*address]
                    .outgoing_edges
                    .iter()
                    .all(|e| !self.nodes.contains_key(&e.destination.collection_address()))
            })
            .cloned()
            .collect()
    }
}
