use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::{Collection, CollectionAddress, Dataset, FieldAddress, ReferenceDirection};

/// A directed dependency between two fields: values observed at
/// `source` become candidate filter inputs for `destination`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub source: FieldAddress,
    pub destination: FieldAddress,
}

impl Edge {
    pub fn new(source: FieldAddress, destination: FieldAddress) -> Self {
        Edge { source, destination }
    }

    /// True if this edge injects a seed identity value.
    pub fn is_from_root(&self) -> bool {
        self.source.is_root()
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// Fatal dataset-declaration errors. Never retried: the graph cannot
/// be constructed until the declarations are fixed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {declaring} declares a reference to unknown field {reference}")]
    UnknownFieldReference {
        declaring: FieldAddress,
        reference: FieldAddress,
    },

    #[error("collection {0} is declared by more than one dataset")]
    DuplicateCollection(CollectionAddress),

    #[error("field {0} declares a reference to itself")]
    SelfReference(FieldAddress),
}

/// The merged, immutable graph of every declared collection.
///
/// Built once per request from the dataset declarations; the traversal
/// planner and the result filter both read it, neither mutates it.
#[derive(Clone, Debug)]
pub struct DatasetGraph {
    collections: BTreeMap<CollectionAddress, Arc<Collection>>,
    edges: BTreeSet<Edge>,
    identity_keys: BTreeMap<FieldAddress, String>,
    after: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
    connection_keys: BTreeMap<String, String>,
}

impl DatasetGraph {
    pub fn new(datasets: Vec<Dataset>) -> Result<Self, ConfigError> {
        let mut collections: BTreeMap<CollectionAddress, Arc<Collection>> = BTreeMap::new();
        let mut dataset_members: BTreeMap<String, Vec<CollectionAddress>> = BTreeMap::new();
        let mut connection_keys = BTreeMap::new();
        let mut after: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>> = BTreeMap::new();

        for dataset in &datasets {
            connection_keys
                .insert(dataset.name.clone(), dataset.connection_key().to_owned());
            for collection in &dataset.collections {
                let address = CollectionAddress::new(&dataset.name, &collection.name);
                if collections
                    .insert(address.clone(), Arc::new(collection.clone()))
                    .is_some()
                {
                    return Err(ConfigError::DuplicateCollection(address));
                }
                dataset_members
                    .entry(dataset.name.clone())
                    .or_default()
                    .push(address.clone());
                after
                    .entry(address)
                    .or_default()
                    .extend(collection.after.iter().cloned());
            }
        }

        // Dataset-level `after` hints: every collection of this
        // dataset waits for every collection of the named dataset.
        for dataset in &datasets {
            if dataset.after.is_empty() {
                continue;
            }
            let predecessors: Vec<CollectionAddress> = dataset
                .after
                .iter()
                .flat_map(|name| dataset_members.get(name).cloned().unwrap_or_default())
                .collect();
            for member in dataset_members.get(&dataset.name).into_iter().flatten() {
                after
                    .entry(member.clone())
                    .or_default()
                    .extend(predecessors.iter().cloned());
            }
        }

        // Flatten every field for reference validation.
        let mut declared_fields: HashSet<FieldAddress> = HashSet::new();
        for (address, collection) in &collections {
            for path in collection.field_paths().keys() {
                declared_fields.insert(address.field(path.clone()));
            }
        }

        let mut edges = BTreeSet::new();
        let mut identity_keys = BTreeMap::new();

        for (address, collection) in &collections {
            for (path, field) in collection.field_paths() {
                let declaring = address.field(path);

                if let Some(seed_key) = &field.identity {
                    edges.insert(Edge::new(FieldAddress::root(seed_key), declaring.clone()));
                    identity_keys.insert(declaring.clone(), seed_key.clone());
                }

                for reference in &field.references {
                    let target = reference.address();
                    if target == declaring {
                        return Err(ConfigError::SelfReference(declaring));
                    }
                    if !declared_fields.contains(&target) {
                        return Err(ConfigError::UnknownFieldReference {
                            declaring,
                            reference: target,
                        });
                    }
                    match reference.direction {
                        ReferenceDirection::From => {
                            edges.insert(Edge::new(target, declaring.clone()));
                        }
                        ReferenceDirection::To => {
                            edges.insert(Edge::new(declaring.clone(), target));
                        }
                        ReferenceDirection::Bidirectional => {
                            edges.insert(Edge::new(target.clone(), declaring.clone()));
                            edges.insert(Edge::new(declaring.clone(), target));
                        }
                    }
                }
            }
        }

        debug!(
            collections = collections.len(),
            edges = edges.len(),
            identities = identity_keys.len(),
            "dataset graph built"
        );

        Ok(DatasetGraph {
            collections,
            edges,
            identity_keys,
            after,
            connection_keys,
        })
    }

    pub fn collections(&self) -> impl Iterator<Item = (&CollectionAddress, &Arc<Collection>)> {
        self.collections.iter()
    }

    pub fn collection(&self, address: &CollectionAddress) -> Option<&Arc<Collection>> {
        self.collections.get(address)
    }

    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    pub fn edges_into<'a>(
        &'a self,
        address: &'a CollectionAddress,
    ) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .iter()
            .filter(move |e| e.destination.collection_address() == *address)
    }

    /// Seed-key name for every field marked `identity`.
    pub fn identity_keys(&self) -> &BTreeMap<FieldAddress, String> {
        &self.identity_keys
    }

    /// Ordering-only predecessors declared via `after` hints.
    pub fn after_constraints(&self, address: &CollectionAddress) -> BTreeSet<CollectionAddress> {
        self.after.get(address).cloned().unwrap_or_default()
    }

    /// Connection key the given dataset is reached through.
    pub fn connection_key<'a>(&'a self, dataset: &'a str) -> &'a str {
        self.connection_keys
            .get(dataset)
            .map(String::as_str)
            .unwrap_or(dataset)
    }

    /// Collection-level digraph: one node per collection plus the
    /// synthetic ROOT, one edge per (source collection, destination
    /// collection) pair with at least one field edge.
    pub fn collection_graph(&self) -> DiGraph<CollectionAddress, ()> {
        let mut graph = DiGraph::new();
        let mut indices: BTreeMap<CollectionAddress, NodeIndex> = BTreeMap::new();

        let root = graph.add_node(CollectionAddress::root());
        indices.insert(CollectionAddress::root(), root);
        for address in self.collections.keys() {
            let index = graph.add_node(address.clone());
            indices.insert(address.clone(), index);
        }

        for edge in &self.edges {
            let source = indices[&edge.source.collection_address()];
            let destination = indices[&edge.destination.collection_address()];
            if !graph.contains_edge(source, destination) {
                graph.add_edge(source, destination, ());
            }
        }
        graph
    }

    /// Graphviz rendering of the collection-level graph, for
    /// diagnosing reachability problems in dataset declarations.
    pub fn to_dot(&self) -> String {
        let graph = self
            .collection_graph()
            .map(|_, address| address.to_string(), |_, _| ());
        format!("{:?}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }
}
