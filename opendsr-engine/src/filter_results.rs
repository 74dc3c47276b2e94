use std::collections::BTreeSet;

use opendsr_data::{Row, Value};
use opendsr_graph::{DataCategory, DatasetGraph, FieldPath};

use crate::AccessResults;

/// Project access results onto the requested data categories.
///
/// A field matches when any requested category is a dotted-segment
/// prefix of one of its declared categories. Matching field paths are
/// copied row by row into accumulators of the same shape, then empty
/// objects and arrays are pruned at every depth; a collection whose
/// rows all collapse to empty is dropped entirely.
pub fn filter_data_categories(
    results: &AccessResults,
    target_categories: &BTreeSet<DataCategory>,
    graph: &DatasetGraph,
) -> AccessResults {
    let mut filtered = AccessResults::new();

    for (address, rows) in results {
        let Some(collection) = graph.collection(address) else {
            continue;
        };
        let matching_paths: Vec<FieldPath> = collection
            .field_paths()
            .into_iter()
            .filter(|(_, field)| {
                field.data_categories.iter().any(|category| {
                    target_categories
                        .iter()
                        .any(|target| target.is_prefix_of(category))
                })
            })
            .map(|(path, _)| path)
            .collect();
        if matching_paths.is_empty() {
            continue;
        }

        let mut kept = Vec::new();
        for row in rows {
            let mut saved = Row::new();
            for path in &matching_paths {
                select_row(&mut saved, row, path.levels());
            }
            prune_row(&mut saved);
            if !saved.is_empty() {
                kept.push(saved);
            }
        }
        if !kept.is_empty() {
            filtered.insert(address.clone(), kept);
        }
    }

    filtered
}

/// Copy the value(s) at `levels` from `row` into the accumulator,
/// creating empty containers of the source's shape on the way down.
fn select_row(saved: &mut Row, row: &Row, levels: &[String]) {
    let Some((head, rest)) = levels.split_first() else {
        return;
    };
    let Some(child) = row.get(head) else {
        return;
    };
    let slot = saved
        .entry(head.clone())
        .or_insert_with(|| child.empty_like());
    select_and_save(slot, child, rest);
}

fn select_and_save(saved: &mut Value, source: &Value, levels: &[String]) {
    match source {
        Value::Array(items) => {
            // Arrays are transparent to field paths; accumulator
            // indices stay aligned with the source so repeated paths
            // land in the same elements.
            let Value::Array(accumulated) = saved else {
                return;
            };
            for (i, item) in items.iter().enumerate() {
                if accumulated.len() <= i {
                    accumulated.push(item.empty_like());
                }
                select_and_save(&mut accumulated[i], item, levels);
            }
        }
        Value::Object(map) => match levels.split_first() {
            Some((head, rest)) => {
                let Some(child) = map.get(head) else {
                    return;
                };
                let Value::Object(accumulated) = saved else {
                    return;
                };
                let slot = accumulated
                    .entry(head.clone())
                    .or_insert_with(|| child.empty_like());
                select_and_save(slot, child, rest);
            }
            // A path ending on an object selects the whole subtree.
            None => *saved = source.clone(),
        },
        scalar => {
            if levels.is_empty() {
                *saved = scalar.clone();
            }
        }
    }
}

/// Recursively drop empty objects and arrays at any depth.
fn remove_empty_containers(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                remove_empty_containers(child);
            }
            map.retain(|_, child| !child.is_empty_container());
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                remove_empty_containers(item);
            }
            items.retain(|item| !item.is_empty_container());
        }
        _ => {}
    }
}

fn prune_row(row: &mut Row) {
    for child in row.values_mut() {
        remove_empty_containers(child);
    }
    row.retain(|_, child| !child.is_empty_container());
}
