//! Concurrent privacy-request execution.
//!
//! Given a planned [`Traversal`](opendsr_graph::Traversal), the engine
//! runs one task per collection: each task waits for every upstream
//! task to reach a terminal state, unions the upstream outputs into
//! filter inputs, drives the dataset's connector with bounded retries,
//! records execution logs through the [`Store`](opendsr_policy::Store)
//! contract, and publishes its rows downstream. Access results can
//! then be projected onto requested data categories with
//! [`filter_data_categories`] and replayed into an erasure pass with
//! [`run_erasure`].

mod config;
mod dry_run;
mod filter_results;
mod graph_task;
mod resources;

pub use config::{ExecutionConfig, ExecutionConfigError};
pub use dry_run::{collect_queries, preview_queries};
pub use filter_results::filter_data_categories;
pub use graph_task::{run_access_request, run_erasure, AccessResults, ErasureResults};
pub use resources::{ExecutionError, TaskResources};
