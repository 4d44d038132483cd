use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Run store: durable record of graphs and their step history.
///
/// Writes must be atomic per step: concurrent runs share one store and each
/// `append_step` is an independent single-row insert.
pub trait RunStore: Send + Sync + 'static {
    /// Find-or-create the graph row for `graph_name`.
    fn ensure_graph(&self, graph_name: &str) -> BoxFuture<'_, Result<GraphId>>;

    /// Append one step to the audit log.
    fn append_step(&self, step: &NewStep) -> BoxFuture<'_, Result<()>>;

    /// Look up a graph by name without creating it.
    fn find_graph(&self, graph_name: &str) -> BoxFuture<'_, Result<Option<GraphRecord>>>;

    /// All graphs, ordered by id.
    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphRecord>>>;

    /// Most recent runs first, optionally restricted to one graph.
    fn list_runs(
        &self,
        graph_id: Option<GraphId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>>;

    /// Steps of one run in execution order.
    fn load_steps(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<StepRecord>>>;
}
