use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use stepgraph_core::config::AppConfig;
use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::event::EventBus;
use stepgraph_core::traits::RunStore;
use stepgraph_core::types::{
    GraphId, NewStep, Route, RunEvent, RunId, RunState, CAP_SENTINEL, END_SENTINEL,
};

use super::node::{BoxedNode, ErasedNode, Invocation};
use crate::retry::RetryPolicy;

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// `Completed` or `CapReached`; failed runs return an error instead.
    pub state: RunState,
    /// Node executions recorded (excluding the cap marker).
    pub steps: usize,
    /// Output of the last executed node.
    pub output: Value,
    pub elapsed_ms: u64,
}

/// Executes a routing-driven node graph.
///
/// Starting from `start_node`, each node runs under the retry policy, its
/// outcome is appended to the run store, and its route names the next node.
/// Routing may revisit nodes; `max_steps` bounds the run.
pub struct GraphExecutor {
    graph_name: String,
    graph_id: GraphId,
    nodes: HashMap<String, BoxedNode>,
    start_node: String,
    store: Arc<dyn RunStore>,
    retry: RetryPolicy,
    max_steps: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    /// Register `nodes` under `graph_name` and ensure the graph row exists.
    ///
    /// Fails with a config error when the node set is empty, when two nodes
    /// share an identity, when an identity is a reserved routing sentinel
    /// (`END`, `MAX_STEPS`), or when `start_node` is not registered.
    pub async fn new(
        graph_name: impl Into<String>,
        nodes: Vec<BoxedNode>,
        store: Arc<dyn RunStore>,
        start_node: impl Into<String>,
    ) -> Result<Self> {
        let graph_name = graph_name.into();
        let start_node = start_node.into();

        if nodes.is_empty() {
            return Err(StepgraphError::Config(format!(
                "Graph '{}' has no nodes",
                graph_name
            )));
        }

        let mut node_map: HashMap<String, BoxedNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let id = node.node_id().to_string();
            // `routed` stores identities and sentinels in the same column
            if id == END_SENTINEL || id == CAP_SENTINEL {
                return Err(StepgraphError::Config(format!(
                    "Node type '{}' is reserved in graph '{}'",
                    id, graph_name
                )));
            }
            if node_map.contains_key(&id) {
                return Err(StepgraphError::Config(format!(
                    "Duplicate node type '{}' in graph '{}'",
                    id, graph_name
                )));
            }
            node_map.insert(id, node);
        }

        if !node_map.contains_key(&start_node) {
            return Err(StepgraphError::Config(format!(
                "Start node '{}' not found in graph '{}'",
                start_node, graph_name
            )));
        }

        let graph_id = store.ensure_graph(&graph_name).await?;
        debug!(graph = %graph_name, graph_id = %graph_id, nodes = node_map.len(), "Graph registered");

        Ok(Self {
            graph_name,
            graph_id,
            nodes: node_map,
            start_node,
            store,
            retry: RetryPolicy::default(),
            max_steps: AppConfig::default().engine.max_steps,
            event_bus: None,
        })
    }

    /// Set the retry policy applied to every node.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the step cap (minimum 1).
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Publish run events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Apply the `[engine]` and `[retry]` sections of `config`.
    pub fn with_config(self, config: &AppConfig) -> Self {
        self.with_retry(RetryPolicy::from_config(&config.retry))
            .with_max_steps(config.engine.max_steps)
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Registered node identities, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Run the graph with a typed input and decode the final output.
    pub async fn run<I, O>(&self, input: I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let report = self.run_detailed(input).await?;
        Ok(serde_json::from_value(report.output)?)
    }

    /// Run the graph on a JSON input and return the final JSON output.
    pub async fn run_value(&self, input: Value) -> Result<Value> {
        Ok(self.run_detailed(input).await?.output)
    }

    /// Run the graph and report how the run ended.
    ///
    /// Exhausted retries return `RetryExhausted` after the failure step is
    /// recorded. Hitting the step cap is not an error: a `MAX_STEPS` step is
    /// recorded and the last output is returned with `RunState::CapReached`.
    pub async fn run_detailed(&self, input: Value) -> Result<RunReport> {
        let start = Instant::now();
        let run_id = RunId::new();

        info!(graph = %self.graph_name, run_id = %run_id, "Run started");
        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            graph_name: self.graph_name.clone(),
        });

        let mut node = self.resolve(&self.start_node)?;
        let mut current_input = input;
        let mut step_count = 0usize;

        loop {
            let node_start = Instant::now();
            let result = self
                .retry
                .retry_notify(
                    || node.invoke(current_input.clone()),
                    |attempt, backoff, e| {
                        self.publish(RunEvent::RetryScheduled {
                            run_id: run_id.clone(),
                            node_type: node.node_id().to_string(),
                            attempt,
                            backoff_ms: backoff.as_millis() as u64,
                            error: e.to_string(),
                        })
                    },
                )
                .await;

            let Invocation { output, route } = match result {
                Ok(invocation) => invocation,
                Err(e) => {
                    error!(
                        graph = %self.graph_name,
                        run_id = %run_id,
                        node_type = %node.node_id(),
                        error = %e,
                        "Graph node failed"
                    );
                    self.record(NewStep {
                        run_id: run_id.clone(),
                        graph_id: self.graph_id,
                        node_type: node.node_id().to_string(),
                        input: serde_json::to_string(&current_input)?,
                        output: serde_json::json!({ "error": e.to_string() }).to_string(),
                        routed: node.node_id().to_string(),
                        success: false,
                        timestamp: Utc::now(),
                    })
                    .await?;
                    self.publish(RunEvent::RunFailed {
                        run_id: run_id.clone(),
                        node_type: node.node_id().to_string(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            self.record(NewStep {
                run_id: run_id.clone(),
                graph_id: self.graph_id,
                node_type: node.node_id().to_string(),
                input: serde_json::to_string(&current_input)?,
                output: serde_json::to_string(&output)?,
                routed: route.as_routed().to_string(),
                success: true,
                timestamp: Utc::now(),
            })
            .await?;
            step_count += 1;

            debug!(
                node_type = %node.node_id(),
                routed = %route.as_routed(),
                elapsed_ms = node_start.elapsed().as_millis() as u64,
                step = step_count,
                "Node execution complete"
            );

            let next_id = match route {
                Route::End => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    info!(
                        graph = %self.graph_name,
                        run_id = %run_id,
                        steps = step_count,
                        elapsed_ms,
                        "Run completed"
                    );
                    self.publish(RunEvent::RunCompleted {
                        run_id: run_id.clone(),
                        steps: step_count,
                    });
                    return Ok(RunReport {
                        run_id,
                        state: RunState::Completed,
                        steps: step_count,
                        output,
                        elapsed_ms,
                    });
                }
                Route::Next(id) => id,
            };

            let next = self.resolve(&next_id)?;
            // The output is owned by the engine from here on
            current_input = output;

            if step_count >= self.max_steps {
                warn!(
                    graph = %self.graph_name,
                    run_id = %run_id,
                    max_steps = self.max_steps,
                    pending = %next_id,
                    "Step cap reached, terminating run"
                );
                self.record(NewStep {
                    run_id: run_id.clone(),
                    graph_id: self.graph_id,
                    node_type: next_id,
                    input: serde_json::to_string(&current_input)?,
                    output: serde_json::json!({
                        "error": "iteration cap reached",
                        "max_steps": self.max_steps,
                    })
                    .to_string(),
                    routed: CAP_SENTINEL.to_string(),
                    success: false,
                    timestamp: Utc::now(),
                })
                .await?;
                self.publish(RunEvent::CapReached {
                    run_id: run_id.clone(),
                    max_steps: self.max_steps,
                });
                return Ok(RunReport {
                    run_id,
                    state: RunState::CapReached,
                    steps: step_count,
                    output: current_input,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }

            node = next;
        }
    }

    fn resolve(&self, node_type: &str) -> Result<&dyn ErasedNode> {
        self.nodes
            .get(node_type)
            .map(|n| n.as_ref())
            .ok_or_else(|| {
                StepgraphError::Config(format!(
                    "Node '{}' not found in graph '{}'",
                    node_type, self.graph_name
                ))
            })
    }

    /// Append a step. A store failure aborts the run.
    async fn record(&self, step: NewStep) -> Result<()> {
        if let Err(e) = self.store.append_step(&step).await {
            error!(
                run_id = %step.run_id,
                node_type = %step.node_type,
                error = %e,
                "Failed to record step, aborting run"
            );
            return Err(e);
        }
        self.publish(RunEvent::StepRecorded {
            run_id: step.run_id,
            node_type: step.node_type,
            routed: step.routed,
            success: step.success,
        });
        Ok(())
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
