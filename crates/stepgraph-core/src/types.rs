use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `routed` value of the step that ends a run normally.
pub const END_SENTINEL: &str = "END";

/// `routed` value of the extra step written when a run hits its step cap.
pub const CAP_SENTINEL: &str = "MAX_STEPS";

/// Store-assigned identifier of a graph row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(pub i64);

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fresh identifier for a single traversal of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing decision produced from a node's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "node", rename_all = "snake_case")]
pub enum Route {
    /// Continue with the node registered under this identity.
    Next(String),
    /// Terminate the run with the current output.
    End,
}

impl Route {
    pub fn to(node_type: impl Into<String>) -> Self {
        Self::Next(node_type.into())
    }

    /// The value persisted in a step's `routed` column.
    pub fn as_routed(&self) -> &str {
        match self {
            Route::Next(id) => id,
            Route::End => END_SENTINEL,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Route::End)
    }
}

impl From<Option<String>> for Route {
    fn from(next: Option<String>) -> Self {
        match next {
            Some(id) => Route::Next(id),
            None => Route::End,
        }
    }
}

/// A step as handed to the store by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub node_type: String,
    /// Serialized node input (JSON).
    pub input: String,
    /// Serialized node output, or an error payload (JSON).
    pub output: String,
    /// Next node identity, `END`, or `MAX_STEPS`.
    pub routed: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// A persisted step, as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Monotonic sequence number assigned by the store.
    pub id: i64,
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub node_type: String,
    pub input: String,
    pub output: String,
    pub routed: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn is_terminal(&self) -> bool {
        self.success && self.routed == END_SENTINEL
    }

    pub fn is_cap_marker(&self) -> bool {
        !self.success && self.routed == CAP_SENTINEL
    }

    pub fn input_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.input)
    }

    pub fn output_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub id: GraphId,
    pub graph_name: String,
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    CapReached,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Derive the state of a run from its most recent step.
    pub fn from_last_step(success: bool, routed: &str) -> Self {
        match (success, routed) {
            (true, END_SENTINEL) => Self::Completed,
            (true, _) => Self::Running,
            (false, CAP_SENTINEL) => Self::CapReached,
            (false, _) => Self::Failed,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::CapReached => write!(f, "cap_reached"),
        }
    }
}

/// One row per run in history listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub graph_name: String,
    pub steps: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
}

/// Events emitted by the executor while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        graph_name: String,
    },
    StepRecorded {
        run_id: RunId,
        node_type: String,
        routed: String,
        success: bool,
    },
    RetryScheduled {
        run_id: RunId,
        node_type: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    RunCompleted {
        run_id: RunId,
        steps: usize,
    },
    RunFailed {
        run_id: RunId,
        node_type: String,
        error: String,
    },
    CapReached {
        run_id: RunId,
        max_steps: usize,
    },
}

impl RunEvent {
    /// Whether this event closes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } | RunEvent::CapReached { .. }
        )
    }
}
