pub mod graph;
pub mod retry;
pub mod run_log;

pub use graph::{boxed, BoxedNode, ErasedNode, FnNode, GraphExecutor, Invocation, Node, RunReport};
pub use retry::RetryPolicy;
pub use run_log::RunLogger;
