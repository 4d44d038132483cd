//! Graph execution engine.
//!
//! A graph is a set of `Node`s keyed by identity plus a start identity. There
//! are no static edges: each node's `route` looks at its own output and names
//! the next node, or ends the run. Cycles are allowed; the executor's step
//! cap is the only guard against routing that never terminates.
//!
//! The `GraphExecutor` runs one node at a time, wraps each invocation in the
//! `RetryPolicy`, and appends every outcome to the `RunStore` before moving on.

pub mod executor;
pub mod node;

pub use executor::{GraphExecutor, RunReport};
pub use node::{boxed, BoxedNode, ErasedNode, FnNode, Invocation, Node};
