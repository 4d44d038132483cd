use std::future::Future;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::types::Route;

/// A unit of work in a graph.
///
/// `exec` may suspend on external I/O and may fail; failures are retried by
/// the executor. `route` inspects the output and names the next node, or
/// ends the run. Nodes are shared by every run of their graph and are never
/// mutated by the executor.
pub trait Node: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Identity of this node, unique within its graph.
    fn node_type(&self) -> &str;

    fn exec(&self, input: Self::Input) -> BoxFuture<'_, Result<Self::Output>>;

    fn route(&self, output: &Self::Output) -> Route;
}

/// Output of one type-erased invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: Value,
    pub route: Route,
}

/// Object-safe view of a [`Node`] over JSON values.
///
/// The executor stores nodes behind this trait. Input is decoded into the
/// node's own type on every call and the output is encoded into a fresh
/// value, so consecutive nodes never share mutable state.
pub trait ErasedNode: Send + Sync + 'static {
    fn node_id(&self) -> &str;

    fn invoke(&self, input: Value) -> BoxFuture<'_, Result<Invocation>>;
}

impl<N: Node> ErasedNode for N {
    fn node_id(&self) -> &str {
        Node::node_type(self)
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, Result<Invocation>> {
        Box::pin(async move {
            let typed: N::Input = serde_json::from_value(input).map_err(|e| {
                StepgraphError::node(Node::node_type(self), format!("invalid input: {}", e))
            })?;
            let output = self.exec(typed).await?;
            let route = self.route(&output);
            let output = serde_json::to_value(&output).map_err(|e| {
                StepgraphError::Serialization(format!(
                    "output of {}: {}",
                    Node::node_type(self),
                    e
                ))
            })?;
            Ok(Invocation { output, route })
        })
    }
}

pub type BoxedNode = Box<dyn ErasedNode>;

/// Erase a node for registration with a [`GraphExecutor`](super::GraphExecutor).
pub fn boxed<N: Node>(node: N) -> BoxedNode {
    Box::new(node)
}

/// A node built from two closures.
///
/// ```ignore
/// let shout = FnNode::new(
///     "shout",
///     |s: String| async move { Ok(s.to_uppercase()) },
///     |_| Route::End,
/// );
/// ```
pub struct FnNode<I, O, E, R> {
    node_type: String,
    exec: E,
    route: R,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, E, R, Fut> FnNode<I, O, E, R>
where
    E: Fn(I) -> Fut,
    Fut: Future<Output = Result<O>>,
    R: Fn(&O) -> Route,
{
    pub fn new(node_type: impl Into<String>, exec: E, route: R) -> Self {
        Self {
            node_type: node_type.into(),
            exec,
            route,
            _marker: PhantomData,
        }
    }
}

impl<I, O, E, R, Fut> Node for FnNode<I, O, E, R>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    E: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
    R: Fn(&O) -> Route + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn exec(&self, input: I) -> BoxFuture<'_, Result<O>> {
        Box::pin((self.exec)(input))
    }

    fn route(&self, output: &O) -> Route {
        (self.route)(output)
    }
}
