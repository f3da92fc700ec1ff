//! GraphBuilder implementation for constructing state graphs.
//!
//! This module contains the main GraphBuilder type and its fluent API
//! for declaring nodes, channels, edges, and reliability configuration
//! before compiling to an executable [`Plan`](crate::plan::Plan).

use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::edges::{ConditionalEdge, Router};
use crate::node::Node;
use crate::reducers::{Reducer, ReducerRegistry, ERRORS_CHANNEL};
use crate::reliability::RetryPolicy;
use crate::runtimes::RuntimeConfig;
use crate::types::NodeId;

/// Builder for constructing state graphs with a fluent API.
///
/// `GraphBuilder` accumulates nodes, channel declarations, edges, and
/// reliability configuration, then [`compile`](Self::compile)s them into an
/// executable [`Plan`](crate::plan::Plan). Compilation is where structural
/// validation happens; the builder itself accepts anything and records what
/// it saw.
///
/// # Required Configuration
///
/// Every graph must have:
/// - At least one edge leaving `NodeId::Start` to define the entry point
/// - A channel declaration (key + reducer) for every channel its nodes write
///
/// `NodeId::Start` and `NodeId::End` are virtual endpoints and are never
/// registered with `add_node`. They exist only for structural definition;
/// the scheduler skips them automatically.
///
/// # Examples
///
/// ## Linear graph
/// ```
/// use stategraph::graphs::GraphBuilder;
/// use stategraph::reducers::Overwrite;
/// use std::sync::Arc;
///
/// # struct MyNode;
/// # #[async_trait::async_trait]
/// # impl stategraph::node::Node for MyNode {
/// #     async fn run(&self, _: stategraph::state::Snapshot, _: stategraph::node::NodeContext) -> Result<stategraph::node::PartialUpdate, stategraph::node::NodeError> {
/// #         Ok(stategraph::node::PartialUpdate::default())
/// #     }
/// # }
///
/// let plan = GraphBuilder::new()
///     .add_node("worker", MyNode)
///     .add_channel("result", Arc::new(Overwrite))
///     .set_entry("worker")
///     .add_edge("worker", "End")
///     .compile();
/// ```
///
/// ## Fan-out with a shared append channel
/// ```
/// use stategraph::graphs::GraphBuilder;
/// use stategraph::reducers::Append;
/// use std::sync::Arc;
///
/// # struct MyNode;
/// # #[async_trait::async_trait]
/// # impl stategraph::node::Node for MyNode {
/// #     async fn run(&self, _: stategraph::state::Snapshot, _: stategraph::node::NodeContext) -> Result<stategraph::node::PartialUpdate, stategraph::node::NodeError> {
/// #         Ok(stategraph::node::PartialUpdate::default())
/// #     }
/// # }
///
/// let plan = GraphBuilder::new()
///     .add_node("worker_a", MyNode)
///     .add_node("worker_b", MyNode)
///     .add_channel("findings", Arc::new(Append))
///     .set_entry("worker_a")
///     .add_edge("Start", "worker_b")
///     .add_edge("worker_a", "End")
///     .add_edge("worker_b", "End")
///     .compile();
/// ```
pub struct GraphBuilder {
    /// Registry of all nodes in the graph, keyed by their identifier.
    pub nodes: FxHashMap<NodeId, Arc<dyn Node>>,
    /// Unconditional edges defining static graph topology.
    pub edges: FxHashMap<NodeId, Vec<NodeId>>,
    /// Conditional edges for dynamic routing based on state.
    pub conditional_edges: Vec<ConditionalEdge>,
    /// Error-handling edges: failed node to its handler node.
    pub error_edges: FxHashMap<NodeId, NodeId>,
    /// Channel-to-reducer bindings consulted by the barrier.
    pub reducers: ReducerRegistry,
    /// Per-node retry policies overriding the graph default.
    pub retry_policies: FxHashMap<NodeId, RetryPolicy>,
    /// Retry policy for nodes without a per-node override.
    pub default_retry_policy: RetryPolicy,
    /// Runtime configuration for the compiled plan.
    pub runtime_config: RuntimeConfig,
    pub(super) duplicate_nodes: Vec<NodeId>,
    pub(super) reserved_rebind: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Creates a new, empty graph builder.
    ///
    /// The builder starts with no nodes or edges and the reserved `errors`
    /// channel already bound to the append reducer. Use the fluent API
    /// methods to add components before calling [`compile`](Self::compile).
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            edges: FxHashMap::default(),
            conditional_edges: Vec::new(),
            error_edges: FxHashMap::default(),
            reducers: ReducerRegistry::default(),
            retry_policies: FxHashMap::default(),
            default_retry_policy: RetryPolicy::default(),
            runtime_config: RuntimeConfig::default(),
            duplicate_nodes: Vec::new(),
            reserved_rebind: false,
        }
    }

    /// Adds a node to the graph.
    ///
    /// NOTE: `NodeId::Start` and `NodeId::End` are virtual structural
    /// endpoints. If either is passed to `add_node`, the registration is
    /// ignored and a warning is emitted. They are never executed; the
    /// scheduler skips them while still allowing edges from `Start` and to
    /// `End` for topology.
    ///
    /// Registering the same name twice is recorded and rejected at
    /// [`compile`](Self::compile) time.
    #[must_use]
    pub fn add_node(mut self, id: impl Into<NodeId>, node: impl Node + 'static) -> Self {
        let id = id.into();
        match id {
            NodeId::Start | NodeId::End => {
                tracing::warn!(
                    ?id,
                    "ignoring registration of virtual node (Start/End are virtual)"
                );
            }
            NodeId::Named(_) => {
                if self.nodes.insert(id.clone(), Arc::new(node)).is_some() {
                    self.duplicate_nodes.push(id);
                }
            }
        }
        self
    }

    /// Declares a channel and binds it to a reducer.
    ///
    /// Every channel a node writes must be declared exactly once; writes to
    /// undeclared channels fail the superstep at the barrier. Re-declaring a
    /// key replaces the previous binding with a warning. The reserved
    /// `errors` channel may not be re-bound; attempts are rejected at
    /// [`compile`](Self::compile) time.
    #[must_use]
    pub fn add_channel(mut self, key: impl Into<String>, reducer: Arc<dyn Reducer>) -> Self {
        let key = key.into();
        if key == ERRORS_CHANNEL {
            tracing::warn!(channel = %key, "attempted to re-bind the reserved errors channel");
            self.reserved_rebind = true;
            return self;
        }
        if self.reducers.contains(&key) {
            tracing::warn!(channel = %key, "re-binding channel reducer");
        }
        self.reducers.register(key, reducer);
        self
    }

    /// Adds an unconditional edge between two nodes.
    ///
    /// When the `from` node completes a superstep, the runner activates the
    /// `to` node in the next one. Multiple edges from the same node create
    /// fan-out; multiple edges to the same node create fan-in.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Declares the entry point: shorthand for an edge from `Start`.
    #[must_use]
    pub fn set_entry(self, to: impl Into<NodeId>) -> Self {
        self.add_edge(NodeId::Start, to)
    }

    /// Adds a conditional edge with an allow-list of permitted targets.
    ///
    /// When execution completes the `from` node, the `router` is evaluated
    /// against the post-merge snapshot and returns a [`Route`] naming the
    /// next node(s). Every name the router can return must be in `allow`;
    /// out-of-list decisions fail the run. The allow-list is validated
    /// against the node set at compile time.
    ///
    /// [`Route`]: super::Route
    ///
    /// # Examples
    ///
    /// ```
    /// use stategraph::graphs::{GraphBuilder, Route, Router};
    /// use stategraph::reducers::Overwrite;
    /// use std::sync::Arc;
    ///
    /// # struct MyNode;
    /// # #[async_trait::async_trait]
    /// # impl stategraph::node::Node for MyNode {
    /// #     async fn run(&self, _: stategraph::state::Snapshot, _: stategraph::node::NodeContext) -> Result<stategraph::node::PartialUpdate, stategraph::node::NodeError> {
    /// #         Ok(stategraph::node::PartialUpdate::default())
    /// #     }
    /// # }
    ///
    /// let router: Router = Arc::new(|snapshot| {
    ///     match snapshot.get_str("kind") {
    ///         Some("bug") => Route::Single("fix".into()),
    ///         _ => Route::end(),
    ///     }
    /// });
    ///
    /// let builder = GraphBuilder::new()
    ///     .add_node("triage", MyNode)
    ///     .add_node("fix", MyNode)
    ///     .add_channel("kind", Arc::new(Overwrite))
    ///     .set_entry("triage")
    ///     .add_conditional_edge("triage", router, ["fix", "End"]);
    /// ```
    #[must_use]
    pub fn add_conditional_edge<I, T>(mut self, from: impl Into<NodeId>, router: Router, allow: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        let allow = allow.into_iter().map(Into::into).collect();
        self.conditional_edges
            .push(ConditionalEdge::new(from.into(), router, allow));
        self
    }

    /// Adds an error-handling edge from a node to a handler node.
    ///
    /// When the `from` node exhausts its retry budget, the run does not
    /// abort: a structured error record is appended to the reserved `errors`
    /// channel and the `handler` is activated next superstep instead of the
    /// node's ordinary successors.
    #[must_use]
    pub fn add_error_edge(mut self, from: impl Into<NodeId>, handler: impl Into<NodeId>) -> Self {
        self.error_edges.insert(from.into(), handler.into());
        self
    }

    /// Overrides the retry policy for a single node.
    #[must_use]
    pub fn with_retry_policy(mut self, node: impl Into<NodeId>, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(node.into(), policy);
        self
    }

    /// Sets the retry policy applied to nodes without a per-node override.
    #[must_use]
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// Configures runtime settings for the compiled plan.
    ///
    /// Runtime configuration controls execution behavior such as the fan-out
    /// concurrency limit, checkpointing, and thread identity. If not
    /// specified, default configuration is used.
    ///
    /// # Examples
    ///
    /// ```
    /// use stategraph::graphs::GraphBuilder;
    /// use stategraph::runtimes::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::new(
    ///     Some("my_thread".into()),
    ///     None, // Default checkpointer
    ///     None, // Default database
    /// );
    ///
    /// let builder = GraphBuilder::new()
    ///     .with_runtime_config(config);
    /// ```
    #[must_use]
    pub fn with_runtime_config(mut self, runtime_config: RuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }
}
