use rustc_hash::FxHashMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::event_bus::{ChannelSink, Event, EventBus, EventSink, EventStream};
use crate::graphs::{ConditionalEdge, GraphBuilder};
use crate::node::{Node, PartialUpdate};
use crate::reducers::{ChannelError, ReducerRegistry};
use crate::reliability::RetryPolicy;
use crate::runtimes::runner::RunnerError;
use crate::runtimes::{CheckpointerKind, Runner, RuntimeConfig, ThreadInit};
use crate::state::{ChannelStore, Snapshot};
use crate::types::NodeId;
use crate::utils::id_generator::IdGenerator;

/// An immutable, validated graph ready to execute.
///
/// A `Plan` is what [`GraphBuilder::compile`] produces: the node registry,
/// every kind of edge, the channel reducer bindings, and the reliability
/// policies, all structurally checked. Plans are cheap to clone and safe to
/// share; all per-run state lives in the [`Runner`].
///
/// # Examples
///
/// ```rust,no_run
/// use stategraph::graphs::GraphBuilder;
/// use stategraph::state::ChannelStore;
/// use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
/// use async_trait::async_trait;
///
/// # struct Greet;
/// # #[async_trait]
/// # impl Node for Greet {
/// #     async fn run(&self, _: stategraph::state::Snapshot, _: NodeContext) -> Result<PartialUpdate, NodeError> {
/// #         Ok(PartialUpdate::default())
/// #     }
/// # }
/// #
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let plan = GraphBuilder::new()
///     .add_node("greet", Greet)
///     .set_entry("greet")
///     .add_edge("greet", "End")
///     .compile()?;
///
/// let initial = ChannelStore::builder()
///     .with("input", serde_json::json!("Hello"))
///     .build();
/// let final_snapshot = plan.invoke(initial).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Plan {
    nodes: FxHashMap<NodeId, Arc<dyn Node>>,
    edges: FxHashMap<NodeId, Vec<NodeId>>,
    conditional_edges: Vec<ConditionalEdge>,
    error_edges: FxHashMap<NodeId, NodeId>,
    reducers: ReducerRegistry,
    retry_policies: FxHashMap<NodeId, RetryPolicy>,
    default_retry_policy: RetryPolicy,
    runtime_config: RuntimeConfig,
}

/// Combined handle exposing the configured event bus and a single subscription.
///
/// Obtained from [`Plan::event_stream()`], it lets callers attach additional
/// sinks before execution starts or choose how to consume the broadcast feed
/// (async stream, blocking iterator, or timed polling).
pub struct PlanEventStream {
    event_bus: EventBus,
    event_stream: Option<EventStream>,
}

/// Errors returned when accessing a [`PlanEventStream`] after its
/// subscription has already been consumed.
#[derive(Debug, Error)]
pub enum PlanEventStreamError {
    #[error("event stream has already been taken")]
    AlreadyTaken,
}

type PlanEventStreamResult<T> = Result<T, PlanEventStreamError>;

/// Handle for a streaming invocation.
///
/// Dropping the handle aborts the execution task. Use
/// [`join`](InvocationHandle::join) to await graceful completion; the paired
/// event stream will emit a diagnostic with scope
/// [`STREAM_END_SCOPE`](crate::event_bus::STREAM_END_SCOPE) before going
/// quiet.
pub struct InvocationHandle {
    join_handle: Option<JoinHandle<Result<Snapshot, RunnerError>>>,
}

impl PlanEventStream {
    fn new(event_bus: EventBus, event_stream: EventStream) -> Self {
        Self {
            event_bus,
            event_stream: Some(event_stream),
        }
    }

    /// Access the bus to add sinks before execution begins.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Mutable access to the underlying broadcast subscription.
    ///
    /// Returns an error if the stream was already consumed by another
    /// accessor.
    pub fn event_stream(&mut self) -> PlanEventStreamResult<&mut EventStream> {
        self.event_stream
            .as_mut()
            .ok_or(PlanEventStreamError::AlreadyTaken)
    }

    /// Consume the handle and return the raw event stream.
    ///
    /// Subsequent calls will error with [`PlanEventStreamError::AlreadyTaken`].
    pub fn into_stream(mut self) -> PlanEventStreamResult<EventStream> {
        self.event_stream
            .take()
            .ok_or(PlanEventStreamError::AlreadyTaken)
    }

    /// Consume the handle and return the event bus.
    pub fn into_event_bus(self) -> EventBus {
        self.event_bus
    }

    /// Split the handle into the bus and event stream.
    pub fn split(mut self) -> PlanEventStreamResult<(EventBus, EventStream)> {
        let stream = self
            .event_stream
            .take()
            .ok_or(PlanEventStreamError::AlreadyTaken)?;
        Ok((self.event_bus, stream))
    }

    /// Consume and convert the stream into a blocking iterator.
    pub fn into_blocking_iter(self) -> PlanEventStreamResult<crate::event_bus::BlockingEventIter> {
        Ok(self.into_stream()?.into_blocking_iter())
    }

    /// Consume and convert the stream into an async stream.
    pub fn into_async_stream(self) -> PlanEventStreamResult<BoxStream<'static, Event>> {
        Ok(self.into_stream()?.into_async_stream())
    }

    /// Await the next event with a timeout, skipping lag notifications.
    pub async fn next_timeout(
        &mut self,
        duration: std::time::Duration,
    ) -> PlanEventStreamResult<Option<Event>> {
        Ok(self.event_stream()?.next_timeout(duration).await)
    }
}

impl InvocationHandle {
    /// Abort the underlying execution task. `join` returns a join error
    /// afterwards. Equivalent to dropping the handle explicitly.
    pub fn abort(&self) {
        if let Some(handle) = &self.join_handle {
            handle.abort();
        }
    }

    /// Returns true if the underlying execution task has completed or aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Await the invocation result.
    pub async fn join(mut self) -> Result<Snapshot, RunnerError> {
        let handle = self
            .join_handle
            .take()
            .expect("join_handle already awaited");
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(RunnerError::Join(err)),
        }
    }
}

impl Plan {
    /// Internal factory so the graph internals stay private past compile.
    pub(crate) fn from_builder(builder: GraphBuilder) -> Self {
        Plan {
            nodes: builder.nodes,
            edges: builder.edges,
            conditional_edges: builder.conditional_edges,
            error_edges: builder.error_edges,
            reducers: builder.reducers,
            retry_policies: builder.retry_policies,
            default_retry_policy: builder.default_retry_policy,
            runtime_config: builder.runtime_config,
        }
    }

    /// Registry of node implementations, keyed by identifier.
    #[must_use]
    pub fn nodes(&self) -> &FxHashMap<NodeId, Arc<dyn Node>> {
        &self.nodes
    }

    /// Static topology: source node to its unconditional successors.
    #[must_use]
    pub fn edges(&self) -> &FxHashMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    /// State-dependent routing declarations, in registration order.
    #[must_use]
    pub fn conditional_edges(&self) -> &[ConditionalEdge] {
        &self.conditional_edges
    }

    /// Failure routing: failed node to the handler that replaces it.
    #[must_use]
    pub fn error_edges(&self) -> &FxHashMap<NodeId, NodeId> {
        &self.error_edges
    }

    /// Channel-to-reducer bindings consulted at every barrier.
    #[must_use]
    pub fn reducers(&self) -> &ReducerRegistry {
        &self.reducers
    }

    /// Per-node retry policies overriding the graph default.
    #[must_use]
    pub fn retry_policies(&self) -> &FxHashMap<NodeId, RetryPolicy> {
        &self.retry_policies
    }

    /// Retry policy applied to nodes without a per-node override.
    #[must_use]
    pub fn default_retry_policy(&self) -> &RetryPolicy {
        &self.default_retry_policy
    }

    /// Effective retry policy for one node.
    #[must_use]
    pub fn policy_for(&self, node: &NodeId) -> &RetryPolicy {
        self.retry_policies
            .get(node)
            .unwrap_or(&self.default_retry_policy)
    }

    /// Runtime configuration the plan was compiled with.
    #[must_use]
    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    /// Merges one superstep's outputs into the store through the reducers.
    ///
    /// All-or-nothing: on error the store is left untouched. Returns the
    /// keys whose version advanced, sorted.
    pub fn apply_barrier(
        &self,
        store: &mut ChannelStore,
        outputs: &[(NodeId, PartialUpdate)],
    ) -> Result<Vec<String>, ChannelError> {
        self.reducers.apply_step(store, outputs)
    }

    /// Create a subscription to the configured event bus without starting
    /// execution.
    ///
    /// This is the low-level entry point when you want to inspect the stream
    /// or register additional sinks before running, e.g. in tests or custom
    /// server integrations.
    #[must_use]
    pub fn event_stream(&self) -> PlanEventStream {
        let event_bus = self.runtime_config.event_bus.build_event_bus();
        let event_stream = event_bus.subscribe();
        PlanEventStream::new(event_bus, event_stream)
    }

    fn resolve_checkpointer(&self, override_kind: Option<CheckpointerKind>) -> CheckpointerKind {
        override_kind
            .or_else(|| self.runtime_config.checkpointer.clone())
            .unwrap_or(CheckpointerKind::InMemory)
    }

    /// Centralises runner setup for the public `invoke*` helpers.
    ///
    /// `R` is whatever auxiliary handle the caller wants back alongside the
    /// run result, e.g. a `flume::Receiver<Event>` when wiring a channel.
    /// The `FnOnce` builder is invoked exactly once so it can move channels
    /// or sink vectors into the bus.
    async fn invoke_with_bus_builder<R, F>(
        &self,
        initial: ChannelStore,
        autosave: bool,
        checkpointer_override: Option<CheckpointerKind>,
        build_event_bus: F,
    ) -> (Result<Snapshot, RunnerError>, R)
    where
        F: FnOnce() -> (EventBus, R),
    {
        let (event_bus, output) = build_event_bus();
        let checkpointer = self.resolve_checkpointer(checkpointer_override);

        let runner = Runner::with_options_and_bus(
            self.clone(),
            Some(checkpointer),
            autosave,
            event_bus,
            true,
        )
        .await;

        let thread_id = self.next_thread_id();
        let result = Self::run_thread(runner, thread_id, initial).await;

        (result, output)
    }

    /// Execute the plan to completion and return the final snapshot.
    ///
    /// The simple entry point: one fresh runner, the runtime-configured
    /// event bus and checkpointer, autosave on. For event consumption see
    /// [`invoke_streaming`](Self::invoke_streaming),
    /// [`invoke_with_channel`](Self::invoke_with_channel), and
    /// [`invoke_with_sinks`](Self::invoke_with_sinks); drop down to
    /// [`Runner`] for multi-thread or interrupt-driven control.
    #[instrument(skip(self, initial), err)]
    pub async fn invoke(&self, initial: ChannelStore) -> Result<Snapshot, RunnerError> {
        self.invoke_with_bus_builder(
            initial,
            true,
            self.runtime_config.checkpointer.clone(),
            || (self.runtime_config.event_bus.build_event_bus(), ()),
        )
        .await
        .0
    }

    /// Invoke asynchronously while streaming events to the caller.
    ///
    /// Returns a join handle for the outcome and an [`EventStream`] that
    /// yields every event emitted during execution. The stream signals
    /// completion with a diagnostic event carrying scope
    /// [`STREAM_END_SCOPE`](crate::event_bus::STREAM_END_SCOPE). Sinks
    /// configured on the runtime event bus continue to receive events.
    ///
    /// # Cancellation
    ///
    /// Dropping the [`InvocationHandle`] (or calling
    /// [`InvocationHandle::abort`]) stops execution immediately. Dropping
    /// the event stream does **not** cancel the run; use the handle when a
    /// disconnecting client should interrupt execution.
    pub async fn invoke_streaming(&self, initial: ChannelStore) -> (InvocationHandle, EventStream) {
        let checkpointer = self.resolve_checkpointer(None);

        let event_handle = self.event_stream();
        let (event_bus, event_stream) = event_handle
            .split()
            .expect("fresh Plan::event_stream() should yield an unused event stream");

        let runner = Runner::with_options_and_bus(
            self.clone(),
            Some(checkpointer),
            true,
            event_bus,
            true,
        )
        .await;

        let thread_id = self.next_thread_id();
        let join = tokio::spawn(Self::run_thread(runner, thread_id, initial));

        (
            InvocationHandle {
                join_handle: Some(join),
            },
            event_stream,
        )
    }

    /// Execute with events mirrored to a dedicated channel.
    ///
    /// Appends a [`ChannelSink`] to the runtime-configured bus and returns
    /// the receiver next to the run result, so callers can drain events in
    /// parallel with execution without managing the bus themselves.
    #[instrument(skip(self, initial))]
    pub async fn invoke_with_channel(
        &self,
        initial: ChannelStore,
    ) -> (Result<Snapshot, RunnerError>, flume::Receiver<Event>) {
        self.invoke_with_bus_builder(
            initial,
            false,
            self.runtime_config.checkpointer.clone(),
            || {
                let (tx, rx) = flume::unbounded();
                let event_bus = self.runtime_config.event_bus.build_event_bus();
                event_bus.add_sink(ChannelSink::new(tx));
                (event_bus, rx)
            },
        )
        .await
    }

    /// Execute with additional [`EventSink`]s layered over the configured
    /// ones.
    ///
    /// Sinks from the `RuntimeConfig` stay active; the provided collection
    /// is appended, so extra destinations do not require rebuilding the
    /// plan.
    #[instrument(skip(self, initial, sinks), err)]
    pub async fn invoke_with_sinks(
        &self,
        initial: ChannelStore,
        sinks: Vec<Box<dyn EventSink>>,
    ) -> Result<Snapshot, RunnerError> {
        self.invoke_with_bus_builder(
            initial,
            false,
            self.runtime_config.checkpointer.clone(),
            move || {
                let event_bus = self.runtime_config.event_bus.build_event_bus();
                for sink in sinks {
                    event_bus.add_boxed_sink(sink);
                }
                (event_bus, ())
            },
        )
        .await
        .0
    }

    /// Thread identifier for the next invocation.
    ///
    /// Prefers an explicit id from the runtime configuration and falls back
    /// to a generated one so separate invocations never collide on the same
    /// stored timeline by accident.
    fn next_thread_id(&self) -> String {
        self.runtime_config
            .thread_id
            .clone()
            .unwrap_or_else(|| IdGenerator::new().generate_thread_id())
    }

    /// Drive one thread to completion, resuming from checkpoints when
    /// available.
    async fn run_thread(
        mut runner: Runner,
        thread_id: String,
        initial: ChannelStore,
    ) -> Result<Snapshot, RunnerError> {
        let init = runner.create_thread(thread_id.clone(), initial).await?;

        if let ThreadInit::Resumed { checkpoint_step } = init {
            tracing::info!(
                thread = %thread_id,
                checkpoint_step,
                "resuming thread from checkpoint"
            );
        }

        let result = runner.run_until_complete(&thread_id).await;
        // Deliver everything, including the stream terminator, before the
        // bus is dropped with the runner.
        runner.drain_event_bus().await;
        result
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("conditional_edges", &self.conditional_edges.len())
            .field("error_edges", &self.error_edges.len())
            .finish_non_exhaustive()
    }
}
