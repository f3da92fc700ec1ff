//! Running a compiled [`Plan`] as a node inside another graph.
//!
//! [`SubgraphNode`] wraps a child plan and implements [`Node`], so a parent
//! graph schedules it like any other step. Each invocation seeds a nested
//! run from a projection of the parent snapshot, drives it to completion,
//! and returns the child's final channels as the node's partial update.
//!
//! Nested runs persist under a thread id derived from the parent thread,
//! the node name, and the superstep. When a parent superstep is retried,
//! the nested run resumes from its own last checkpoint instead of starting
//! over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::event_bus::EventBus;
use crate::node::{Node, NodeContext, NodeError, PartialUpdate};
use crate::plan::Plan;
use crate::runtimes::checkpointer::{Checkpointer, InMemoryCheckpointer};
use crate::runtimes::runner::{Runner, ThreadInit};
use crate::state::{ChannelStore, Snapshot};

/// Adapter exposing a compiled [`Plan`] as an invocable [`Node`].
///
/// # Examples
///
/// ```rust,no_run
/// use stategraph::graphs::GraphBuilder;
/// use stategraph::subgraph::SubgraphNode;
/// # async fn example(child: stategraph::plan::Plan) -> Result<(), Box<dyn std::error::Error>> {
/// let nested = SubgraphNode::new(child)
///     .with_input_channels(["question"])
///     .with_output_channels(["answer"]);
///
/// let parent = GraphBuilder::new()
///     .add_node("research", nested)
///     .set_entry("research")
///     .add_edge("research", "End")
///     .compile()?;
/// # let _ = parent;
/// # Ok(())
/// # }
/// ```
pub struct SubgraphNode {
    plan: Arc<Plan>,
    input_channels: Option<Vec<String>>,
    output_channels: Option<Vec<String>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    invocations: AtomicU64,
}

impl SubgraphNode {
    /// Wraps a compiled plan for use as a node.
    ///
    /// By default the full parent snapshot seeds the child, every child
    /// channel flows back out, and nested checkpoints live in an in-memory
    /// store private to this adapter instance.
    #[must_use]
    pub fn new(plan: Plan) -> Self {
        Self {
            plan: Arc::new(plan),
            input_channels: None,
            output_channels: None,
            checkpointer: Some(Arc::new(InMemoryCheckpointer::new())),
            invocations: AtomicU64::new(0),
        }
    }

    /// Restricts which parent channels seed the child run.
    #[must_use]
    pub fn with_input_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts which child channels are written back to the parent.
    #[must_use]
    pub fn with_output_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Stores nested checkpoints in a caller-supplied backend.
    ///
    /// Sharing the parent run's checkpointer here puts nested timelines in
    /// the same durable store, so resumption after a process restart can
    /// descend into a suspended child run.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Child thread identity for one parent invocation.
    ///
    /// Derived from parent thread, node name, and superstep rather than a
    /// call counter, so a retried parent superstep maps to the same nested
    /// thread and resumes it.
    fn child_thread_id(ctx: &NodeContext) -> String {
        format!("{}::{}#{}", ctx.thread_id, ctx.node, ctx.step)
    }

    fn project_input(&self, snapshot: &Snapshot) -> ChannelStore {
        let mut builder = ChannelStore::builder();
        match &self.input_channels {
            Some(keys) => {
                for key in keys {
                    if let Some(value) = snapshot.get(key) {
                        builder = builder.with(key.clone(), value.clone());
                    }
                }
            }
            None => {
                let mut keys: Vec<&str> = snapshot.keys().collect();
                keys.sort_unstable();
                for key in keys {
                    if let Some(value) = snapshot.get(key) {
                        builder = builder.with(key, value.clone());
                    }
                }
            }
        }
        builder.build()
    }

    fn project_output(&self, snapshot: &Snapshot) -> PartialUpdate {
        let mut update = PartialUpdate::new();
        match &self.output_channels {
            Some(keys) => {
                for key in keys {
                    if let Some(value) = snapshot.get(key) {
                        update.insert(key.clone(), value.clone());
                    }
                }
            }
            None => {
                let mut keys: Vec<&str> = snapshot.keys().collect();
                keys.sort_unstable();
                for key in keys {
                    if let Some(value) = snapshot.get(key) {
                        update.insert(key, value.clone());
                    }
                }
            }
        }
        update
    }
}

#[async_trait]
impl Node for SubgraphNode {
    async fn run(&self, snapshot: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let invocation = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        let child_thread = Self::child_thread_id(&ctx);
        let _ = ctx.emit(
            "subgraph",
            format!("starting nested run {child_thread} (invocation {invocation})"),
        );

        let initial = self.project_input(&snapshot);

        // The child gets its own quiet bus; parent-visible progress goes
        // through ctx.emit.
        let mut runner = Runner::with_checkpointer(
            Arc::clone(&self.plan),
            self.checkpointer.clone(),
            true,
            EventBus::default(),
            true,
        );

        let init = runner
            .create_thread(child_thread.clone(), initial)
            .await
            .map_err(|e| NodeError::Subgraph(e.to_string()))?;
        if let ThreadInit::Resumed { checkpoint_step } = init {
            let _ = ctx.emit(
                "subgraph",
                format!("descending into suspended run {child_thread} at step {checkpoint_step}"),
            );
        }

        let final_snapshot = runner
            .run_until_complete(&child_thread)
            .await
            .map_err(|e| NodeError::Subgraph(e.to_string()))?;

        let _ = ctx.emit("subgraph", format!("nested run {child_thread} completed"));
        Ok(self.project_output(&final_snapshot))
    }
}
