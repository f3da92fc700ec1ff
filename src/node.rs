//! Node execution contract for the stategraph runtime.
//!
//! This module provides the core abstractions for executable graph nodes:
//! the [`Node`] trait, the execution context handed to each invocation, the
//! [`PartialUpdate`] contribution type, and node-level error handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::event_bus::Event;
use crate::reducers::ERRORS_CHANNEL;
use crate::state::Snapshot;

/// Core trait for executable graph nodes.
///
/// A node is invoked once per superstep it appears in the frontier. It
/// receives the pre-superstep [`Snapshot`] (identical for every node of the
/// round) and returns a [`PartialUpdate`]: new contributions for the channels
/// it intends to change. Nodes never mutate the snapshot they were given;
/// merging is the engine's job.
///
/// # Design Principles
///
/// - **Pure over state**: read the snapshot, contribute an update
/// - **Idempotent-safe**: the reliability wrapper may re-invoke a node
///   against the same snapshot after a retryable failure
/// - **Observable**: use the context to emit events for monitoring
///
/// # Errors
///
/// Returning `Err(NodeError)` hands the failure to the node's retry policy.
/// Recoverable conditions worth recording without failing belong in the
/// reserved `errors` channel via [`PartialUpdate::with_error`].
///
/// # Examples
///
/// ```rust,no_run
/// use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
/// use stategraph::state::Snapshot;
/// use async_trait::async_trait;
/// use serde_json::json;
///
/// struct Greeter;
///
/// #[async_trait]
/// impl Node for Greeter {
///     async fn run(&self, snapshot: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
///         ctx.emit("greet", "composing greeting")?;
///         let who = snapshot.get_str("who").ok_or(NodeError::MissingInput { what: "who" })?;
///         Ok(PartialUpdate::new().set("message", json!(format!("Hello, {who}!"))))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute this node against the given snapshot and context.
    async fn run(&self, snapshot: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError>;
}

/// Execution context passed to nodes.
///
/// Carries the node's identity, the superstep index, the thread identity of
/// the run, and the event channel for observability. Subgraph adapters use
/// the thread identity to namespace nested checkpoints.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// Name of the node being invoked.
    pub node: String,
    /// Superstep index of this invocation.
    pub step: u64,
    /// Thread identity of the surrounding run.
    pub thread_id: String,
    /// Channel for emitting events to the run's event bus.
    pub event_sender: flume::Sender<Event>,
}

impl NodeContext {
    /// Emit a node-scoped event enriched with this context's metadata.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.event_sender
            .send(Event::node_message(
                self.node.clone(),
                self.step,
                scope,
                message,
            ))
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }
}

/// Partial state contribution returned by a node invocation.
///
/// Maps channel keys to new contributions. Channels absent from the update
/// are left unchanged; how a present channel combines with concurrent
/// contributions is decided by that channel's reducer.
///
/// # Examples
///
/// ```rust
/// use stategraph::node::PartialUpdate;
/// use serde_json::json;
///
/// let update = PartialUpdate::new()
///     .set("message", json!("done"))
///     .set("steps", json!(["fetch"]));
///
/// assert_eq!(update.get("message"), Some(&json!("done")));
/// assert_eq!(update.len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialUpdate {
    writes: FxHashMap<String, Value>,
}

impl PartialUpdate {
    /// Empty update touching no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update contributing to a single channel.
    #[must_use]
    pub fn single(key: impl Into<String>, value: Value) -> Self {
        Self::new().set(key, value)
    }

    /// Build an update from an existing value map.
    #[must_use]
    pub fn from_map(writes: FxHashMap<String, Value>) -> Self {
        Self { writes }
    }

    /// Contribute a value for a channel.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.writes.insert(key.into(), value);
        self
    }

    /// Contribute a value for a channel without consuming the update.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), value);
    }

    /// Append a structured [`ErrorEvent`] to the reserved `errors` channel.
    ///
    /// The reserved channel uses the append reducer, so contributions from
    /// several nodes in one superstep concatenate instead of conflicting.
    #[must_use]
    pub fn with_error(mut self, event: ErrorEvent) -> Self {
        let entry = event.to_value();
        match self.writes.get_mut(ERRORS_CHANNEL) {
            Some(Value::Array(items)) => items.push(entry),
            _ => {
                self.writes
                    .insert(ERRORS_CHANNEL.to_string(), Value::Array(vec![entry]));
            }
        }
        self
    }

    /// Contribution for a channel, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.writes.get(key)
    }

    /// Channels this update touches, with their contributions.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.writes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of channels touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// `true` when the update touches no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Consume the update, yielding the underlying write map.
    #[must_use]
    pub fn into_writes(self) -> FxHashMap<String, Value> {
        self.writes
    }
}

/// Structured record written to the reserved `errors` channel.
///
/// Produced by the engine when a failing node routes through its declared
/// error edge, and usable by node authors to record recoverable conditions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// When the failure was recorded.
    pub when: DateTime<Utc>,
    /// Node the failure originated from.
    pub node: String,
    /// Superstep index of the failing invocation.
    pub step: u64,
    /// Attempts consumed before the failure was surfaced.
    pub attempts: u32,
    /// Human-readable failure description.
    pub message: String,
    /// Whether the classifier considered the final error retryable.
    pub retryable: bool,
}

impl ErrorEvent {
    /// Record a failure for a node invocation.
    #[must_use]
    pub fn new(node: impl Into<String>, step: u64, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            node: node.into(),
            step,
            attempts: 1,
            message: message.into(),
            retryable: false,
        }
    }

    /// Set the number of attempts consumed.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark whether the final error was classified retryable.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// JSON form stored in the errors channel.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "message": self.message }))
    }
}

/// Errors that can occur when using [`NodeContext`] methods.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeContextError {
    /// Event could not be sent because the bus is disconnected.
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(
        code(stategraph::node::event_bus_unavailable),
        help("The event bus may be shut down or at capacity. Check run state.")
    )]
    EventBusUnavailable,
}

/// Errors raised by node execution.
///
/// These are handed to the node's retry policy; a retryable classification
/// re-invokes the node, anything else fails the superstep. Conditions worth
/// recording without failing belong in the reserved `errors` channel.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stategraph::node::missing_input),
        help("Check that an earlier node produced the required channel.")
    )]
    MissingInput { what: &'static str },

    /// Input data was present but malformed.
    #[error("invalid input: {0}")]
    #[diagnostic(
        code(stategraph::node::invalid),
        help("Check channel value types and required fields.")
    )]
    Invalid(String),

    /// An external service the node depends on failed.
    #[error("external service error ({service}): {message}")]
    #[diagnostic(code(stategraph::node::external))]
    External {
        service: &'static str,
        message: String,
    },

    /// The invocation exceeded its configured timeout.
    #[error("node timed out after {limit_ms} ms")]
    #[diagnostic(
        code(stategraph::node::timeout),
        help("Raise the timeout in the node's retry policy or make the node faster.")
    )]
    Timeout { limit_ms: u64 },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(stategraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// A nested subgraph run failed.
    #[error("subgraph run failed: {0}")]
    #[diagnostic(code(stategraph::node::subgraph))]
    Subgraph(String),

    /// Event bus communication error.
    #[error("event bus error: {0}")]
    #[diagnostic(code(stategraph::node::event_bus))]
    EventBus(#[from] NodeContextError),
}
