//! Superstep execution engine.
//!
//! A [`Scheduler`] runs one superstep at a time: every named node in the
//! frontier is spawned as a Tokio task against the same immutable
//! [`Snapshot`], bounded by a concurrency limit. The call returns only
//! once every task has finished, so the barrier is implicit in the join.
//!
//! The scheduler never touches channel state. Successful outputs are
//! returned to the caller in frontier order for the reducer barrier, and
//! failures that survived their retry budget are reported alongside so
//! the caller can decide between error-edge handling and aborting the
//! run.

use std::sync::Arc;

use flume::Sender;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::event_bus::Event;
use crate::node::{Node, NodeContext, NodeError, PartialUpdate};
use crate::reliability::{run_with_policy, RetryPolicy};
use crate::state::Snapshot;
use crate::types::NodeId;

/// Errors surfaced by [`Scheduler::superstep`].
///
/// Node-level failures are *not* errors at this layer; they are carried
/// in [`StepRunResult::failures`] so the caller can route them. These
/// variants cover infrastructure problems only.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    /// The frontier referenced a node id with no registered
    /// implementation. Compilation prevents this for well-formed plans.
    #[error("no node registered for '{node}'")]
    #[diagnostic(
        code(stategraph::scheduler::missing_node),
        help("frontier ids must name nodes added to the builder before compile")
    )]
    MissingNode {
        /// The unresolvable frontier entry.
        node: NodeId,
    },

    /// A spawned node task panicked or was cancelled before completing.
    #[error("node task failed to join")]
    #[diagnostic(code(stategraph::scheduler::join))]
    Join(#[from] tokio::task::JoinError),
}

/// A node that exhausted its retry budget (or hit a fatal error) during
/// a superstep.
#[derive(Debug)]
pub struct NodeFailure {
    /// Node that failed.
    pub node: NodeId,
    /// Superstep in which the failure occurred.
    pub step: u64,
    /// Attempts consumed, including the final one.
    pub attempts: u32,
    /// Whether the last error was classified retryable (budget ran out)
    /// rather than fatal.
    pub retryable: bool,
    /// The error from the last attempt.
    pub source: NodeError,
}

/// Outcome of one superstep.
///
/// `outputs` preserves frontier order, which downstream reducers rely on
/// for deterministic merging. A node appears in exactly one of
/// `outputs` + `failures`, or in `skipped_nodes` if it was a sentinel.
#[derive(Debug, Default)]
pub struct StepRunResult {
    /// Successful `(node, update)` pairs in frontier order.
    pub outputs: Vec<(NodeId, PartialUpdate)>,
    /// Nodes that executed (successfully or not) this superstep.
    pub ran_nodes: Vec<NodeId>,
    /// Sentinel frontier entries (`Start`/`End`) that carry no work.
    pub skipped_nodes: Vec<NodeId>,
    /// Nodes whose retry budget was exhausted this superstep.
    pub failures: Vec<NodeFailure>,
}

impl StepRunResult {
    /// True when every executed node produced an update.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Bounded fan-out executor for one superstep at a time.
///
/// Cloning is cheap; the scheduler holds only its concurrency limit.
#[derive(Clone, Debug)]
pub struct Scheduler {
    concurrency_limit: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(num_cpus())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

type AttemptResult = Result<(PartialUpdate, u32), (u32, bool, NodeError)>;

impl Scheduler {
    /// Create a scheduler that runs at most `concurrency_limit` nodes at
    /// once. A limit of zero is treated as one.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Maximum number of node tasks in flight.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Execute every named node in `frontier` against `snapshot`.
    ///
    /// All tasks observe the same snapshot; writes from this superstep
    /// become visible only after the caller merges `outputs` through its
    /// reducers. Each node runs under its retry policy (falling back to
    /// `default_policy`), and nodes that exhaust their budget land in
    /// [`StepRunResult::failures`] instead of aborting the barrier.
    ///
    /// `Start` and `End` entries are recorded as skipped; they have no
    /// runnable body.
    #[instrument(skip_all, fields(step, frontier_len = frontier.len()))]
    #[allow(clippy::too_many_arguments)]
    pub async fn superstep(
        &self,
        nodes: &FxHashMap<NodeId, Arc<dyn Node>>,
        policies: &FxHashMap<NodeId, RetryPolicy>,
        default_policy: &RetryPolicy,
        frontier: Vec<NodeId>,
        snapshot: Snapshot,
        step: u64,
        thread_id: &str,
        event_sender: Sender<Event>,
    ) -> Result<StepRunResult, SchedulerError> {
        let mut skipped_nodes = Vec::new();
        let mut runnable: Vec<(NodeId, Arc<dyn Node>, RetryPolicy)> = Vec::new();

        for id in frontier {
            if matches!(id, NodeId::Start | NodeId::End) {
                skipped_nodes.push(id);
                continue;
            }
            let node = nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| SchedulerError::MissingNode { node: id.clone() })?;
            let policy = policies.get(&id).cloned().unwrap_or_else(|| default_policy.clone());
            runnable.push((id, node, policy));
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut handles: Vec<(NodeId, JoinHandle<AttemptResult>)> =
            Vec::with_capacity(runnable.len());

        for (id, node, policy) in runnable {
            let semaphore = Arc::clone(&semaphore);
            let snapshot = snapshot.clone();
            let ctx = NodeContext {
                node: id.to_string(),
                step,
                thread_id: thread_id.to_string(),
                event_sender: event_sender.clone(),
            };
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("scheduler semaphore closed");
                debug!(node = %task_id, step, "node started");
                match run_with_policy(node.as_ref(), &policy, &snapshot, &ctx).await {
                    Ok(outcome) => Ok((outcome.update, outcome.attempts)),
                    Err(exhausted) => {
                        Err((exhausted.attempts, exhausted.retryable, exhausted.source))
                    }
                }
            });
            handles.push((id, handle));
        }

        let mut result = StepRunResult {
            skipped_nodes,
            ..StepRunResult::default()
        };

        // Join in spawn order so outputs stay aligned with the frontier.
        for (id, handle) in handles {
            result.ran_nodes.push(id.clone());
            match handle.await? {
                Ok((update, attempts)) => {
                    debug!(node = %id, step, attempts, "node completed");
                    result.outputs.push((id, update));
                }
                Err((attempts, retryable, source)) => {
                    result.failures.push(NodeFailure {
                        node: id,
                        step,
                        attempts,
                        retryable,
                        source,
                    });
                }
            }
        }

        Ok(result)
    }
}
