/*!
Thread lifecycle and superstep orchestration for compiled [`Plan`]s.

The [`Runner`] owns everything a running graph needs that the plan itself
does not: per-thread execution state, an optional [`Checkpointer`], the
[`EventBus`], and the [`Scheduler`] that fans the frontier out. A single
runner can drive many threads over the same plan; each thread advances
independently, one superstep at a time.

# Superstep anatomy

[`Runner::run_step`] advances a thread by exactly one superstep:

1. **Schedule**: every `Named` node in the frontier runs concurrently
   against one snapshot taken before the step.
2. **Barrier**: all node outputs are merged into the channel store by the
   plan's reducers, in one deterministic pass.
3. **Frontier**: static edges, conditional routers, and error edges decide
   which nodes run next.
4. **Checkpoint**: when autosave is on and a checkpointer is configured,
   the post-step state is persisted.

A node that exhausts its retry budget fails the whole superstep unless the
plan declares an error edge for it; with an error edge the failure becomes
an `errors`-channel entry and the handler node joins the next frontier.
When the superstep fails, nothing is merged and nothing is checkpointed,
so the stored timeline still ends at the last successful step.

# Example

```rust,no_run
use stategraph::graphs::GraphBuilder;
use stategraph::runtimes::{CheckpointerKind, Runner};
use stategraph::state::ChannelStore;
# use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
# use stategraph::state::Snapshot;
# struct Step;
# #[async_trait::async_trait]
# impl Node for Step {
#     async fn run(&self, _s: Snapshot, _c: NodeContext) -> Result<PartialUpdate, NodeError> {
#         Ok(PartialUpdate::new())
#     }
# }
# async fn example() -> Result<(), Box<dyn std::error::Error>> {
let plan = GraphBuilder::new()
    .add_node("step", Step)
    .set_entry("step")
    .add_edge("step", "End")
    .compile()?;

let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
runner
    .create_thread(
        "thread-1".into(),
        ChannelStore::builder()
            .with("message", serde_json::json!("hello"))
            .build(),
    )
    .await?;

let snapshot = runner.run_until_complete("thread-1").await?;
# let _ = snapshot;
# Ok(())
# }
```
*/

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::Instrument;
use tracing::instrument;

use crate::event_bus::{Event, EventBus, EventStream, STREAM_END_SCOPE};
use crate::graphs::RoutingError;
use crate::node::{ErrorEvent, NodeError, PartialUpdate};
use crate::plan::Plan;
use crate::reducers::ChannelError;
use crate::runtimes::checkpointer::{
    Checkpoint, Checkpointer, CheckpointerError, CheckpointerKind, InMemoryCheckpointer,
};
use crate::schedulers::{NodeFailure, Scheduler, SchedulerError, StepRunResult};
use crate::state::{ChannelStore, Snapshot};
use crate::types::NodeId;

/// Errors surfaced while driving a thread through its supersteps.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    /// The thread id has not been registered with [`Runner::create_thread`].
    #[error("unknown thread: {thread_id}")]
    #[diagnostic(
        code(stategraph::runner::thread_not_found),
        help("call create_thread before stepping or resuming this id")
    )]
    ThreadNotFound { thread_id: String },

    /// The plan has no edge out of `Start`, so no thread can ever run.
    #[error("plan has no entry edges out of Start")]
    #[diagnostic(
        code(stategraph::runner::no_start_nodes),
        help("add set_entry(..) or add_edge(\"Start\", ..) before compiling")
    )]
    NoStartNodes,

    /// A step paused on an interrupt inside a context that cannot resume it.
    #[error("execution paused unexpectedly")]
    #[diagnostic(code(stategraph::runner::unexpected_pause))]
    UnexpectedPause,

    /// No checkpointer is configured, so stored state cannot be consulted.
    #[error("no checkpointer configured for this runner")]
    #[diagnostic(
        code(stategraph::runner::no_checkpointer),
        help("construct the runner with a CheckpointerKind to enable resume")
    )]
    NoCheckpointer,

    /// The requested (thread, step) pair is not in the checkpoint store.
    #[error("no checkpoint for thread {thread_id} at step {step}")]
    #[diagnostic(code(stategraph::runner::checkpoint_not_found))]
    CheckpointNotFound { thread_id: String, step: u64 },

    /// A node exhausted its retry budget and no error edge covers it.
    #[error("node '{node}' failed at step {step} after {attempts} attempt(s): {source}")]
    #[diagnostic(
        code(stategraph::runner::node_failed),
        help("add_error_edge(..) routes this failure to a handler instead")
    )]
    NodeFailed {
        node: NodeId,
        step: u64,
        attempts: u32,
        retryable: bool,
        source: NodeError,
    },

    /// A spawned invocation task panicked or was aborted.
    #[error("invocation task failed: {0}")]
    #[diagnostic(code(stategraph::runner::join))]
    Join(#[from] tokio::task::JoinError),

    #[error("scheduler error: {0}")]
    #[diagnostic(code(stategraph::runner::scheduler))]
    Scheduler(#[from] SchedulerError),

    #[error("barrier error: {0}")]
    #[diagnostic(code(stategraph::runner::barrier))]
    Channel(#[from] ChannelError),

    #[error("routing error: {0}")]
    #[diagnostic(code(stategraph::runner::routing))]
    Routing(#[from] RoutingError),

    #[error("checkpointer error: {0}")]
    #[diagnostic(code(stategraph::runner::checkpointer))]
    Checkpointer(#[from] CheckpointerError),
}

/// In-memory execution state for one thread.
#[derive(Clone, Debug)]
pub struct ThreadState {
    /// Versioned channel contents as of the last completed superstep.
    pub store: ChannelStore,
    /// Number of the last completed superstep; 0 before any step has run.
    pub step: u64,
    /// Nodes scheduled to run in the next superstep.
    pub frontier: Vec<NodeId>,
}

impl From<Checkpoint> for ThreadState {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            store: checkpoint.store,
            step: checkpoint.step,
            frontier: checkpoint.frontier,
        }
    }
}

/// Outcome of creating a thread: fresh start or resumed from storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadInit {
    /// No prior state existed; the thread starts at step 0.
    Fresh,
    /// Stored state was found and loaded.
    Resumed {
        /// Step the restored checkpoint was taken at.
        checkpoint_step: u64,
    },
}

/// What one completed superstep did, for callers and checkpoints.
#[derive(Clone, Debug, Default)]
pub struct StepReport {
    /// Superstep number this report describes.
    pub step: u64,
    /// Named nodes that actually ran.
    pub ran_nodes: Vec<NodeId>,
    /// Sentinel frontier entries that were skipped rather than run.
    pub skipped_nodes: Vec<NodeId>,
    /// Channels whose version advanced at the barrier, sorted by key.
    pub updated_channels: Vec<String>,
    /// Frontier computed for the following superstep.
    pub next_frontier: Vec<NodeId>,
    /// True when the next frontier is empty or all `End`.
    pub completed: bool,
}

/// Interrupt points honored by [`Runner::run_step`].
#[derive(Clone, Debug, Default)]
pub struct StepOptions {
    /// Pause before running a superstep whose frontier contains one of these.
    pub interrupt_before: Vec<NodeId>,
    /// Pause after a superstep in which one of these nodes ran.
    pub interrupt_after: Vec<NodeId>,
    /// Pause after every superstep.
    pub interrupt_each_step: bool,
}

/// Why a step paused instead of completing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PausedReason {
    /// An `interrupt_before` node is in the pending frontier.
    BeforeNode(NodeId),
    /// An `interrupt_after` node ran in the superstep that just finished.
    AfterNode(NodeId),
    /// `interrupt_each_step` paused after this step.
    AfterStep(u64),
}

/// Snapshot of a paused thread, handed back to the caller for inspection.
#[derive(Clone, Debug)]
pub struct PausedReport {
    /// Thread state at the pause point.
    pub thread_state: ThreadState,
    /// Which interrupt fired.
    pub reason: PausedReason,
}

/// Result of a single [`Runner::run_step`] call.
#[derive(Clone, Debug)]
pub enum StepResult {
    /// The superstep ran to its barrier and the thread advanced.
    Completed(StepReport),
    /// An interrupt fired; the thread did not advance past the pause point.
    Paused(PausedReport),
}

/// Terminal status used when closing out a thread's event stream.
enum StreamEndReason {
    Completed { step: u64 },
    Error { step: Option<u64>, error: String },
}

/// Drives threads of a compiled [`Plan`] through supersteps.
///
/// See the [module docs](self) for the step anatomy and an end-to-end
/// example.
pub struct Runner {
    plan: Arc<Plan>,
    threads: FxHashMap<String, ThreadState>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    autosave: bool,
    event_bus: EventBus,
    event_stream_taken: bool,
    scheduler: Scheduler,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("threads", &self.threads.len())
            .field("checkpointer", &self.checkpointer.is_some())
            .field("autosave", &self.autosave)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner with autosave enabled and the given checkpointer.
    #[must_use]
    pub async fn new(plan: Plan, checkpointer: CheckpointerKind) -> Self {
        Self::with_options(plan, Some(checkpointer), true).await
    }

    /// Like [`Runner::new`] for plans already shared behind an [`Arc`].
    #[must_use]
    pub async fn from_arc(plan: Arc<Plan>, checkpointer: CheckpointerKind) -> Self {
        Self::with_options_arc(plan, Some(checkpointer), true).await
    }

    /// Creates a runner with explicit checkpointer and autosave choices.
    ///
    /// `checkpointer: None` disables persistence entirely; `autosave: false`
    /// keeps the checkpointer for explicit resume but skips the per-step save.
    pub async fn with_options(
        plan: Plan,
        checkpointer: Option<CheckpointerKind>,
        autosave: bool,
    ) -> Self {
        let event_bus = plan.runtime_config().event_bus.build_event_bus();
        Self::with_arc_and_bus(Arc::new(plan), checkpointer, autosave, event_bus, true).await
    }

    /// [`Runner::with_options`] for plans already behind an [`Arc`].
    pub async fn with_options_arc(
        plan: Arc<Plan>,
        checkpointer: Option<CheckpointerKind>,
        autosave: bool,
    ) -> Self {
        let event_bus = plan.runtime_config().event_bus.build_event_bus();
        Self::with_arc_and_bus(plan, checkpointer, autosave, event_bus, true).await
    }

    /// Creates a runner around a caller-supplied [`EventBus`].
    ///
    /// Pass `start_listener: false` when the caller drains the bus itself,
    /// for example through [`Runner::event_stream`].
    pub async fn with_options_and_bus(
        plan: Plan,
        checkpointer: Option<CheckpointerKind>,
        autosave: bool,
        event_bus: EventBus,
        start_listener: bool,
    ) -> Self {
        Self::with_arc_and_bus(Arc::new(plan), checkpointer, autosave, event_bus, start_listener)
            .await
    }

    /// [`Runner::with_options_and_bus`] for plans already behind an [`Arc`].
    pub async fn with_options_arc_and_bus(
        plan: Arc<Plan>,
        checkpointer: Option<CheckpointerKind>,
        autosave: bool,
        event_bus: EventBus,
        start_listener: bool,
    ) -> Self {
        Self::with_arc_and_bus(plan, checkpointer, autosave, event_bus, start_listener).await
    }

    /// Creates a runner that shares an existing checkpointer instance.
    ///
    /// Several runners pointing at one store see each other's checkpoints;
    /// subgraph adapters use this so nested threads land in the same
    /// timeline storage as the parent.
    pub fn with_checkpointer(
        plan: Arc<Plan>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        autosave: bool,
        event_bus: EventBus,
        start_listener: bool,
    ) -> Self {
        if start_listener {
            event_bus.listen_for_events();
        }
        let scheduler = match plan.runtime_config().concurrency_limit {
            Some(limit) => Scheduler::new(limit),
            None => Scheduler::default(),
        };
        Self {
            plan,
            threads: FxHashMap::default(),
            checkpointer,
            autosave,
            event_bus,
            event_stream_taken: false,
            scheduler,
        }
    }

    async fn with_arc_and_bus(
        plan: Arc<Plan>,
        checkpointer: Option<CheckpointerKind>,
        autosave: bool,
        event_bus: EventBus,
        start_listener: bool,
    ) -> Self {
        let sqlite_db_name = plan.runtime_config().sqlite_db_name.clone();
        let checkpointer = Self::create_checkpointer(checkpointer, sqlite_db_name).await;
        if start_listener {
            event_bus.listen_for_events();
        }
        let scheduler = match plan.runtime_config().concurrency_limit {
            Some(limit) => Scheduler::new(limit),
            None => Scheduler::default(),
        };
        Self {
            plan,
            threads: FxHashMap::default(),
            checkpointer,
            autosave,
            event_bus,
            event_stream_taken: false,
            scheduler,
        }
    }

    #[cfg_attr(not(feature = "sqlite"), allow(unused_variables))]
    async fn create_checkpointer(
        kind: Option<CheckpointerKind>,
        sqlite_db_name: Option<String>,
    ) -> Option<Arc<dyn Checkpointer>> {
        match kind {
            None => None,
            Some(CheckpointerKind::InMemory) => Some(Arc::new(InMemoryCheckpointer::new())),
            #[cfg(feature = "sqlite")]
            Some(CheckpointerKind::Sqlite) => {
                use crate::runtimes::checkpointer_sqlite::SQLiteCheckpointer;

                let database_url = std::env::var("STATEGRAPH_SQLITE_URL")
                    .ok()
                    .or_else(|| sqlite_db_name.as_ref().map(|name| format!("sqlite://{name}")))
                    .unwrap_or_else(|| {
                        let name = std::env::var("STATEGRAPH_DB_NAME")
                            .unwrap_or_else(|_| "stategraph.db".into());
                        format!("sqlite://{name}")
                    });

                // sqlx will not create the database file on its own.
                if let Some(path) = database_url.strip_prefix("sqlite://") {
                    let path = std::path::Path::new(path);
                    if let Some(parent) = path.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let _ = std::fs::File::create_new(path);
                }

                match SQLiteCheckpointer::connect(&database_url).await {
                    Ok(cp) => Some(Arc::new(cp)),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            url = %database_url,
                            "failed to connect sqlite checkpointer; running without persistence"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Takes the single consumer handle for this runner's event stream.
    ///
    /// Returns `None` once a stream has already been taken and not yet
    /// finalized; events fan out to bus sinks regardless.
    pub fn event_stream(&mut self) -> Option<EventStream> {
        if self.event_stream_taken {
            return None;
        }
        self.event_stream_taken = true;
        Some(self.event_bus.subscribe())
    }

    /// Registers a thread, resuming from its latest checkpoint when one exists.
    ///
    /// With stored state present, `initial` is ignored in favor of the
    /// checkpointed store and frontier. A fresh thread starts at step 0 with
    /// the frontier drawn from the plan's `Start` edges, and its seed state
    /// is checkpointed immediately so step 0 is a valid resume target.
    #[instrument(skip(self, initial), err)]
    pub async fn create_thread(
        &mut self,
        thread_id: String,
        initial: ChannelStore,
    ) -> Result<ThreadInit, RunnerError> {
        if let Some(checkpointer) = &self.checkpointer
            && let Some(stored) = checkpointer.get_latest(&thread_id).await?
        {
            let checkpoint_step = stored.step;
            tracing::info!(thread = %thread_id, step = checkpoint_step, "resuming from checkpoint");
            self.threads.insert(thread_id, ThreadState::from(stored));
            return Ok(ThreadInit::Resumed { checkpoint_step });
        }

        let frontier = self
            .plan
            .edges()
            .get(&NodeId::Start)
            .cloned()
            .unwrap_or_default();
        if frontier.is_empty() {
            return Err(RunnerError::NoStartNodes);
        }

        let thread_state = ThreadState {
            store: initial,
            step: 0,
            frontier,
        };
        if let Some(checkpointer) = &self.checkpointer {
            let seed = Checkpoint::new(
                &thread_id,
                thread_state.step,
                thread_state.store.clone(),
                thread_state.frontier.clone(),
                self.scheduler.concurrency_limit(),
            );
            if let Err(e) = checkpointer.put(seed).await {
                tracing::warn!(thread = %thread_id, error = %e, "seed checkpoint save failed");
            }
        }
        self.threads.insert(thread_id, thread_state);
        Ok(ThreadInit::Fresh)
    }

    /// Rewinds a thread to an arbitrary stored step.
    ///
    /// The restored state replaces any in-memory state for the thread. The
    /// next superstep to run will be `step + 1`; the checkpointer discards
    /// any stored steps beyond it on the next save.
    #[instrument(skip(self), err)]
    pub async fn resume_thread_at(
        &mut self,
        thread_id: &str,
        step: u64,
    ) -> Result<ThreadInit, RunnerError> {
        let Some(checkpointer) = &self.checkpointer else {
            return Err(RunnerError::NoCheckpointer);
        };
        let stored = checkpointer.get(thread_id, step).await?.ok_or_else(|| {
            RunnerError::CheckpointNotFound {
                thread_id: thread_id.to_string(),
                step,
            }
        })?;
        let checkpoint_step = stored.step;
        tracing::info!(thread = %thread_id, step = checkpoint_step, "rewound to checkpoint");
        self.threads
            .insert(thread_id.to_string(), ThreadState::from(stored));
        Ok(ThreadInit::Resumed { checkpoint_step })
    }

    /// Advances one thread by exactly one superstep.
    ///
    /// Checks interrupts in order: `interrupt_before` fires before anything
    /// runs; `interrupt_after` and `interrupt_each_step` fire after the
    /// barrier, with the step's results already merged and checkpointed.
    ///
    /// On failure the thread keeps its pre-step position so the same
    /// superstep can be retried, and the failure is appended to the `errors`
    /// channel of the in-memory store for inspection. Nothing is written to
    /// the checkpointer.
    #[instrument(skip(self, options), err)]
    pub async fn run_step(
        &mut self,
        thread_id: &str,
        options: StepOptions,
    ) -> Result<StepResult, RunnerError> {
        let thread_state = self
            .threads
            .get(thread_id)
            .ok_or_else(|| RunnerError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })?;

        if Self::is_complete(thread_state) {
            let report = StepReport {
                step: thread_state.step,
                ran_nodes: Vec::new(),
                skipped_nodes: thread_state.frontier.clone(),
                updated_channels: Vec::new(),
                next_frontier: thread_state.frontier.clone(),
                completed: true,
            };
            return Ok(StepResult::Completed(report));
        }

        if let Some(node) = thread_state
            .frontier
            .iter()
            .find(|node| options.interrupt_before.contains(*node))
        {
            tracing::info!(thread = %thread_id, node = %node, "paused before node");
            return Ok(StepResult::Paused(PausedReport {
                thread_state: thread_state.clone(),
                reason: PausedReason::BeforeNode(node.clone()),
            }));
        }

        // Take ownership for the duration of the step so the superstep can
        // mutate the store without holding a borrow on the thread map.
        let Some(mut thread_state) = self.threads.remove(thread_id) else {
            return Err(RunnerError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        };

        let report = match self.run_one_superstep(thread_id, &mut thread_state).await {
            Ok(report) => report,
            Err(error) => {
                let failed_step = thread_state.step;
                // Nothing from the failed step was merged; rewind the counter
                // so the next attempt replays the same superstep.
                thread_state.step = failed_step.saturating_sub(1);
                let event = match &error {
                    RunnerError::NodeFailed {
                        node,
                        step,
                        attempts,
                        retryable,
                        source,
                    } => ErrorEvent::new(node.to_string(), *step, source.to_string())
                        .with_attempts(*attempts)
                        .with_retryable(*retryable),
                    RunnerError::Scheduler(source) => {
                        ErrorEvent::new("scheduler", failed_step, source.to_string())
                    }
                    other => ErrorEvent::new("runner", failed_step, other.to_string()),
                };
                let writer = NodeId::named(event.node.clone());
                let partial = PartialUpdate::new().with_error(event);
                if let Err(barrier_error) = self
                    .plan
                    .apply_barrier(&mut thread_state.store, &[(writer, partial)])
                {
                    tracing::warn!(
                        thread = %thread_id,
                        error = %barrier_error,
                        "failed to record step failure in errors channel"
                    );
                }
                self.threads.insert(thread_id.to_string(), thread_state);
                return Err(error);
            }
        };

        if let Some(node) = report
            .ran_nodes
            .iter()
            .find(|node| options.interrupt_after.contains(*node))
            .cloned()
        {
            tracing::info!(thread = %thread_id, node = %node, "paused after node");
            self.threads
                .insert(thread_id.to_string(), thread_state.clone());
            self.maybe_checkpoint(thread_id, Some(&report)).await;
            return Ok(StepResult::Paused(PausedReport {
                thread_state,
                reason: PausedReason::AfterNode(node),
            }));
        }

        if options.interrupt_each_step {
            let step = thread_state.step;
            self.threads
                .insert(thread_id.to_string(), thread_state.clone());
            self.maybe_checkpoint(thread_id, Some(&report)).await;
            return Ok(StepResult::Paused(PausedReport {
                thread_state,
                reason: PausedReason::AfterStep(step),
            }));
        }

        self.threads.insert(thread_id.to_string(), thread_state);
        self.maybe_checkpoint(thread_id, Some(&report)).await;
        Ok(StepResult::Completed(report))
    }

    /// Runs schedule, barrier, and frontier phases for one superstep.
    async fn run_one_superstep(
        &self,
        thread_id: &str,
        thread_state: &mut ThreadState,
    ) -> Result<StepReport, RunnerError> {
        thread_state.step += 1;
        let step = thread_state.step;
        tracing::debug!(step, frontier = ?thread_state.frontier, "starting superstep");

        let schedule_span =
            tracing::info_span!("schedule", step, frontier_len = thread_state.frontier.len());
        let mut run = self
            .schedule_step(thread_id, thread_state, step)
            .instrument(schedule_span)
            .await?;

        let failures = std::mem::take(&mut run.failures);
        let mut outputs = std::mem::take(&mut run.outputs);
        let error_routed = self.route_failures(step, failures, &mut outputs)?;

        let barrier_span = tracing::info_span!(
            "barrier",
            step,
            ran_nodes = run.ran_nodes.len(),
            failures = error_routed.len()
        );
        let updated_channels =
            barrier_span.in_scope(|| self.plan.apply_barrier(&mut thread_state.store, &outputs))?;

        let snapshot = thread_state.store.snapshot();
        let frontier_span = tracing::info_span!(
            "frontier",
            step,
            conditional_edges = self.plan.conditional_edges().len()
        );
        let next_frontier = frontier_span
            .in_scope(|| self.compute_next_frontier(&snapshot, &run.ran_nodes, &error_routed))?;

        tracing::debug!(step, updated = ?updated_channels, next = ?next_frontier, "superstep merged");

        let completed =
            next_frontier.is_empty() || next_frontier.iter().all(|node| *node == NodeId::End);
        thread_state.frontier = next_frontier.clone();

        let _ = self.event_bus.get_sender().send(Event::step_completed(
            step,
            run.ran_nodes.iter().map(ToString::to_string).collect(),
            updated_channels.clone(),
            next_frontier.iter().map(ToString::to_string).collect(),
        ));

        Ok(StepReport {
            step,
            ran_nodes: run.ran_nodes,
            skipped_nodes: run.skipped_nodes,
            updated_channels,
            next_frontier,
            completed,
        })
    }

    async fn schedule_step(
        &self,
        thread_id: &str,
        thread_state: &ThreadState,
        step: u64,
    ) -> Result<StepRunResult, RunnerError> {
        let snapshot = thread_state.store.snapshot();
        let run = self
            .scheduler
            .superstep(
                self.plan.nodes(),
                self.plan.retry_policies(),
                self.plan.default_retry_policy(),
                thread_state.frontier.clone(),
                snapshot,
                step,
                thread_id,
                self.event_bus.get_sender(),
            )
            .await?;
        Ok(run)
    }

    /// Converts node failures into `errors`-channel writes and handler hops.
    ///
    /// Every failure must have an error edge; otherwise the first uncovered
    /// one aborts the superstep before anything is merged.
    fn route_failures(
        &self,
        step: u64,
        failures: Vec<NodeFailure>,
        outputs: &mut Vec<(NodeId, PartialUpdate)>,
    ) -> Result<Vec<(NodeId, NodeId)>, RunnerError> {
        let mut error_routed = Vec::with_capacity(failures.len());
        for failure in failures {
            let Some(handler) = self.plan.error_edges().get(&failure.node) else {
                return Err(RunnerError::NodeFailed {
                    node: failure.node,
                    step,
                    attempts: failure.attempts,
                    retryable: failure.retryable,
                    source: failure.source,
                });
            };
            tracing::warn!(
                node = %failure.node,
                handler = %handler,
                attempts = failure.attempts,
                "node failed; routing to error handler"
            );
            let event = ErrorEvent::new(failure.node.to_string(), step, failure.source.to_string())
                .with_attempts(failure.attempts)
                .with_retryable(failure.retryable);
            outputs.push((failure.node.clone(), PartialUpdate::new().with_error(event)));
            error_routed.push((failure.node, handler.clone()));
        }
        Ok(error_routed)
    }

    /// Computes the next frontier from static edges, routers, and error hops.
    ///
    /// Targets are deduplicated in first-seen order so a node activated by
    /// several predecessors still runs once.
    fn compute_next_frontier(
        &self,
        snapshot: &Snapshot,
        ran_nodes: &[NodeId],
        error_routed: &[(NodeId, NodeId)],
    ) -> Result<Vec<NodeId>, RoutingError> {
        let handlers: FxHashMap<&NodeId, &NodeId> = error_routed
            .iter()
            .map(|(failed, handler)| (failed, handler))
            .collect();

        let mut next_frontier: Vec<NodeId> = Vec::new();
        let mut push = |next_frontier: &mut Vec<NodeId>, target: NodeId| {
            if !next_frontier.contains(&target) {
                next_frontier.push(target);
            }
        };

        for id in ran_nodes {
            if let Some(handler) = handlers.get(id) {
                push(&mut next_frontier, (*handler).clone());
                continue;
            }

            if let Some(targets) = self.plan.edges().get(id) {
                for target in targets {
                    push(&mut next_frontier, target.clone());
                }
            }

            for edge in self
                .plan
                .conditional_edges()
                .iter()
                .filter(|edge| edge.from() == id)
            {
                let route = (edge.router())(snapshot);
                tracing::debug!(from = %id, route = ?route, "conditional edge evaluated");
                for name in route.targets() {
                    let target = NodeId::from(name);
                    if !edge.allows(&target) {
                        return Err(RoutingError::TargetNotAllowed {
                            from: id.clone(),
                            target: name.to_string(),
                        });
                    }
                    push(&mut next_frontier, target);
                }
            }
        }

        Ok(next_frontier)
    }

    async fn maybe_checkpoint(&self, thread_id: &str, report: Option<&StepReport>) {
        if !self.autosave {
            return;
        }
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        let Some(thread_state) = self.threads.get(thread_id) else {
            return;
        };

        let mut checkpoint = Checkpoint::new(
            thread_id,
            thread_state.step,
            thread_state.store.clone(),
            thread_state.frontier.clone(),
            self.scheduler.concurrency_limit(),
        );
        if let Some(report) = report {
            checkpoint = checkpoint.with_execution(
                report.ran_nodes.clone(),
                report.skipped_nodes.clone(),
                report.updated_channels.clone(),
            );
        }

        let span = tracing::info_span!("checkpoint", step = thread_state.step);
        async {
            if let Err(e) = checkpointer.put(checkpoint).await {
                tracing::warn!(thread = %thread_id, error = %e, "checkpoint save failed");
            }
        }
        .instrument(span)
        .await;
    }

    /// Steps a thread until its frontier empties or reaches only `End`.
    ///
    /// Returns the final snapshot. On failure the error is returned as-is;
    /// the thread stays registered at its last successful position, so the
    /// caller may fix inputs and call this again.
    #[instrument(skip(self), err)]
    pub async fn run_until_complete(&mut self, thread_id: &str) -> Result<Snapshot, RunnerError> {
        tracing::info!(thread = %thread_id, "run started");

        loop {
            let thread_state =
                self.threads
                    .get(thread_id)
                    .ok_or_else(|| RunnerError::ThreadNotFound {
                        thread_id: thread_id.to_string(),
                    })?;
            if Self::is_complete(thread_state) {
                break;
            }

            match self.run_step(thread_id, StepOptions::default()).await {
                Ok(StepResult::Completed(report)) => {
                    if report.completed {
                        break;
                    }
                }
                Ok(StepResult::Paused(_)) => {
                    let step = self.threads.get(thread_id).map(|ts| ts.step);
                    self.finalize_event_stream(
                        thread_id,
                        StreamEndReason::Error {
                            step,
                            error: "execution paused unexpectedly".into(),
                        },
                    );
                    return Err(RunnerError::UnexpectedPause);
                }
                Err(error) => {
                    let step = self.threads.get(thread_id).map(|ts| ts.step);
                    let _ = self.event_bus.get_sender().send(Event::run_completed(
                        thread_id,
                        "failed",
                        step.unwrap_or_default(),
                    ));
                    self.finalize_event_stream(
                        thread_id,
                        StreamEndReason::Error {
                            step,
                            error: error.to_string(),
                        },
                    );
                    return Err(error);
                }
            }
        }

        let (snapshot, final_step) = self.final_snapshot(thread_id)?;
        tracing::info!(thread = %thread_id, step = final_step, "run completed");
        let mut keys: Vec<&str> = snapshot.keys().collect();
        keys.sort_unstable();
        for key in keys {
            tracing::debug!(
                thread = %thread_id,
                channel = key,
                version = snapshot.version(key),
                "final channel"
            );
        }

        let _ = self.event_bus.get_sender().send(Event::run_completed(
            thread_id,
            "completed",
            final_step,
        ));
        self.finalize_event_stream(thread_id, StreamEndReason::Completed { step: final_step });
        Ok(snapshot)
    }

    /// Flushes queued events and stops the bus listener.
    ///
    /// Call after the last run on this runner; events emitted afterwards are
    /// queued but no longer forwarded to sinks or subscribers.
    pub async fn drain_event_bus(&self) {
        self.event_bus.stop_listener().await;
    }

    /// Returns the in-memory state of a thread, if registered.
    pub fn get_thread(&self, thread_id: &str) -> Option<&ThreadState> {
        self.threads.get(thread_id)
    }

    /// Thread ids currently registered with this runner, sorted.
    pub fn list_threads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.threads.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// True when the thread's frontier is empty or contains only `End`.
    pub fn is_thread_complete(&self, thread_id: &str) -> Option<bool> {
        self.threads.get(thread_id).map(Self::is_complete)
    }
}

impl Runner {
    fn is_complete(thread_state: &ThreadState) -> bool {
        thread_state.frontier.is_empty()
            || thread_state
                .frontier
                .iter()
                .all(|node| *node == NodeId::End)
    }

    fn final_snapshot(&self, thread_id: &str) -> Result<(Snapshot, u64), RunnerError> {
        let thread_state =
            self.threads
                .get(thread_id)
                .ok_or_else(|| RunnerError::ThreadNotFound {
                    thread_id: thread_id.to_string(),
                })?;
        Ok((thread_state.store.snapshot(), thread_state.step))
    }

    /// Emits the in-band stream terminator and releases the stream handle.
    fn finalize_event_stream(&mut self, thread_id: &str, reason: StreamEndReason) {
        let message = match reason {
            StreamEndReason::Completed { step } => {
                format!("thread={thread_id} status=completed step={step}")
            }
            StreamEndReason::Error { step: Some(step), error } => {
                format!("thread={thread_id} status=error step={step} error={error}")
            }
            StreamEndReason::Error { step: None, error } => {
                format!("thread={thread_id} status=error error={error}")
            }
        };
        if let Err(err) = self
            .event_bus
            .get_sender()
            .send(Event::diagnostic(STREAM_END_SCOPE, message.clone()))
        {
            tracing::debug!(
                thread = %thread_id,
                completion_message = %message,
                error = ?err,
                "failed to emit stream termination event"
            );
        }
        self.event_stream_taken = false;
    }
}
