//! Checkpoint persistence contract and the in-process implementation.
//!
//! A [`Checkpoint`] captures one superstep boundary for a thread: the full
//! channel store, the pending frontier, and execution metadata for
//! inspection. Backends implement [`Checkpointer`]; the engine only ever
//! talks to the trait, so volatile and durable storage are interchangeable.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::state::ChannelStore;
use crate::types::NodeId;

/// Errors surfaced by checkpoint backends.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    /// The storage backend failed (connection, query, lock).
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(stategraph::checkpoint::backend))]
    Backend { message: String },

    /// A persisted payload could not be encoded or decoded.
    #[error("checkpoint serialization error: {message}")]
    #[diagnostic(
        code(stategraph::checkpoint::serde),
        help("check that the persisted payload matches the current schema")
    )]
    Serde { message: String },

    /// Anything else.
    #[error("checkpoint error: {message}")]
    #[diagnostic(code(stategraph::checkpoint::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Which checkpoint backend a runner should construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointerKind {
    /// Volatile in-process storage, for tests and short-lived runs.
    InMemory,
    /// Durable SQLite storage.
    #[cfg(feature = "sqlite")]
    Sqlite,
}

/// One persisted superstep boundary for a thread.
///
/// `store` and `frontier` are what resumption needs; `ran_nodes`,
/// `skipped_nodes`, and `updated_channels` record what the superstep did so
/// stored history is inspectable without replaying it.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    /// Thread identity this checkpoint belongs to.
    pub thread_id: String,
    /// Superstep index at this boundary (0 is the seeded initial state).
    pub step: u64,
    /// Full channel state at the boundary.
    pub store: ChannelStore,
    /// Nodes pending for the next superstep.
    pub frontier: Vec<NodeId>,
    /// Scheduler fan-out bound the thread was running with.
    pub concurrency_limit: usize,
    /// When the checkpoint was recorded.
    pub created_at: DateTime<Utc>,
    /// Nodes that executed in the superstep ending at this boundary.
    pub ran_nodes: Vec<NodeId>,
    /// Sentinel frontier entries that were skipped.
    pub skipped_nodes: Vec<NodeId>,
    /// Channels whose value changed in that superstep.
    pub updated_channels: Vec<String>,
}

impl Checkpoint {
    /// Checkpoint with empty execution metadata (used for the step-0 seed).
    #[must_use]
    pub fn new(
        thread_id: impl Into<String>,
        step: u64,
        store: ChannelStore,
        frontier: Vec<NodeId>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            step,
            store,
            frontier,
            concurrency_limit,
            created_at: Utc::now(),
            ran_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            updated_channels: Vec::new(),
        }
    }

    /// Attach what the superstep ending at this boundary executed.
    #[must_use]
    pub fn with_execution(
        mut self,
        ran_nodes: Vec<NodeId>,
        skipped_nodes: Vec<NodeId>,
        updated_channels: Vec<String>,
    ) -> Self {
        self.ran_nodes = ran_nodes;
        self.skipped_nodes = skipped_nodes;
        self.updated_channels = updated_channels;
        self
    }
}

/// Pluggable checkpoint storage.
///
/// Writes for one thread are serialized by the engine (a thread has one
/// runner driving it); writes for distinct threads may land concurrently
/// and must not interfere.
#[async_trait::async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist one boundary. A put at step S makes S the thread's latest
    /// and discards any stored checkpoints with step > S, so resuming from
    /// an earlier step rewrites a single timeline instead of forking one.
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Latest checkpoint for a thread, if any.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Checkpoint at an exact superstep, if stored. This is the time-travel
    /// entry point.
    async fn get(&self, thread_id: &str, step: u64) -> Result<Option<Checkpoint>>;

    /// All thread identities with at least one checkpoint, sorted by id.
    async fn list_threads(&self) -> Result<Vec<String>>;

    /// Stored superstep indices for a thread, ascending.
    async fn list_steps(&self, thread_id: &str) -> Result<Vec<u64>>;
}

/// Volatile checkpoint storage keyed `thread -> step -> checkpoint`.
///
/// Satisfies the same contract as the durable backend, including the
/// truncate-above-S rule on [`put`](Checkpointer::put).
#[derive(Debug, Default)]
pub struct InMemoryCheckpointer {
    threads: Mutex<FxHashMap<String, BTreeMap<u64, Checkpoint>>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FxHashMap<String, BTreeMap<u64, Checkpoint>>>> {
        self.threads.lock().map_err(|_| CheckpointerError::Backend {
            message: "checkpoint map poisoned".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut threads = self.lock()?;
        let timeline = threads.entry(checkpoint.thread_id.clone()).or_default();
        timeline.retain(|stored, _| *stored <= checkpoint.step);
        timeline.insert(checkpoint.step, checkpoint);
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.lock()?;
        Ok(threads
            .get(thread_id)
            .and_then(|timeline| timeline.last_key_value())
            .map(|(_, checkpoint)| checkpoint.clone()))
    }

    async fn get(&self, thread_id: &str, step: u64) -> Result<Option<Checkpoint>> {
        let threads = self.lock()?;
        Ok(threads
            .get(thread_id)
            .and_then(|timeline| timeline.get(&step))
            .cloned())
    }

    async fn list_threads(&self) -> Result<Vec<String>> {
        let threads = self.lock()?;
        let mut ids: Vec<String> = threads.keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_steps(&self, thread_id: &str) -> Result<Vec<u64>> {
        let threads = self.lock()?;
        Ok(threads
            .get(thread_id)
            .map(|timeline| timeline.keys().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint(thread: &str, step: u64) -> Checkpoint {
        let store = ChannelStore::builder().with("step", json!(step)).build();
        Checkpoint::new(thread, step, store, vec![NodeId::named("next")], 4)
    }

    #[tokio::test]
    async fn latest_tracks_highest_step() {
        let cp = InMemoryCheckpointer::new();
        cp.put(checkpoint("t1", 0)).await.unwrap();
        cp.put(checkpoint("t1", 1)).await.unwrap();
        cp.put(checkpoint("t1", 2)).await.unwrap();

        let latest = cp.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.step, 2);
        assert_eq!(cp.list_steps("t1").await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn get_reaches_back_to_any_step() {
        let cp = InMemoryCheckpointer::new();
        for step in 0..4 {
            cp.put(checkpoint("t1", step)).await.unwrap();
        }
        let middle = cp.get("t1", 2).await.unwrap().unwrap();
        assert_eq!(middle.store.get("step"), Some(&json!(2)));
        assert!(cp.get("t1", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_truncates_later_steps() {
        let cp = InMemoryCheckpointer::new();
        for step in 0..5 {
            cp.put(checkpoint("t1", step)).await.unwrap();
        }
        // Rewind to step 2 and write a new timeline from there.
        cp.put(checkpoint("t1", 2)).await.unwrap();
        assert_eq!(cp.list_steps("t1").await.unwrap(), vec![0, 1, 2]);
        assert_eq!(cp.get_latest("t1").await.unwrap().unwrap().step, 2);
    }

    #[tokio::test]
    async fn threads_are_isolated() {
        let cp = InMemoryCheckpointer::new();
        cp.put(checkpoint("a", 0)).await.unwrap();
        cp.put(checkpoint("b", 7)).await.unwrap();

        assert_eq!(cp.list_threads().await.unwrap(), vec!["a", "b"]);
        assert_eq!(cp.get_latest("a").await.unwrap().unwrap().step, 0);
        assert_eq!(cp.get_latest("b").await.unwrap().unwrap().step, 7);
        assert!(cp.get_latest("c").await.unwrap().is_none());
    }
}
