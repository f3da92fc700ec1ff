//! Runtime layer: thread orchestration, checkpointing, and configuration.
//!
//! The [`Runner`] drives compiled plans superstep by superstep, one entry
//! per thread. Persistence is pluggable through the [`Checkpointer`] trait
//! with an in-memory backend always available and a SQLite backend behind
//! the `sqlite` feature. [`RuntimeConfig`] carries the knobs a plan hands
//! to the runner it spawns.

pub mod checkpointer;
#[cfg(feature = "sqlite")]
pub mod checkpointer_sqlite;
#[cfg(feature = "sqlite")]
mod checkpointer_sqlite_helpers;
pub mod persistence;
pub mod runner;
pub mod runtime_config;

pub use checkpointer::{
    Checkpoint, Checkpointer, CheckpointerError, CheckpointerKind, InMemoryCheckpointer,
};
#[cfg(feature = "sqlite")]
pub use checkpointer_sqlite::SQLiteCheckpointer;
pub use persistence::{PersistedCell, PersistedCheckpoint, PersistedStore, PersistenceError};
pub use runner::{
    PausedReason, PausedReport, Runner, RunnerError, StepOptions, StepReport, StepResult,
    ThreadInit, ThreadState,
};
pub use runtime_config::{EventBusConfig, RuntimeConfig, SinkConfig};

/// Identifier for one independent execution timeline.
pub type ThreadId = String;

/// Superstep counter; 0 is the seeded state before any step has run.
pub type StepNumber = u64;
