//! Concurrent superstep scheduling.
//!
//! See [`scheduler::Scheduler`] for the execution model: bounded
//! fan-out over the frontier, one shared snapshot per superstep, and an
//! implicit barrier at task join.

pub mod scheduler;

pub use scheduler::{NodeFailure, Scheduler, SchedulerError, StepRunResult};
