//! Runtime configuration carried by a compiled plan.
//!
//! [`RuntimeConfig`] collects the knobs that affect execution but not graph
//! shape: default thread identity, checkpoint backend, SQLite database name
//! resolution, scheduler fan-out bound, and event bus wiring.

use crate::event_bus::{EventBus, MemorySink, StdOutSink};
use crate::utils::id_generator::IdGenerator;

use super::CheckpointerKind;

/// Execution-time settings attached to a plan at build time.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Thread identity used by `invoke` when the caller does not name one.
    pub thread_id: Option<String>,
    /// Checkpoint backend; `None` disables persistence entirely.
    pub checkpointer: Option<CheckpointerKind>,
    /// SQLite database file name (resolved against `STATEGRAPH_DB_NAME`).
    pub sqlite_db_name: Option<String>,
    /// Upper bound on concurrently running nodes per superstep; `None`
    /// falls back to available parallelism.
    pub concurrency_limit: Option<usize>,
    /// Event bus wiring for runs built from this config.
    pub event_bus: EventBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_id: Some(IdGenerator::new().generate_thread_id()),
            checkpointer: Some(CheckpointerKind::InMemory),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
            concurrency_limit: None,
            event_bus: EventBusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if let Some(name) = provided {
            return Some(name);
        }
        dotenvy::dotenv().ok();
        Some(std::env::var("STATEGRAPH_DB_NAME").unwrap_or_else(|_| "stategraph.db".to_string()))
    }

    pub fn new(
        thread_id: Option<String>,
        checkpointer: Option<CheckpointerKind>,
        sqlite_db_name: Option<String>,
    ) -> Self {
        Self {
            thread_id,
            checkpointer,
            sqlite_db_name: Self::resolve_sqlite_db_name(sqlite_db_name),
            concurrency_limit: None,
            event_bus: EventBusConfig::default(),
        }
    }

    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_stdout_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_stdout_only())
    }

    #[must_use]
    pub fn with_memory_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_memory_sink())
    }
}

/// Sink choices expressible through configuration. Custom sinks are added
/// on a hand-built [`EventBus`] instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

/// Event bus wiring: buffer capacity plus the sinks to attach.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub buffer_capacity: usize,
    pub sinks: Vec<SinkConfig>,
}

impl EventBusConfig {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(buffer_capacity: usize, sinks: Vec<SinkConfig>) -> Self {
        Self {
            buffer_capacity: if buffer_capacity == 0 {
                Self::DEFAULT_BUFFER_CAPACITY
            } else {
                buffer_capacity
            },
            sinks,
        }
    }

    #[must_use]
    pub fn with_stdout_only() -> Self {
        Self::new(Self::DEFAULT_BUFFER_CAPACITY, vec![SinkConfig::StdOut])
    }

    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self::new(
            Self::DEFAULT_BUFFER_CAPACITY,
            vec![SinkConfig::StdOut, SinkConfig::Memory],
        )
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn sinks(&self) -> &[SinkConfig] {
        &self.sinks
    }

    /// Construct the bus this config describes. The listener is not
    /// started; the runner decides when consumption begins.
    #[must_use]
    pub fn build_event_bus(&self) -> EventBus {
        let bus = EventBus::with_capacity(self.buffer_capacity);
        for sink in &self.sinks {
            match sink {
                SinkConfig::StdOut => bus.add_sink(StdOutSink::default()),
                SinkConfig::Memory => bus.add_sink(MemorySink::default()),
            }
        }
        bus
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::with_stdout_only()
    }
}
