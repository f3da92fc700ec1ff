//! Identifier generation for threads and runs.
//!
//! Thread ids key everything the runtime persists, so they must be unique
//! across processes; run ids only need to be unique enough to correlate
//! log lines and events from one invocation. Thread ids are therefore
//! UUID-backed while run ids trade uniqueness for readability.

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

/// Stateless factory for runtime identifiers.
///
/// # Examples
///
/// ```rust
/// use stategraph::utils::id_generator::IdGenerator;
///
/// let ids = IdGenerator::new();
/// let thread = ids.generate_thread_id();
/// assert!(thread.starts_with("thread-"));
/// assert_ne!(thread, ids.generate_thread_id());
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Globally unique thread id: `thread-<uuid>`.
    #[must_use]
    pub fn generate_thread_id(&self) -> String {
        format!("thread-{}", Uuid::new_v4().simple())
    }

    /// Sortable, human-scannable run id: `run-<utc timestamp>-<hex nonce>`.
    #[must_use]
    pub fn generate_run_id(&self) -> String {
        let nonce: u16 = rand::rng().random();
        format!("run-{}-{nonce:04x}", Utc::now().format("%Y%m%d%H%M%S"))
    }
}
