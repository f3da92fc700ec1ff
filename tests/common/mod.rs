//! Shared helpers for integration tests.
//!
//! Keeps fixture nodes, store builders, and assertion helpers in one place
//! so the suites stay focused on behavior.

pub mod asserts;
pub mod fixtures;
pub mod nodes;

pub use asserts::*;
pub use fixtures::*;
pub use nodes::*;
