//! Graph construction and compilation.
//!
//! This module provides the building blocks for defining state graphs:
//!
//! - [`GraphBuilder`]: fluent API for declaring nodes, channels, edges,
//!   and reliability configuration
//! - [`ConditionalEdge`], [`Route`], [`Router`]: state-dependent routing
//!   with compile-checked allow-lists
//! - [`CompileError`]: structural validation failures
//! - [`NodesIter`], [`EdgesIter`]: inspection iterators
//!
//! Graphs are *defined* here and *executed* by the
//! [`Plan`](crate::plan::Plan) that [`GraphBuilder::compile`] produces.

mod builder;
mod compilation;
mod edges;
mod iteration;

pub use builder::GraphBuilder;
pub use compilation::CompileError;
pub use edges::{ConditionalEdge, Route, Router, RoutingError};
pub use iteration::{EdgesIter, NodesIter};
