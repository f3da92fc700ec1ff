//! # Stategraph: State-Graph Execution Runtime
//!
//! Stategraph compiles a declared graph of processing steps into an
//! executable plan and drives it through synchronized rounds of parallel
//! node execution, with deterministic state merging, conditional routing,
//! and checkpoint/resume.
//!
//! ## Core Concepts
//!
//! - **Nodes**: Async units of work that read a snapshot and return a
//!   partial update
//! - **Channels**: Named, versioned slots of JSON state merged by reducers
//! - **Plan**: A compiled, validated graph ready to execute
//! - **Superstep**: One round of scheduling, barrier merge, and routing
//! - **Threads**: Independent execution timelines with their own
//!   checkpoints
//!
//! ## Quick Start
//!
//! ### Defining a Node and Compiling a Plan
//!
//! ```
//! use stategraph::{
//!     graphs::GraphBuilder,
//!     node::{Node, NodeContext, NodeError, PartialUpdate},
//!     reducers::Append,
//!     state::Snapshot,
//! };
//! use async_trait::async_trait;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Greeting;
//!
//! #[async_trait]
//! impl Node for Greeting {
//!     async fn run(
//!         &self,
//!         snapshot: Snapshot,
//!         _ctx: NodeContext,
//!     ) -> Result<PartialUpdate, NodeError> {
//!         let name = snapshot.get_str("name").unwrap_or("world");
//!         Ok(PartialUpdate::single(
//!             "messages",
//!             json!([format!("hello, {name}")]),
//!         ))
//!     }
//! }
//!
//! let plan = GraphBuilder::new()
//!     .add_node("greet", Greeting)
//!     .add_channel("messages", Arc::new(Append))
//!     .set_entry("greet")
//!     .add_edge("greet", "End")
//!     .compile();
//! assert!(plan.is_ok());
//! ```
//!
//! ### Seeding and Inspecting State
//!
//! ```
//! use stategraph::state::ChannelStore;
//! use serde_json::json;
//!
//! let store = ChannelStore::builder()
//!     .with("name", json!("ada"))
//!     .with("numbers", json!([1, 2, 3]))
//!     .build();
//!
//! let snapshot = store.snapshot();
//! assert_eq!(snapshot.get_str("name"), Some("ada"));
//! assert_eq!(snapshot.version("numbers"), 1);
//! ```
//!
//! ### Error Handling
//!
//! Errors carry structured context and render as diagnostics:
//!
//! ```
//! use stategraph::node::{NodeContext, NodeError};
//!
//! fn validate(ctx: &NodeContext, input: Option<&str>) -> Result<(), NodeError> {
//!     let _ = ctx.emit("validation", "checking input");
//!     match input {
//!         Some(_) => Ok(()),
//!         None => Err(NodeError::MissingInput { what: "input" }),
//!     }
//! }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - Node identifiers and encoding
//! - [`state`] - Versioned channel store and snapshots
//! - [`node`] - Node trait, partial updates, node errors
//! - [`reducers`] - Merge strategies applied at the barrier
//! - [`reliability`] - Retry policies, backoff, and timeouts
//! - [`graphs`] - Graph definition, routing, and compilation
//! - [`plan`] - Compiled plans and the invoke surface
//! - [`schedulers`] - Concurrent frontier execution
//! - [`runtimes`] - Thread orchestration and checkpointing
//! - [`subgraph`] - Plans nested as nodes of other plans
//! - [`event_bus`] - Execution events, sinks, and streams
//! - [`telemetry`] - Event rendering for human-readable output

pub mod event_bus;
pub mod graphs;
pub mod node;
pub mod plan;
pub mod reducers;
pub mod reliability;
pub mod runtimes;
pub mod schedulers;
pub mod state;
pub mod subgraph;
pub mod telemetry;
pub mod types;
pub mod utils;
