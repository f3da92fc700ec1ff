//! # Time Travel: Checkpoints and Rewind
//!
//! Every superstep autosaves a checkpoint. This demo runs a counting loop
//! to completion, rewinds the thread to an earlier step with
//! `Runner::resume_thread_at`, and replays from there. Writing a
//! checkpoint at step N discards any stored steps beyond N, so the replay
//! owns the timeline from the rewind point on.
//!
//! Run with:
//! ```bash
//! cargo run --example time_travel
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use stategraph::graphs::{GraphBuilder, Route};
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::reducers::Overwrite;
use stategraph::runtimes::{CheckpointerKind, Runner};
use stategraph::state::{ChannelStore, Snapshot};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .expect("hardcoded filter directive parses"),
        )
        .with(ErrorLayer::default())
        .init();
}

/// Increments the `count` channel by one per superstep.
struct Increment;

#[async_trait]
impl Node for Increment {
    async fn run(&self, snapshot: Snapshot, _: NodeContext) -> Result<PartialUpdate, NodeError> {
        let count = snapshot.get_i64("count").unwrap_or(0);
        Ok(PartialUpdate::single("count", json!(count + 1)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    miette::set_panic_hook();

    let plan = GraphBuilder::new()
        .add_node("increment", Increment)
        .add_channel("count", Arc::new(Overwrite))
        .set_entry("increment")
        .add_conditional_edge(
            "increment",
            Arc::new(|snapshot: &Snapshot| {
                if snapshot.get_i64("count").unwrap_or(0) < 5 {
                    Route::from("increment")
                } else {
                    Route::end()
                }
            }),
            ["increment", "End"],
        )
        .compile()?;

    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    let thread = "counter".to_string();

    runner
        .create_thread(thread.clone(), ChannelStore::new())
        .await?;
    let first = runner.run_until_complete(&thread).await?;
    info!(
        "first run finished with count = {:?}",
        first.get_i64("count")
    );

    // Rewind to the state after superstep 2 and replay.
    let init = runner.resume_thread_at(&thread, 2).await?;
    info!("rewound: {init:?}");
    if let Some(state) = runner.get_thread(&thread) {
        info!(
            "after rewind the thread sits at step {} with count = {:?}",
            state.step,
            state.store.get("count")
        );
    }

    let second = runner.run_until_complete(&thread).await?;
    info!(
        "replay finished with count = {:?}",
        second.get_i64("count")
    );

    Ok(())
}
