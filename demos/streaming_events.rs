//! # Streaming Events
//!
//! Consume the event feed of a running plan: node progress messages, one
//! step event per superstep, and the terminal diagnostic that closes the
//! stream. The same pattern feeds SSE endpoints or WebSocket connections;
//! each client gets its own subscription.
//!
//! What this demo shows:
//! 1. `Plan::invoke_streaming` returning a join handle plus an `EventStream`
//! 2. Watching for `STREAM_END_SCOPE` to know the run is over
//! 3. Joining the handle for the final snapshot
//!
//! Run with:
//! ```bash
//! cargo run --example streaming_events
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use stategraph::event_bus::STREAM_END_SCOPE;
use stategraph::graphs::GraphBuilder;
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::reducers::Append;
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

/// Emits incremental progress while producing its update.
struct Worker;

#[async_trait]
impl Node for Worker {
    async fn run(&self, _: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        for phase in ["collecting", "crunching", "formatting"] {
            ctx.emit("progress", phase)?;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Ok(PartialUpdate::single("results", json!(["done"])))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    miette::set_panic_hook();

    let plan = GraphBuilder::new()
        .add_node("worker", Worker)
        .add_channel("results", Arc::new(Append))
        .set_entry("worker")
        .add_edge("worker", "End")
        .compile()?;

    let initial = ChannelStore::new();
    let (handle, events) = plan.invoke_streaming(initial).await;

    let mut stream = events.into_async_stream();
    while let Some(event) = stream.next().await {
        info!("event: {event}");
        if event.scope_label() == Some(STREAM_END_SCOPE) {
            info!("stream closed");
            break;
        }
    }

    let snapshot = handle.join().await?;
    info!("final results: {:?}", snapshot.get("results"));

    Ok(())
}
