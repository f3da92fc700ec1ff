//! # Quickstart: Build, Compile, Invoke
//!
//! The smallest useful pipeline: two nodes appending to a shared channel,
//! one superstep each, then the final snapshot.
//!
//! What this demo shows:
//! 1. Declaring nodes, channels, and edges with `GraphBuilder`
//! 2. Compiling into an executable `Plan`
//! 3. Seeding a `ChannelStore` and calling `Plan::invoke`
//! 4. Reading results from the final `Snapshot`
//!
//! Run with:
//! ```bash
//! cargo run --example quickstart
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use miette::Result;
use serde_json::json;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stategraph::graphs::GraphBuilder;
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::reducers::Append;
use stategraph::state::{ChannelStore, Snapshot};

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,stategraph=info"))
        .expect("hardcoded filter directive parses");

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn init_miette() {
    miette::set_panic_hook();
}

/// Appends one line to the `messages` channel and reports progress.
struct Stage {
    name: &'static str,
}

#[async_trait]
impl Node for Stage {
    async fn run(&self, snapshot: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let seen = snapshot.get_array("messages").map_or(0, |m| m.len());
        ctx.emit("progress", format!("{} sees {seen} message(s)", self.name))?;
        Ok(PartialUpdate::single(
            "messages",
            json!([format!("{} ran at step {}", self.name, ctx.step)]),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    init_miette();

    info!("building the plan");
    let plan = GraphBuilder::new()
        .add_node("ingest", Stage { name: "ingest" })
        .add_node("summarize", Stage { name: "summarize" })
        .add_channel("messages", Arc::new(Append))
        .set_entry("ingest")
        .add_edge("ingest", "summarize")
        .add_edge("summarize", "End")
        .compile()?;

    info!("invoking");
    let initial = ChannelStore::builder()
        .with("messages", json!(["seed message"]))
        .build();
    let snapshot = plan.invoke(initial).await?;

    info!("final state:");
    if let Some(messages) = snapshot.get_array("messages") {
        for message in messages {
            info!("  {message}");
        }
    }
    info!(
        "messages channel is at version {}",
        snapshot.version("messages")
    );

    Ok(())
}
