use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scope of the diagnostic emitted when a streaming run finishes, so stream
/// consumers know no further events will arrive.
pub const STREAM_END_SCOPE: &str = "__stategraph_stream_end__";

/// Everything the runtime can broadcast about a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// A node-scoped message: lifecycle markers from the scheduler or custom
    /// messages emitted by the node through its context.
    Node(NodeEvent),
    /// Superstep barrier summary.
    Step(StepEvent),
    /// Run completion summary.
    Run(RunEvent),
    /// Engine-level message not tied to a node or step.
    Diagnostic(DiagnosticEvent),
}

impl Event {
    /// Node-scoped message carrying the emitting node's identity and step.
    pub fn node_message(
        node_id: impl Into<String>,
        step: u64,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Node(NodeEvent::new(node_id.into(), step, scope.into(), message.into()))
    }

    /// Barrier summary for one superstep.
    pub fn step_completed(
        step: u64,
        ran_nodes: Vec<String>,
        updated_channels: Vec<String>,
        next_frontier: Vec<String>,
    ) -> Self {
        Event::Step(StepEvent::new(step, ran_nodes, updated_channels, next_frontier))
    }

    /// Completion summary for a whole run.
    pub fn run_completed(thread_id: impl Into<String>, status: impl Into<String>, steps: u64) -> Self {
        Event::Run(RunEvent::new(thread_id.into(), status.into(), steps))
    }

    /// Engine-level message.
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    pub fn scope_label(&self) -> Option<&str> {
        match self {
            Event::Node(node) => Some(node.scope()),
            Event::Step(_) => Some("step"),
            Event::Run(_) => Some("run"),
            Event::Diagnostic(diag) => Some(diag.scope()),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Event::Node(node) => node.message(),
            Event::Step(step) => step.summary(),
            Event::Run(run) => run.summary(),
            Event::Diagnostic(diag) => diag.message(),
        }
    }

    /// Convert event to structured JSON value with a normalized schema.
    ///
    /// Returns a JSON object with the following structure:
    /// ```json
    /// {
    ///   "type": "node" | "step" | "run" | "diagnostic",
    ///   "scope": "scope_label",
    ///   "message": "event_message",
    ///   "timestamp": "2026-08-25T12:34:56.789Z",
    ///   "metadata": { /* variant-specific fields */ }
    /// }
    /// ```
    ///
    /// # Example
    ///
    /// ```
    /// use stategraph::event_bus::Event;
    ///
    /// let event = Event::node_message("router", 5, "routing", "picked branch");
    /// let json = event.to_json_value();
    ///
    /// assert_eq!(json["type"], "node");
    /// assert_eq!(json["scope"], "routing");
    /// assert_eq!(json["message"], "picked branch");
    /// assert_eq!(json["metadata"]["node_id"], "router");
    /// assert_eq!(json["metadata"]["step"], 5);
    /// ```
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;

        let (event_type, metadata) = match self {
            Event::Node(node) => {
                let mut meta = serde_json::Map::new();
                meta.insert("node_id".to_string(), json!(node.node_id()));
                meta.insert("step".to_string(), json!(node.step()));
                ("node", Value::Object(meta))
            }
            Event::Step(step) => {
                let mut meta = serde_json::Map::new();
                meta.insert("step".to_string(), json!(step.step()));
                meta.insert("ran_nodes".to_string(), json!(step.ran_nodes()));
                meta.insert("updated_channels".to_string(), json!(step.updated_channels()));
                meta.insert("next_frontier".to_string(), json!(step.next_frontier()));
                ("step", Value::Object(meta))
            }
            Event::Run(run) => {
                let mut meta = serde_json::Map::new();
                meta.insert("thread_id".to_string(), json!(run.thread_id()));
                meta.insert("status".to_string(), json!(run.status()));
                meta.insert("steps".to_string(), json!(run.steps()));
                ("run", Value::Object(meta))
            }
            Event::Diagnostic(_) => ("diagnostic", Value::Object(serde_json::Map::new())),
        };

        json!({
            "type": event_type,
            "scope": self.scope_label(),
            "message": self.message(),
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": metadata,
        })
    }

    /// Convert event to compact JSON string representation.
    ///
    /// # Example
    ///
    /// ```
    /// use stategraph::event_bus::Event;
    ///
    /// let event = Event::diagnostic("test", "message");
    /// let json_str = event.to_json_string().unwrap();
    /// assert!(json_str.contains("\"type\":\"diagnostic\""));
    /// ```
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    /// Convert event to pretty-printed JSON string with indentation.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Node(node) => {
                write!(f, "[{}@{}] {}", node.node_id(), node.step(), node.message())
            }
            Event::Step(step) => write!(f, "[step {}] {}", step.step(), step.summary()),
            Event::Run(run) => write!(f, "[run {}] {}", run.thread_id(), run.summary()),
            Event::Diagnostic(diag) => write!(f, "{}", diag.message()),
        }
    }
}

/// Node-scoped event: who said it, in which superstep, and under what scope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEvent {
    node_id: String,
    step: u64,
    scope: String,
    message: String,
}

impl NodeEvent {
    pub fn new(node_id: String, step: u64, scope: String, message: String) -> Self {
        Self {
            node_id,
            step,
            scope,
            message,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Barrier summary emitted once per superstep.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEvent {
    step: u64,
    ran_nodes: Vec<String>,
    updated_channels: Vec<String>,
    next_frontier: Vec<String>,
    summary: String,
}

impl StepEvent {
    pub fn new(
        step: u64,
        ran_nodes: Vec<String>,
        updated_channels: Vec<String>,
        next_frontier: Vec<String>,
    ) -> Self {
        let summary = format!(
            "ran {} node(s), updated [{}], next [{}]",
            ran_nodes.len(),
            updated_channels.join(", "),
            next_frontier.join(", "),
        );
        Self {
            step,
            ran_nodes,
            updated_channels,
            next_frontier,
            summary,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn ran_nodes(&self) -> &[String] {
        &self.ran_nodes
    }

    pub fn updated_channels(&self) -> &[String] {
        &self.updated_channels
    }

    pub fn next_frontier(&self) -> &[String] {
        &self.next_frontier
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// Run completion summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    thread_id: String,
    status: String,
    steps: u64,
    summary: String,
}

impl RunEvent {
    pub fn new(thread_id: String, status: String, steps: u64) -> Self {
        let summary = format!("{status} after {steps} superstep(s)");
        Self {
            thread_id,
            status,
            steps,
            summary,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// Engine-level message not tied to a node or step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    scope: String,
    message: String,
}

impl DiagnosticEvent {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_event_renders_identity() {
        let event = Event::node_message("fetch", 3, "progress", "halfway");
        assert_eq!(event.to_string(), "[fetch@3] halfway");
        assert_eq!(event.scope_label(), Some("progress"));
    }

    #[test]
    fn step_event_summarizes_barrier() {
        let event = Event::step_completed(
            2,
            vec!["a".into(), "b".into()],
            vec!["out".into()],
            vec!["c".into()],
        );
        let json = event.to_json_value();
        assert_eq!(json["type"], "step");
        assert_eq!(json["metadata"]["step"], 2);
        assert_eq!(json["metadata"]["ran_nodes"][1], "b");
    }

    #[test]
    fn run_event_carries_status() {
        let event = Event::run_completed("thread-1", "completed", 7);
        assert!(event.message().contains("completed"));
        assert_eq!(event.to_json_value()["metadata"]["steps"], 7);
    }
}
