//! Core identifier types for the stategraph runtime.
//!
//! This module defines the fundamental identifiers used throughout the system
//! for naming nodes in a state graph. These are the core domain concepts that
//! define what a graph *is*; runtime execution aliases (thread ids, step
//! indices) live in [`crate::runtimes`].
//!
//! # Key Types
//!
//! - [`NodeId`]: Identifies a node in a graph, including the virtual entry
//!   and terminal sentinels
//!
//! # Examples
//!
//! ```rust
//! use stategraph::types::NodeId;
//!
//! let start = NodeId::Start;
//! let worker = NodeId::Named("classify".to_string());
//! let end = NodeId::End;
//!
//! // Encode for persistence
//! assert_eq!(worker.encode(), "Named:classify");
//! assert_eq!(start.encode(), "Start");
//! assert_eq!(end.encode(), "End");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node within a state graph.
///
/// `NodeId` serves as the unique key for nodes in the adjacency index and in
/// execution frontiers. It gives first-class treatment to the two virtual
/// sentinels every graph has (the entry point and the terminal marker) while
/// allowing arbitrary application nodes through the `Named` variant.
///
/// # Persistence
///
/// `NodeId` supports serialization for checkpointing both through serde and
/// through the [`encode`](Self::encode)/[`decode`](Self::decode) methods,
/// which produce the compact string form stored in frontier lists.
///
/// # Examples
///
/// ```rust
/// use stategraph::types::NodeId;
///
/// let id = NodeId::Named("fetch".to_string());
/// let decoded = NodeId::decode(&id.encode());
/// assert_eq!(id, decoded);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Virtual entry point. Never implemented by applications; it has no
    /// incoming edges and seeds the initial frontier. Every graph must have
    /// at least one edge leaving `Start`.
    Start,

    /// Virtual terminal marker. Never implemented by applications; reaching
    /// it (or draining the frontier) completes a run.
    End,

    /// Application node identified by a name unique within its graph.
    Named(String),
}

impl NodeId {
    /// Build a `Named` id from anything string-like.
    pub fn named(name: impl Into<String>) -> Self {
        NodeId::Named(name.into())
    }

    /// Encode a `NodeId` into its persisted string form.
    ///
    /// - `Start` → `"Start"`
    /// - `End` → `"End"`
    /// - `Named("X")` → `"Named:X"`
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use stategraph::types::NodeId;
    /// assert_eq!(NodeId::Named("fetch".to_string()).encode(), "Named:fetch");
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            NodeId::Start => "Start".to_string(),
            NodeId::End => "End".to_string(),
            NodeId::Named(s) => format!("Named:{s}"),
        }
    }

    /// Decode a persisted string form back into a `NodeId`.
    ///
    /// Unrecognized formats fall back to `Named(s)` so older checkpoint rows
    /// stay readable.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use stategraph::types::NodeId;
    /// assert_eq!(NodeId::decode("Start"), NodeId::Start);
    /// assert_eq!(NodeId::decode("Named:fetch"), NodeId::Named("fetch".to_string()));
    /// assert_eq!(NodeId::decode("fetch"), NodeId::Named("fetch".to_string()));
    /// ```
    pub fn decode(s: &str) -> Self {
        if s == "Start" {
            NodeId::Start
        } else if s == "End" {
            NodeId::End
        } else if let Some(rest) = s.strip_prefix("Named:") {
            NodeId::Named(rest.to_string())
        } else {
            NodeId::Named(s.to_string())
        }
    }

    /// Returns `true` if this is the [`Start`](Self::Start) sentinel.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Returns `true` if this is the [`End`](Self::End) sentinel.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Returns `true` if this is an application node.
    #[must_use]
    pub fn is_named(&self) -> bool {
        matches!(self, Self::Named(_))
    }

    /// The application name for `Named` ids, `None` for the sentinels.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::End => write!(f, "End"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

// Developer experience: allow string literals where a NodeId is expected.
impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        match s {
            "Start" => NodeId::Start,
            "End" => NodeId::End,
            other => NodeId::Named(other.to_string()),
        }
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Start" => NodeId::Start,
            "End" => NodeId::End,
            _ => NodeId::Named(s),
        }
    }
}
