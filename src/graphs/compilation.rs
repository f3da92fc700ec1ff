//! Graph compilation: structural validation and conversion to a [`Plan`].
//!
//! Compilation is the boundary between graph *definition* and graph
//! *execution*. Everything that can be checked without running a node is
//! checked here, so a compiled plan can assume a well-formed topology.

use std::collections::VecDeque;

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::plan::Plan;
use crate::reducers::ERRORS_CHANNEL;
use crate::types::NodeId;

/// Structural defects detected at compile time.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    /// No edge, conditional or static, leaves `Start`.
    #[error("graph has no entry point: no edge leaves Start")]
    #[diagnostic(
        code(stategraph::compile::missing_entry),
        help("declare an entry with set_entry(..) or add_edge(\"Start\", ..)")
    )]
    MissingEntry,

    /// The same node name was registered more than once.
    #[error("node '{name}' was registered more than once")]
    #[diagnostic(code(stategraph::compile::duplicate_node))]
    DuplicateNode { name: String },

    /// An edge, allow-list, or error handler names an unknown node.
    #[error("edge from '{from}' targets '{target}', which is not a declared node")]
    #[diagnostic(
        code(stategraph::compile::undeclared_target),
        help("targets must be declared with add_node(..) or be the virtual End node")
    )]
    UndeclaredTarget { from: String, target: String },

    /// A declared node no edge can ever reach.
    #[error("node '{name}' is unreachable from Start")]
    #[diagnostic(code(stategraph::compile::dead_node))]
    DeadNode { name: String },

    /// A conditional edge whose router has no legal target.
    #[error("conditional edge from '{from}' has an empty allow-list")]
    #[diagnostic(code(stategraph::compile::empty_allow_list))]
    EmptyAllowList { from: String },

    /// An attempt to re-bind a reserved channel.
    #[error("channel '{channel}' is reserved and cannot be re-bound")]
    #[diagnostic(
        code(stategraph::compile::reserved_channel),
        help("the errors channel is always bound to the append reducer")
    )]
    ReservedChannel { channel: String },
}

impl super::builder::GraphBuilder {
    /// Compiles the graph into an executable [`Plan`].
    ///
    /// Validates the declared topology:
    ///
    /// - at least one edge leaves `Start`
    /// - no node name is registered twice
    /// - every edge target, allow-list entry, and error handler names a
    ///   declared node or `End`
    /// - every conditional edge has a non-empty allow-list
    /// - every declared node is reachable from `Start` through some
    ///   combination of static edges, allow-lists, and error edges
    /// - the reserved `errors` channel keeps its append binding
    ///
    /// # Errors
    ///
    /// Returns the first [`CompileError`] found, in a deterministic order.
    pub fn compile(self) -> Result<Plan, CompileError> {
        if let Some(dup) = self.duplicate_nodes.first() {
            return Err(CompileError::DuplicateNode {
                name: dup.to_string(),
            });
        }
        if self.reserved_rebind {
            return Err(CompileError::ReservedChannel {
                channel: ERRORS_CHANNEL.to_string(),
            });
        }

        let has_static_entry = self
            .edges
            .get(&NodeId::Start)
            .is_some_and(|targets| !targets.is_empty());
        let has_conditional_entry = self
            .conditional_edges
            .iter()
            .any(|edge| edge.from().is_start());
        if !has_static_entry && !has_conditional_entry {
            return Err(CompileError::MissingEntry);
        }

        let valid_target = |id: &NodeId| id.is_end() || self.nodes.contains_key(id);

        let mut static_edges: Vec<(&NodeId, &NodeId)> = self
            .edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from, to)))
            .collect();
        static_edges.sort_by(|a, b| (a.0.encode(), a.1.encode()).cmp(&(b.0.encode(), b.1.encode())));
        for (from, to) in &static_edges {
            if !valid_target(to) {
                return Err(CompileError::UndeclaredTarget {
                    from: from.to_string(),
                    target: to.to_string(),
                });
            }
        }

        for edge in &self.conditional_edges {
            if edge.allow().is_empty() {
                return Err(CompileError::EmptyAllowList {
                    from: edge.from().to_string(),
                });
            }
            for target in edge.allow() {
                if !valid_target(target) {
                    return Err(CompileError::UndeclaredTarget {
                        from: edge.from().to_string(),
                        target: target.to_string(),
                    });
                }
            }
        }

        let mut error_edges: Vec<(&NodeId, &NodeId)> = self.error_edges.iter().collect();
        error_edges.sort_by(|a, b| a.0.encode().cmp(&b.0.encode()));
        for (from, handler) in &error_edges {
            if !valid_target(handler) {
                return Err(CompileError::UndeclaredTarget {
                    from: from.to_string(),
                    target: handler.to_string(),
                });
            }
        }

        // Reachability over every way control can flow: static edges,
        // conditional allow-lists, and error edges.
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        seen.insert(NodeId::Start);
        queue.push_back(NodeId::Start);
        while let Some(current) = queue.pop_front() {
            let mut successors: Vec<NodeId> = Vec::new();
            if let Some(targets) = self.edges.get(&current) {
                successors.extend(targets.iter().cloned());
            }
            for edge in &self.conditional_edges {
                if edge.from() == &current {
                    successors.extend(edge.allow().iter().cloned());
                }
            }
            if let Some(handler) = self.error_edges.get(&current) {
                successors.push(handler.clone());
            }
            for next in successors {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        let mut unreachable: Vec<&NodeId> = self
            .nodes
            .keys()
            .filter(|id| !seen.contains(id))
            .collect();
        unreachable.sort_by_key(|id| id.encode());
        if let Some(dead) = unreachable.first() {
            return Err(CompileError::DeadNode {
                name: dead.to_string(),
            });
        }

        Ok(Plan::from_builder(self))
    }
}
