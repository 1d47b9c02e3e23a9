//! Edges and merge strategies.

use serde::{Deserialize, Serialize};

use crate::graph::node::NodeId;

/// The input port an edge delivers into.
///
/// Join nodes expose two ports; every other kind has a single main port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputPort {
    /// The only port of non-join nodes
    Main,
    /// The left side of a join
    JoinLeft,
    /// The right side of a join
    JoinRight,
}

impl InputPort {
    /// Short label for describe output and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            InputPort::Main => "",
            InputPort::JoinLeft => "left",
            InputPort::JoinRight => "right",
        }
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producing node
    pub from: NodeId,
    /// Consuming node
    pub to: NodeId,
    /// Port on the consuming node
    pub port: InputPort,
}

impl Edge {
    /// An edge into a node's main port.
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            port: InputPort::Main,
        }
    }

    /// An edge into a specific port.
    pub fn into_port(from: NodeId, to: NodeId, port: InputPort) -> Self {
        Self { from, to, port }
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            InputPort::Main => write!(f, "{} -> {}", self.from, self.to),
            port => write!(f, "{} -> {} ({})", self.from, self.to, port.label()),
        }
    }
}

/// How a multi-inbound node combines its input streams before its apply
/// operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Drain each input fully, in declared edge order
    Concat,
    /// Round-robin one item at a time across inputs
    Interleave,
    /// A user-provided merge delegate registered on the builder
    Custom,
}

impl MergeStrategy {
    /// Label used in the structural hash and describe output.
    pub fn label(&self) -> &'static str {
        match self {
            MergeStrategy::Concat => "concat",
            MergeStrategy::Interleave => "interleave",
            MergeStrategy::Custom => "custom",
        }
    }
}
