//! Node definitions and the type tags attached to them.

use std::any::TypeId;

use serde::{Deserialize, Serialize};

use crate::exec::strategy::ExecutionStrategy;
use crate::graph::edge::MergeStrategy;

/// Unique identifier of a node within a graph.
///
/// Ids are assigned deterministically by the builder (`<kind>-<seq>`) when
/// the caller does not provide one, so re-building the same definition
/// yields the same ids and therefore the same structural hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create an id from an explicit string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Produces items without an upstream
    Source,
    /// Maps one item to one item
    Transform,
    /// Rewrites a whole stream
    StreamTransform,
    /// Terminates a stream
    Sink,
    /// Combines two keyed streams
    Join,
    /// Folds items into event-time windows
    Aggregate,
    /// Observes items without altering them
    Tap,
    /// Duplicates items to several downstream edges
    Branch,
}

impl NodeKind {
    /// Lowercase label used in ids, describe output, and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::StreamTransform => "stream-transform",
            NodeKind::Sink => "sink",
            NodeKind::Join => "join",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Tap => "tap",
            NodeKind::Branch => "branch",
        }
    }

    /// Whether the kind accepts more than one inbound edge.
    pub fn accepts_multiple_inputs(&self) -> bool {
        matches!(self, NodeKind::Join | NodeKind::Aggregate)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A runtime tag for an element type: identity for compatibility checks,
/// name for hashing and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTag {
    /// Type identity, used for edge compatibility checks
    pub id: TypeId,
    /// Human-readable type name, used in the structural hash and messages
    pub name: &'static str,
}

impl TypeTag {
    /// The tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Declared item cardinality of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// One input item produces one output item
    OneToOne,
    /// One input item may produce several output items
    OneToMany,
    /// Several input items fold into one output item
    ManyToOne,
}

/// Immutable description of a node within a pipeline graph.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    /// Unique id within the graph
    pub id: NodeId,
    /// Display name, unique within the graph
    pub name: String,
    /// Implementation tag (the node type's name)
    pub node_type: &'static str,
    /// Structural role
    pub kind: NodeKind,
    /// Element type consumed, if any
    pub input: Option<TypeTag>,
    /// Element type produced, if any
    pub output: Option<TypeTag>,
    /// Left-side element type, join nodes only
    pub left_input: Option<TypeTag>,
    /// Right-side element type, join nodes only
    pub right_input: Option<TypeTag>,
    /// Execution strategy selected for the node
    pub strategy: ExecutionStrategy,
    /// Tag of the node-level error handler, when one is registered
    pub error_handler: Option<String>,
    /// Declared cardinality
    pub cardinality: Cardinality,
    /// Merge strategy for multi-inbound nodes
    pub merge: MergeStrategy,
    /// Reserved lineage tag for input adapters
    pub adapter_tag: Option<String>,
    /// Reserved lineage tag for item mappers
    pub mapper_tag: Option<String>,
}

impl NodeDefinition {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        node_type: &'static str,
        kind: NodeKind,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            id,
            name,
            node_type,
            kind,
            input: None,
            output: None,
            left_input: None,
            right_input: None,
            strategy: ExecutionStrategy::Sequential,
            error_handler: None,
            cardinality,
            merge: MergeStrategy::Interleave,
            adapter_tag: None,
            mapper_tag: None,
        }
    }

    /// Whether this node may fan in (multiple inbound edges).
    pub fn is_join(&self) -> bool {
        self.kind.accepts_multiple_inputs()
    }
}
