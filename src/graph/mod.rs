//! Graph model: node definitions, edges, typed handles, the builder, and
//! the frozen [`PipelineGraph`] produced by a successful build.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod builder;
pub mod edge;
pub mod handle;
pub mod node;

pub use edge::{Edge, InputPort, MergeStrategy};
pub use handle::{
    AggregateHandle, BranchHandle, Inputs, JoinHandle, Outputs, SinkHandle, SourceHandle,
    StreamTransformHandle, TapHandle, TransformHandle,
};
pub use node::{Cardinality, NodeDefinition, NodeId, NodeKind, TypeTag};

/// Why an edge cannot be added between two nodes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The producer's output type is not assignable to the consumer's input
    #[error("output type {produced} of '{from}' does not match input type {expected} of '{to}'")]
    TypeMismatch {
        /// Producing node
        from: NodeId,
        /// Consuming node
        to: NodeId,
        /// Type the producer emits
        produced: &'static str,
        /// Type the consumer expects
        expected: &'static str,
    },

    /// One of the handles does not belong to this builder
    #[error("node '{0}' is not present in the graph")]
    UnknownNode(NodeId),

    /// Adding the edge would create a cycle
    #[error("edge '{from}' -> '{to}' would create a cycle")]
    WouldCycle {
        /// Producing node
        from: NodeId,
        /// Consuming node
        to: NodeId,
    },

    /// The edge already exists
    #[error("edge '{from}' -> '{to}' already exists")]
    DuplicateEdge {
        /// Producing node
        from: NodeId,
        /// Consuming node
        to: NodeId,
    },

    /// Both endpoints are the same node
    #[error("node '{0}' cannot be connected to itself")]
    SelfEdge(NodeId),

    /// The node has no input to connect into
    #[error("node '{0}' does not accept an input")]
    NoInput(NodeId),

    /// The node has no output to connect from
    #[error("node '{0}' does not produce an output")]
    NoOutput(NodeId),
}

struct GraphInner {
    name: String,
    nodes: Vec<NodeDefinition>,
    by_id: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    structural_hash: String,
}

/// A frozen pipeline graph.
///
/// Produced by [`builder::PipelineBuilder::build`]; immutable by
/// construction and cheap to clone. The structural hash identifies the
/// graph's shape for plan caching: it covers sorted node identities,
/// kinds, element type tags, per-node strategy tags, and sorted edges,
/// but not insertion order.
#[derive(Clone)]
pub struct PipelineGraph {
    inner: Arc<GraphInner>,
}

impl PipelineGraph {
    pub(crate) fn assemble(name: String, nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        let by_id = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let structural_hash = compute_structural_hash(&nodes, &edges);
        Self {
            inner: Arc::new(GraphInner {
                name,
                nodes,
                by_id,
                edges,
                structural_hash,
            }),
        }
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// All node definitions, in insertion order.
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.inner.nodes
    }

    /// All edges, in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.inner.edges
    }

    /// Look up a node definition by id.
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.inner.by_id.get(id).map(|&i| &self.inner.nodes[i])
    }

    /// Edges delivering into `id`, in declared order.
    pub fn inbound(&self, id: &NodeId) -> Vec<&Edge> {
        self.inner.edges.iter().filter(|e| &e.to == id).collect()
    }

    /// Edges leaving `id`, in declared order.
    pub fn outbound(&self, id: &NodeId) -> Vec<&Edge> {
        self.inner.edges.iter().filter(|e| &e.from == id).collect()
    }

    /// All source nodes.
    pub fn sources(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.inner
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Source)
    }

    /// All sink nodes.
    pub fn sinks(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.inner.nodes.iter().filter(|n| n.kind == NodeKind::Sink)
    }

    /// The structural hash, hex-encoded.
    pub fn structural_hash(&self) -> &str {
        &self.inner.structural_hash
    }

    /// A deterministic, human-readable topology listing.
    ///
    /// Output is sorted by node id and edge endpoints, so two builds of
    /// the same graph describe identically regardless of insertion order.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "pipeline '{}' ({} nodes, {} edges, hash {})\n",
            self.inner.name,
            self.inner.nodes.len(),
            self.inner.edges.len(),
            &self.inner.structural_hash[..12.min(self.inner.structural_hash.len())],
        );
        let mut nodes: Vec<&NodeDefinition> = self.inner.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for n in nodes {
            let io = match (&n.left_input, &n.right_input) {
                (Some(l), Some(r)) => format!(
                    "({} | {}) -> {}",
                    l,
                    r,
                    n.output.map(|t| t.name).unwrap_or("?")
                ),
                _ => match (&n.input, &n.output) {
                    (Some(i), Some(o)) => format!("{} -> {}", i, o),
                    (None, Some(o)) => format!("-> {}", o),
                    (Some(i), None) => format!("{} ->", i),
                    (None, None) => String::from("-"),
                },
            };
            out.push_str(&format!(
                "  [{}] {} '{}' ({}) strategy={}\n",
                n.kind.label(),
                n.id,
                n.name,
                io,
                n.strategy.hash_tag(),
            ));
        }
        let mut edges: Vec<&Edge> = self.inner.edges.iter().collect();
        edges.sort_by(|a, b| (&a.from, &a.to, a.port).cmp(&(&b.from, &b.to, b.port)));
        for e in edges {
            out.push_str(&format!("  {}\n", e));
        }
        out
    }

    /// Render the topology as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        let mut nodes: Vec<&NodeDefinition> = self.inner.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for n in nodes {
            out.push_str(&format!(
                "    {}[\"{} ({})\"]\n",
                mermaid_id(&n.id),
                n.name,
                n.kind.label()
            ));
        }
        let mut edges: Vec<&Edge> = self.inner.edges.iter().collect();
        edges.sort_by(|a, b| (&a.from, &a.to, a.port).cmp(&(&b.from, &b.to, b.port)));
        for e in edges {
            match e.port {
                InputPort::Main => out.push_str(&format!(
                    "    {} --> {}\n",
                    mermaid_id(&e.from),
                    mermaid_id(&e.to)
                )),
                port => out.push_str(&format!(
                    "    {} -->|{}| {}\n",
                    mermaid_id(&e.from),
                    port.label(),
                    mermaid_id(&e.to)
                )),
            }
        }
        out
    }

    /// Serialize the topology as pretty-printed JSON.
    ///
    /// Nodes and edges are sorted the same way as [`describe`]
    /// (`Self::describe`), so the export is deterministic for a given
    /// graph.
    pub fn to_json(&self) -> crate::Result<String> {
        let mut nodes: Vec<&NodeDefinition> = self.inner.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let nodes = nodes
            .into_iter()
            .map(|n| NodeExport {
                id: &n.id,
                name: &n.name,
                node_type: n.node_type,
                kind: n.kind,
                cardinality: n.cardinality,
                input: n.input.map(|t| t.name),
                output: n.output.map(|t| t.name),
                left_input: n.left_input.map(|t| t.name),
                right_input: n.right_input.map(|t| t.name),
                strategy: n.strategy.hash_tag(),
                merge: n.merge,
            })
            .collect();
        let mut edges: Vec<&Edge> = self.inner.edges.iter().collect();
        edges.sort_by(|a, b| (&a.from, &a.to, a.port).cmp(&(&b.from, &b.to, b.port)));
        let export = GraphExport {
            name: &self.inner.name,
            structural_hash: &self.inner.structural_hash,
            nodes,
            edges,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

/// Serializable topology snapshot behind [`PipelineGraph::to_json`].
#[derive(Debug, Serialize)]
struct GraphExport<'a> {
    name: &'a str,
    structural_hash: &'a str,
    nodes: Vec<NodeExport<'a>>,
    edges: Vec<&'a Edge>,
}

#[derive(Debug, Serialize)]
struct NodeExport<'a> {
    id: &'a NodeId,
    name: &'a str,
    node_type: &'a str,
    kind: NodeKind,
    cardinality: Cardinality,
    input: Option<&'a str>,
    output: Option<&'a str>,
    left_input: Option<&'a str>,
    right_input: Option<&'a str>,
    strategy: String,
    merge: MergeStrategy,
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("name", &self.inner.name)
            .field("nodes", &self.inner.nodes.len())
            .field("edges", &self.inner.edges.len())
            .field("hash", &self.inner.structural_hash)
            .finish()
    }
}

fn mermaid_id(id: &NodeId) -> String {
    id.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn compute_structural_hash(nodes: &[NodeDefinition], edges: &[Edge]) -> String {
    let mut hasher = Sha256::new();
    let mut ids: Vec<&NodeDefinition> = nodes.iter().collect();
    ids.sort_by(|a, b| a.id.cmp(&b.id));
    for n in ids {
        hasher.update(n.id.as_str().as_bytes());
        hasher.update(n.kind.label().as_bytes());
        if let Some(t) = &n.input {
            hasher.update(t.name.as_bytes());
        }
        if let Some(t) = &n.output {
            hasher.update(t.name.as_bytes());
        }
        if let Some(t) = &n.left_input {
            hasher.update(t.name.as_bytes());
        }
        if let Some(t) = &n.right_input {
            hasher.update(t.name.as_bytes());
        }
        hasher.update(n.strategy.hash_tag().as_bytes());
        hasher.update(n.merge.label().as_bytes());
        hasher.update([0u8]);
    }
    let mut sorted_edges: Vec<&Edge> = edges.iter().collect();
    sorted_edges.sort_by(|a, b| (&a.from, &a.to, a.port).cmp(&(&b.from, &b.to, b.port)));
    for e in sorted_edges {
        hasher.update(e.from.as_str().as_bytes());
        hasher.update(b"->");
        hasher.update(e.to.as_str().as_bytes());
        hasher.update(e.port.label().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Cardinality;
    use proptest::prelude::*;

    fn def(id: &str, kind: NodeKind) -> NodeDefinition {
        NodeDefinition::new(
            NodeId::new(id),
            id.to_string(),
            "test",
            kind,
            Cardinality::OneToOne,
        )
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let a = vec![def("a", NodeKind::Source), def("b", NodeKind::Sink)];
        let b = vec![def("b", NodeKind::Sink), def("a", NodeKind::Source)];
        let edges = vec![Edge::new(NodeId::new("a"), NodeId::new("b"))];
        assert_eq!(
            compute_structural_hash(&a, &edges),
            compute_structural_hash(&b, &edges)
        );
    }

    #[test]
    fn hash_depends_on_edges() {
        let nodes = vec![def("a", NodeKind::Source), def("b", NodeKind::Sink)];
        let connected = vec![Edge::new(NodeId::new("a"), NodeId::new("b"))];
        assert_ne!(
            compute_structural_hash(&nodes, &connected),
            compute_structural_hash(&nodes, &[])
        );
    }

    proptest! {
        #[test]
        fn hash_ignores_node_and_edge_insertion_order(
            node_order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
            edge_order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let make = |i: usize| {
                let kind = match i {
                    0 => NodeKind::Source,
                    5 => NodeKind::Sink,
                    _ => NodeKind::Transform,
                };
                def(&format!("node-{i}"), kind)
            };
            let baseline_nodes: Vec<NodeDefinition> = (0..6).map(make).collect();
            let baseline_edges: Vec<Edge> = (0..5)
                .map(|i| Edge::new(NodeId::new(format!("node-{i}")), NodeId::new(format!("node-{}", i + 1))))
                .collect();
            let shuffled_nodes: Vec<NodeDefinition> =
                node_order.iter().map(|&i| make(i)).collect();
            let shuffled_edges: Vec<Edge> =
                edge_order.iter().map(|&i| baseline_edges[i].clone()).collect();
            prop_assert_eq!(
                compute_structural_hash(&baseline_nodes, &baseline_edges),
                compute_structural_hash(&shuffled_nodes, &shuffled_edges)
            );
        }
    }

    #[test]
    fn describe_is_deterministic() {
        let graph = PipelineGraph::assemble(
            "demo".into(),
            vec![def("b", NodeKind::Sink), def("a", NodeKind::Source)],
            vec![Edge::new(NodeId::new("a"), NodeId::new("b"))],
        );
        let one = graph.describe();
        let two = graph.describe();
        assert_eq!(one, two);
        assert!(one.contains("[source] a"));
        assert!(one.contains("a -> b"));
    }

    #[test]
    fn json_export_is_deterministic_and_parseable() {
        let graph = PipelineGraph::assemble(
            "demo".into(),
            vec![def("b", NodeKind::Sink), def("a", NodeKind::Source)],
            vec![Edge::new(NodeId::new("a"), NodeId::new("b"))],
        );
        let json = graph.to_json().unwrap();
        assert_eq!(json, graph.to_json().unwrap());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "demo");
        assert_eq!(value["structural_hash"], graph.structural_hash());
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        // Sorted by id regardless of insertion order.
        assert_eq!(nodes[0]["id"], "a");
        assert_eq!(nodes[0]["kind"], "Source");
        assert_eq!(value["edges"][0]["from"], "a");
        assert_eq!(value["edges"][0]["to"], "b");
    }
}
