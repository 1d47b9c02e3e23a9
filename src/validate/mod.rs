//! Graph validation: a core rule set whose findings are errors, and an
//! extended rule set (on by default, opt-out) whose findings are
//! warnings. `strict` mode promotes self-loops and duplicate edges to
//! errors for production graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::DiGraph;
use serde::Serialize;

use crate::exec::retry::RetryOptions;
use crate::graph::{Edge, InputPort, NodeDefinition, NodeId, NodeKind};

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The graph cannot run
    Error,
    /// The graph runs but the configuration is suspicious
    Warning,
}

/// What a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Category {
    /// Node or edge structure
    Structure,
    /// Name or id collisions
    Naming,
    /// Edge element-type compatibility
    Types,
    /// Nodes unreachable from any source
    Reachability,
    /// Cycles
    Cycle,
    /// Resilient-strategy prerequisites
    Resilience,
    /// Parallel-strategy configuration sanity
    Parallelism,
    /// Fan-out outside branch nodes
    FanOut,
    /// Retry or strategy configuration validity
    Configuration,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Severity of the finding
    pub severity: Severity,
    /// What the finding is about
    pub category: Category,
    /// The node involved, when the finding is node-scoped
    pub node: Option<NodeId>,
    /// The edge involved, when the finding is edge-scoped
    pub edge: Option<(NodeId, NodeId)>,
    /// Human-readable description
    pub message: String,
}

impl Diagnostic {
    fn error(category: Category, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            node: None,
            edge: None,
            message: message.into(),
        }
    }

    fn warning(category: Category, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            node: None,
            edge: None,
            message: message.into(),
        }
    }

    fn on_node(mut self, node: &NodeId) -> Self {
        self.node = Some(node.clone());
        self
    }

    fn on_edge(mut self, edge: &Edge) -> Self {
        self.edge = Some((edge.from.clone(), edge.to.clone()));
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {:?}: {}",
            match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            },
            self.category,
            self.message
        )
    }
}

/// The error-severity findings that failed a build.
#[derive(Debug)]
pub struct ValidationFailure(pub Vec<Diagnostic>);

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error(s)", self.0.len())?;
        for diagnostic in &self.0 {
            write!(f, "; {}", diagnostic)?;
        }
        Ok(())
    }
}

/// Which rule sets run and how severe their findings are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Run the extended (warning) rules; on by default
    pub extended: bool,
    /// Promote self-loops and duplicate edges to errors
    pub strict: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            extended: true,
            strict: false,
        }
    }
}

pub(crate) struct GraphView<'a> {
    pub nodes: &'a [NodeDefinition],
    pub edges: &'a [Edge],
}

pub(crate) struct ValidationEnv {
    pub has_pipeline_error_handler: bool,
    pub pipeline_retry: RetryOptions,
    pub node_retry: HashMap<NodeId, RetryOptions>,
}

impl ValidationEnv {
    fn retry_for(&self, node: &NodeId) -> &RetryOptions {
        self.node_retry.get(node).unwrap_or(&self.pipeline_retry)
    }
}

/// Run the configured rule sets over a graph view.
pub(crate) fn run_rules(
    view: &GraphView<'_>,
    env: &ValidationEnv,
    options: ValidationOptions,
) -> Vec<Diagnostic> {
    let mut findings = Vec::new();
    unique_names(view, &mut findings);
    unique_ids(view, &mut findings);
    edges_reference_nodes(view, &mut findings);
    sources_and_reachability(view, &mut findings);
    acyclic(view, &mut findings);
    edge_type_compatibility(view, &mut findings);
    retry_configuration(view, env, &mut findings);
    if options.extended {
        let promote = options.strict;
        sink_present(view, &mut findings);
        self_loops(view, promote, &mut findings);
        duplicate_edges(view, promote, &mut findings);
        single_inbound(view, &mut findings);
        resilience_prerequisites(view, env, &mut findings);
        parallel_sanity(view, &mut findings);
        fan_out(view, &mut findings);
    }
    findings
}

fn unique_names(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let mut seen: HashMap<&str, &NodeId> = HashMap::new();
    for node in view.nodes {
        if let Some(first) = seen.insert(node.name.as_str(), &node.id) {
            findings.push(
                Diagnostic::error(
                    Category::Naming,
                    format!(
                        "node name '{}' is used by both '{}' and '{}'",
                        node.name, first, node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn unique_ids(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let mut seen: HashSet<&NodeId> = HashSet::new();
    for node in view.nodes {
        if !seen.insert(&node.id) {
            findings.push(
                Diagnostic::error(
                    Category::Naming,
                    format!("node id '{}' is not unique", node.id),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn edges_reference_nodes(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let ids: HashSet<&NodeId> = view.nodes.iter().map(|n| &n.id).collect();
    for edge in view.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint) {
                findings.push(
                    Diagnostic::error(
                        Category::Structure,
                        format!("edge {} references unknown node '{}'", edge, endpoint),
                    )
                    .on_edge(edge),
                );
            }
        }
    }
}

fn sources_and_reachability(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let sources: Vec<&NodeId> = view
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Source)
        .map(|n| &n.id)
        .collect();
    if sources.is_empty() {
        findings.push(Diagnostic::error(
            Category::Structure,
            "graph has no source node",
        ));
        return;
    }
    let mut reachable: HashSet<&NodeId> = sources.iter().copied().collect();
    let mut queue: VecDeque<&NodeId> = sources.into_iter().collect();
    while let Some(current) = queue.pop_front() {
        for edge in view.edges.iter().filter(|e| &e.from == current) {
            if reachable.insert(&edge.to) {
                queue.push_back(&edge.to);
            }
        }
    }
    for node in view.nodes {
        if !reachable.contains(&node.id) {
            findings.push(
                Diagnostic::error(
                    Category::Reachability,
                    format!("node '{}' is not reachable from any source", node.id),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn acyclic(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let mut indices = HashMap::new();
    for node in view.nodes {
        indices.insert(&node.id, graph.add_node(()));
    }
    for edge in view.edges {
        if let (Some(&from), Some(&to)) = (indices.get(&edge.from), indices.get(&edge.to)) {
            graph.add_edge(from, to, ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&graph) {
        findings.push(Diagnostic::error(
            Category::Cycle,
            "graph contains a cycle",
        ));
    }
}

fn edge_type_compatibility(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let by_id: HashMap<&NodeId, &NodeDefinition> = view.nodes.iter().map(|n| (&n.id, n)).collect();
    for edge in view.edges {
        let (Some(from), Some(to)) = (by_id.get(&edge.from), by_id.get(&edge.to)) else {
            continue;
        };
        let Some(produced) = from.output else {
            findings.push(
                Diagnostic::error(
                    Category::Types,
                    format!("node '{}' produces no output but has edge {}", from.id, edge),
                )
                .on_edge(edge),
            );
            continue;
        };
        let expected = match edge.port {
            InputPort::Main => to.input,
            InputPort::JoinLeft => to.left_input,
            InputPort::JoinRight => to.right_input,
        };
        let Some(expected) = expected else {
            findings.push(
                Diagnostic::error(
                    Category::Types,
                    format!("node '{}' accepts no input on edge {}", to.id, edge),
                )
                .on_edge(edge),
            );
            continue;
        };
        if produced.id != expected.id {
            findings.push(
                Diagnostic::error(
                    Category::Types,
                    format!(
                        "edge {}: output type {} is not assignable to input type {}",
                        edge, produced, expected
                    ),
                )
                .on_edge(edge),
            );
        }
    }
}

fn retry_configuration(view: &GraphView<'_>, env: &ValidationEnv, findings: &mut Vec<Diagnostic>) {
    if let Err(e) = env.pipeline_retry.validate() {
        findings.push(Diagnostic::error(
            Category::Configuration,
            format!("pipeline retry options invalid: {}", e),
        ));
    }
    for node in view.nodes {
        if let Some(options) = env.node_retry.get(&node.id) {
            if let Err(e) = options.validate() {
                findings.push(
                    Diagnostic::error(
                        Category::Configuration,
                        format!("retry options for node '{}' invalid: {}", node.id, e),
                    )
                    .on_node(&node.id),
                );
            }
        }
    }
}

fn sink_present(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    if !view.nodes.iter().any(|n| n.kind == NodeKind::Sink) {
        findings.push(Diagnostic::warning(
            Category::Structure,
            "graph has no sink node; nothing will pull items",
        ));
    }
}

fn self_loops(view: &GraphView<'_>, promote: bool, findings: &mut Vec<Diagnostic>) {
    for edge in view.edges {
        if edge.from == edge.to {
            let diagnostic = Diagnostic {
                severity: if promote {
                    Severity::Error
                } else {
                    Severity::Warning
                },
                category: Category::Structure,
                node: Some(edge.from.clone()),
                edge: Some((edge.from.clone(), edge.to.clone())),
                message: format!("node '{}' has a self-loop", edge.from),
            };
            findings.push(diagnostic);
        }
    }
}

fn duplicate_edges(view: &GraphView<'_>, promote: bool, findings: &mut Vec<Diagnostic>) {
    let mut seen: HashSet<(&NodeId, &NodeId, InputPort)> = HashSet::new();
    for edge in view.edges {
        if !seen.insert((&edge.from, &edge.to, edge.port)) {
            let diagnostic = Diagnostic {
                severity: if promote {
                    Severity::Error
                } else {
                    Severity::Warning
                },
                category: Category::Structure,
                node: None,
                edge: Some((edge.from.clone(), edge.to.clone())),
                message: format!("edge {} is duplicated", edge),
            };
            findings.push(diagnostic);
        }
    }
}

fn single_inbound(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    for node in view.nodes {
        if node.kind.accepts_multiple_inputs() {
            continue;
        }
        let inbound = view.edges.iter().filter(|e| e.to == node.id).count();
        if inbound > 1 {
            findings.push(
                Diagnostic::warning(
                    Category::Structure,
                    format!(
                        "{} node '{}' has {} inbound edges; only join and aggregate nodes merge inputs",
                        node.kind, node.id, inbound
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn resilience_prerequisites(
    view: &GraphView<'_>,
    env: &ValidationEnv,
    findings: &mut Vec<Diagnostic>,
) {
    for node in view.nodes {
        if !node.strategy.is_resilient() {
            continue;
        }
        let retry = env.retry_for(&node.id);
        if !env.has_pipeline_error_handler {
            findings.push(
                Diagnostic::warning(
                    Category::Resilience,
                    format!(
                        "node '{}' uses the resilient strategy but no pipeline error handler is registered",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
        if retry.max_node_restart_attempts == 0 {
            findings.push(
                Diagnostic::warning(
                    Category::Resilience,
                    format!(
                        "node '{}' uses the resilient strategy with max_node_restart_attempts = 0",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
        if !matches!(retry.max_materialized_items, Some(n) if n > 0) {
            findings.push(
                Diagnostic::warning(
                    Category::Resilience,
                    format!(
                        "node '{}' uses the resilient strategy without a positive max_materialized_items",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn parallel_sanity(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    let cores = num_cpus::get();
    for node in view.nodes {
        let Some(cfg) = node.strategy.parallel_config() else {
            continue;
        };
        if cfg.degree > 4 && cfg.queue_capacity.is_none() {
            findings.push(
                Diagnostic::warning(
                    Category::Parallelism,
                    format!(
                        "node '{}': parallel degree {} requires a finite queue bound",
                        node.id, cfg.degree
                    ),
                )
                .on_node(&node.id),
            );
        }
        if cfg.policy != crate::exec::strategy::QueuePolicy::Block && cfg.queue_capacity.is_none() {
            findings.push(
                Diagnostic::warning(
                    Category::Parallelism,
                    format!(
                        "node '{}': the {} policy requires a finite queue bound",
                        node.id,
                        cfg.policy.label()
                    ),
                )
                .on_node(&node.id),
            );
        }
        if cfg.degree > 8 && cfg.preserve_ordering {
            findings.push(
                Diagnostic::warning(
                    Category::Parallelism,
                    format!(
                        "node '{}': ordering preservation with degree {} buffers heavily",
                        node.id, cfg.degree
                    ),
                )
                .on_node(&node.id),
            );
        }
        if cfg.degree > cores.saturating_mul(4) {
            findings.push(
                Diagnostic::warning(
                    Category::Parallelism,
                    format!(
                        "node '{}': degree {} exceeds 4x the {} available cores",
                        node.id, cfg.degree, cores
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn fan_out(view: &GraphView<'_>, findings: &mut Vec<Diagnostic>) {
    for node in view.nodes {
        if node.kind == NodeKind::Branch {
            continue;
        }
        let outbound = view.edges.iter().filter(|e| e.from == node.id).count();
        if outbound > 1 {
            findings.push(
                Diagnostic::warning(
                    Category::FanOut,
                    format!(
                        "{} node '{}' has {} outbound edges; pipes are single-consumer, use a branch node",
                        node.kind, node.id, outbound
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

pub(crate) fn errors(findings: &[Diagnostic]) -> Vec<Diagnostic> {
    findings
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .cloned()
        .collect()
}
