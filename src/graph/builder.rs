//! The pipeline builder: typed node registration, connection, per-node
//! configuration, validation, and the freeze into a [`PipelineGraph`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{erase_node_error_handler, NodeErrorHandler, PipelineErrorHandler};
use crate::error::DeadLetterSink;
use crate::exec::merge::MergeFn;
use crate::exec::retry::RetryOptions;
use crate::exec::strategy::{BatchConfig, ExecutionStrategy, ParallelConfig};
use crate::graph::edge::{Edge, InputPort, MergeStrategy};
use crate::graph::handle::{
    AggregateHandle, BranchHandle, Inputs, JoinHandle, Outputs, SinkHandle, SourceHandle,
    StreamTransformHandle, TapHandle, TransformHandle,
};
use crate::graph::node::{Cardinality, NodeDefinition, NodeId, NodeKind, TypeTag};
use crate::graph::{ConnectError, PipelineGraph};
use crate::join::JoinNode;
use crate::plan::node::{SinkNode, SourceNode, StreamTransformNode, TapNode, TransformNode};
use crate::plan::{DynPipe, ErasedNode};
use crate::validate::{self, Diagnostic, ValidationEnv, ValidationOptions};
use crate::window::AggregateNode;
use crate::{PipelineError, Result};

/// How a node instance is obtained at run start.
pub(crate) enum NodeConstructor {
    /// Create a fresh instance per compilation
    Factory(Arc<dyn Fn() -> ErasedNode + Send + Sync>),
    /// Use the caller-supplied instance; disables plan caching
    Preconfigured(ErasedNode),
}

/// Everything the runner needs beyond the frozen graph: constructors,
/// handlers, merge delegates, and retry configuration.
pub(crate) struct NodeBindings {
    pub constructors: HashMap<NodeId, NodeConstructor>,
    pub custom_merges: HashMap<NodeId, MergeFn>,
    pub node_error_handlers:
        HashMap<NodeId, Arc<dyn crate::error::ErasedNodeErrorHandler>>,
    pub pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub retry: Option<RetryOptions>,
    pub node_retry: HashMap<NodeId, RetryOptions>,
    pub has_preconfigured: bool,
}

impl NodeBindings {
    pub(crate) fn instantiate(&self) -> HashMap<NodeId, ErasedNode> {
        self.constructors
            .iter()
            .map(|(id, ctor)| {
                let instance = match ctor {
                    NodeConstructor::Factory(factory) => factory(),
                    NodeConstructor::Preconfigured(instance) => instance.clone(),
                };
                (id.clone(), instance)
            })
            .collect()
    }
}

struct FnTap<T, F> {
    observer: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> TapNode for FnTap<T, F>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    type Item = T;

    fn observe(&self, item: &T, _ctx: &crate::exec::context::NodeExecutionContext) {
        (self.observer)(item)
    }
}

/// Builder for a pipeline graph.
///
/// `add_*` operations return typed handles; `connect` only compiles when
/// the producer's element type matches the consumer's. `build` validates,
/// freezes the node and edge sets, and computes the structural hash.
pub struct PipelineBuilder {
    name: String,
    nodes: Vec<NodeDefinition>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    kind_counters: HashMap<&'static str, usize>,
    constructors: HashMap<NodeId, NodeConstructor>,
    custom_merges: HashMap<NodeId, MergeFn>,
    node_error_handlers: HashMap<NodeId, Arc<dyn crate::error::ErasedNodeErrorHandler>>,
    pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    retry: Option<RetryOptions>,
    node_retry: HashMap<NodeId, RetryOptions>,
    validation: ValidationOptions,
    has_preconfigured: bool,
}

impl PipelineBuilder {
    /// A builder for a pipeline with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            kind_counters: HashMap::new(),
            constructors: HashMap::new(),
            custom_merges: HashMap::new(),
            node_error_handlers: HashMap::new(),
            pipeline_handler: None,
            dead_letter: None,
            retry: None,
            node_retry: HashMap::new(),
            validation: ValidationOptions::default(),
            has_preconfigured: false,
        }
    }

    fn next_id(&mut self, kind: NodeKind) -> NodeId {
        let counter = self.kind_counters.entry(kind.label()).or_insert(0);
        *counter += 1;
        NodeId::new(format!("{}-{}", kind.label(), counter))
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        name: String,
        node_type: &'static str,
        cardinality: Cardinality,
        ctor: NodeConstructor,
    ) -> NodeId {
        let id = self.next_id(kind);
        let def = NodeDefinition::new(id.clone(), name, node_type, kind, cardinality);
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(def);
        self.constructors.insert(id.clone(), ctor);
        id
    }

    fn def_mut(&mut self, id: &NodeId) -> Result<&mut NodeDefinition> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.nodes[idx]),
            None => Err(PipelineError::Graph(format!("unknown node '{}'", id))),
        }
    }

    fn def(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    // --- sources -----------------------------------------------------

    /// Add a source node constructed through `Default` at run start.
    pub fn add_source<S: SourceNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> SourceHandle<S::Output> {
        self.add_source_with(name, S::default)
    }

    /// Add a source node constructed through `factory` at run start.
    pub fn add_source_with<S: SourceNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> S + Send + Sync + 'static,
    ) -> SourceHandle<S::Output> {
        let id = self.push_node(
            NodeKind::Source,
            name.into(),
            std::any::type_name::<S>(),
            Cardinality::OneToMany,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::source(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].output = Some(TypeTag::of::<S::Output>());
        }
        SourceHandle::for_node(id)
    }

    /// Replace a source node's constructor with a ready instance.
    /// Preconfigured instances disable plan caching for the pipeline.
    pub fn preconfigure_source<S: SourceNode>(
        &mut self,
        handle: &SourceHandle<S::Output>,
        instance: S,
    ) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::source(instance)),
        );
        self.has_preconfigured = true;
    }

    // --- transforms --------------------------------------------------

    /// Add a 1-to-1 transform node constructed through `Default`.
    pub fn add_transform<T: TransformNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> TransformHandle<T::Input, T::Output> {
        self.add_transform_with(name, T::default)
    }

    /// Add a 1-to-1 transform node constructed through `factory`.
    pub fn add_transform_with<T: TransformNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> TransformHandle<T::Input, T::Output> {
        let id = self.push_node(
            NodeKind::Transform,
            name.into(),
            std::any::type_name::<T>(),
            Cardinality::OneToOne,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::transform(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<T::Input>());
            self.nodes[idx].output = Some(TypeTag::of::<T::Output>());
        }
        TransformHandle::for_node(id)
    }

    /// Replace a transform node's constructor with a ready instance.
    pub fn preconfigure_transform<T: TransformNode>(
        &mut self,
        handle: &TransformHandle<T::Input, T::Output>,
        instance: T,
    ) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::transform(instance)),
        );
        self.has_preconfigured = true;
    }

    /// Add a stream transform node constructed through `Default`.
    pub fn add_stream_transform<T: StreamTransformNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> StreamTransformHandle<T::Input, T::Output> {
        self.add_stream_transform_with(name, T::default)
    }

    /// Add a stream transform node constructed through `factory`.
    pub fn add_stream_transform_with<T: StreamTransformNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> StreamTransformHandle<T::Input, T::Output> {
        let id = self.push_node(
            NodeKind::StreamTransform,
            name.into(),
            std::any::type_name::<T>(),
            Cardinality::OneToMany,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::stream_transform(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<T::Input>());
            self.nodes[idx].output = Some(TypeTag::of::<T::Output>());
        }
        StreamTransformHandle::for_node(id)
    }

    /// Replace a stream transform node's constructor with a ready
    /// instance.
    pub fn preconfigure_stream_transform<T: StreamTransformNode>(
        &mut self,
        handle: &StreamTransformHandle<T::Input, T::Output>,
        instance: T,
    ) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::stream_transform(instance)),
        );
        self.has_preconfigured = true;
    }

    // --- sinks -------------------------------------------------------

    /// Add a sink node constructed through `Default`.
    pub fn add_sink<S: SinkNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> SinkHandle<S::Input> {
        self.add_sink_with(name, S::default)
    }

    /// Add a sink node constructed through `factory`.
    pub fn add_sink_with<S: SinkNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> S + Send + Sync + 'static,
    ) -> SinkHandle<S::Input> {
        let id = self.push_node(
            NodeKind::Sink,
            name.into(),
            std::any::type_name::<S>(),
            Cardinality::ManyToOne,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::sink(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<S::Input>());
        }
        SinkHandle::for_node(id)
    }

    /// Replace a sink node's constructor with a ready instance.
    pub fn preconfigure_sink<S: SinkNode>(&mut self, handle: &SinkHandle<S::Input>, instance: S) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::sink(instance)),
        );
        self.has_preconfigured = true;
    }

    // --- joins and aggregates ---------------------------------------

    /// Add a keyed join node constructed through `Default`.
    pub fn add_join<J: JoinNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> JoinHandle<J::Key, J::Left, J::Right, J::Output> {
        self.add_join_with(name, J::default)
    }

    /// Add a keyed join node constructed through `factory`.
    pub fn add_join_with<J: JoinNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> J + Send + Sync + 'static,
    ) -> JoinHandle<J::Key, J::Left, J::Right, J::Output> {
        let id = self.push_node(
            NodeKind::Join,
            name.into(),
            std::any::type_name::<J>(),
            Cardinality::ManyToOne,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::join(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].left_input = Some(TypeTag::of::<J::Left>());
            self.nodes[idx].right_input = Some(TypeTag::of::<J::Right>());
            self.nodes[idx].output = Some(TypeTag::of::<J::Output>());
        }
        JoinHandle::for_node(id)
    }

    /// Replace a join node's constructor with a ready instance.
    pub fn preconfigure_join<J: JoinNode>(
        &mut self,
        handle: &JoinHandle<J::Key, J::Left, J::Right, J::Output>,
        instance: J,
    ) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::join(instance)),
        );
        self.has_preconfigured = true;
    }

    /// Add a windowed aggregate node constructed through `Default`.
    pub fn add_aggregate<A: AggregateNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> AggregateHandle<A::Input, A::Output> {
        self.add_aggregate_with(name, A::default)
    }

    /// Add a windowed aggregate node constructed through `factory`.
    pub fn add_aggregate_with<A: AggregateNode>(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> A + Send + Sync + 'static,
    ) -> AggregateHandle<A::Input, A::Output> {
        let id = self.push_node(
            NodeKind::Aggregate,
            name.into(),
            std::any::type_name::<A>(),
            Cardinality::ManyToOne,
            NodeConstructor::Factory(Arc::new(move || ErasedNode::aggregate(factory()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<A::Input>());
            self.nodes[idx].output = Some(TypeTag::of::<A::Output>());
        }
        AggregateHandle::for_node(id)
    }

    /// Replace an aggregate node's constructor with a ready instance.
    pub fn preconfigure_aggregate<A: AggregateNode>(
        &mut self,
        handle: &AggregateHandle<A::Input, A::Output>,
        instance: A,
    ) {
        self.constructors.insert(
            handle.id().clone(),
            NodeConstructor::Preconfigured(ErasedNode::aggregate(instance)),
        );
        self.has_preconfigured = true;
    }

    // --- taps and branches ------------------------------------------

    /// Add a tap node constructed through `Default`.
    pub fn add_tap<T: TapNode + Default>(
        &mut self,
        name: impl Into<String>,
    ) -> TapHandle<T::Item> {
        let id = self.push_node(
            NodeKind::Tap,
            name.into(),
            std::any::type_name::<T>(),
            Cardinality::OneToOne,
            NodeConstructor::Factory(Arc::new(|| ErasedNode::tap(T::default()))),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<T::Item>());
            self.nodes[idx].output = Some(TypeTag::of::<T::Item>());
        }
        TapHandle::for_node(id)
    }

    /// Add a tap node observing items through a closure. The closure is a
    /// preconfigured instance, so it disables plan caching.
    pub fn add_tap_fn<T: Send + 'static>(
        &mut self,
        name: impl Into<String>,
        observer: impl Fn(&T) + Send + Sync + 'static,
    ) -> TapHandle<T> {
        let tap = FnTap {
            observer,
            _marker: PhantomData,
        };
        let id = self.push_node(
            NodeKind::Tap,
            name.into(),
            std::any::type_name::<T>(),
            Cardinality::OneToOne,
            NodeConstructor::Preconfigured(ErasedNode::tap(tap)),
        );
        self.has_preconfigured = true;
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<T>());
            self.nodes[idx].output = Some(TypeTag::of::<T>());
        }
        TapHandle::for_node(id)
    }

    /// Add a branch node duplicating its input to every outbound edge.
    pub fn add_branch<T: Clone + Send + 'static>(
        &mut self,
        name: impl Into<String>,
    ) -> BranchHandle<T> {
        let id = self.push_node(
            NodeKind::Branch,
            name.into(),
            std::any::type_name::<T>(),
            Cardinality::OneToMany,
            NodeConstructor::Factory(Arc::new(|| ErasedNode::branch::<T>())),
        );
        if let Some(&idx) = self.index.get(&id) {
            self.nodes[idx].input = Some(TypeTag::of::<T>());
            self.nodes[idx].output = Some(TypeTag::of::<T>());
        }
        BranchHandle::for_node(id)
    }

    // --- connections -------------------------------------------------

    /// Connect a producer of `T` to a consumer of `T`.
    pub fn connect<T, A, B>(&mut self, from: &A, to: &B) -> Result<()>
    where
        A: Outputs<T>,
        B: Inputs<T>,
    {
        let from = Outputs::node_id(from).clone();
        let to = Inputs::node_id(to).clone();
        self.try_add_edge(from, to, InputPort::Main)
    }

    /// Connect a producer of `L` to a join node's left side.
    pub fn connect_join_left<K, L, R, O>(
        &mut self,
        from: &impl Outputs<L>,
        join: &JoinHandle<K, L, R, O>,
    ) -> Result<()> {
        let from = Outputs::node_id(from).clone();
        self.try_add_edge(from, join.id().clone(), InputPort::JoinLeft)
    }

    /// Connect a producer of `R` to a join node's right side.
    pub fn connect_join_right<K, L, R, O>(
        &mut self,
        from: &impl Outputs<R>,
        join: &JoinHandle<K, L, R, O>,
    ) -> Result<()> {
        let from = Outputs::node_id(from).clone();
        self.try_add_edge(from, join.id().clone(), InputPort::JoinRight)
    }

    /// Connect two nodes by id, checking compatibility at run time.
    pub fn connect_ids(&mut self, from: &NodeId, to: &NodeId) -> Result<()> {
        let port = self.infer_port(to);
        self.try_add_edge(from.clone(), to.clone(), port)
    }

    fn infer_port(&self, to: &NodeId) -> InputPort {
        match self.def(to) {
            Some(def) if def.kind == NodeKind::Join => {
                let left_taken = self
                    .edges
                    .iter()
                    .any(|e| &e.to == to && e.port == InputPort::JoinLeft);
                if left_taken {
                    InputPort::JoinRight
                } else {
                    InputPort::JoinLeft
                }
            }
            _ => InputPort::Main,
        }
    }

    /// Whether an edge between two nodes would be valid, with the reason
    /// when it would not.
    pub fn can_connect(
        &self,
        from: &NodeId,
        to: &NodeId,
    ) -> std::result::Result<(), ConnectError> {
        self.check_edge(from, to, self.infer_port(to))
    }

    fn check_edge(
        &self,
        from: &NodeId,
        to: &NodeId,
        port: InputPort,
    ) -> std::result::Result<(), ConnectError> {
        let Some(from_def) = self.def(from) else {
            return Err(ConnectError::UnknownNode(from.clone()));
        };
        let Some(to_def) = self.def(to) else {
            return Err(ConnectError::UnknownNode(to.clone()));
        };
        if from == to {
            return Err(ConnectError::SelfEdge(from.clone()));
        }
        let Some(produced) = from_def.output else {
            return Err(ConnectError::NoOutput(from.clone()));
        };
        let expected = match port {
            InputPort::Main => to_def.input,
            InputPort::JoinLeft => to_def.left_input,
            InputPort::JoinRight => to_def.right_input,
        };
        let Some(expected) = expected else {
            return Err(ConnectError::NoInput(to.clone()));
        };
        if produced.id != expected.id {
            return Err(ConnectError::TypeMismatch {
                from: from.clone(),
                to: to.clone(),
                produced: produced.name,
                expected: expected.name,
            });
        }
        if self
            .edges
            .iter()
            .any(|e| &e.from == from && &e.to == to && e.port == port)
        {
            return Err(ConnectError::DuplicateEdge {
                from: from.clone(),
                to: to.clone(),
            });
        }
        if self.reaches(to, from) {
            return Err(ConnectError::WouldCycle {
                from: from.clone(),
                to: to.clone(),
            });
        }
        Ok(())
    }

    fn reaches(&self, start: &NodeId, target: &NodeId) -> bool {
        let mut stack = vec![start];
        let mut visited = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| &e.from == current) {
                stack.push(&edge.to);
            }
        }
        false
    }

    fn try_add_edge(&mut self, from: NodeId, to: NodeId, port: InputPort) -> Result<()> {
        self.check_edge(&from, &to, port)
            .map_err(PipelineError::Connect)?;
        self.edges.push(Edge::into_port(from, to, port));
        Ok(())
    }

    // --- per-node configuration -------------------------------------

    /// Select the execution strategy of a node.
    pub fn set_strategy(&mut self, node: &NodeId, strategy: ExecutionStrategy) -> Result<()> {
        self.def_mut(node)?.strategy = strategy;
        Ok(())
    }

    /// Run a node under the parallel strategy.
    pub fn set_parallel(&mut self, node: &NodeId, config: ParallelConfig) -> Result<()> {
        self.set_strategy(node, ExecutionStrategy::Parallel(config))
    }

    /// Run a node under the batching strategy.
    pub fn set_batch(&mut self, node: &NodeId, config: BatchConfig) -> Result<()> {
        self.set_strategy(node, ExecutionStrategy::Batch(config))
    }

    /// Wrap a node's current strategy with retry and restart handling.
    pub fn set_resilient(&mut self, node: &NodeId) -> Result<()> {
        let def = self.def_mut(node)?;
        let inner = std::mem::replace(&mut def.strategy, ExecutionStrategy::Sequential);
        def.strategy = ExecutionStrategy::resilient(inner);
        Ok(())
    }

    /// Select how a multi-inbound node merges its inputs.
    pub fn set_merge(&mut self, node: &NodeId, merge: MergeStrategy) -> Result<()> {
        self.def_mut(node)?.merge = merge;
        Ok(())
    }

    /// Register the delegate for a node using [`MergeStrategy::Custom`].
    pub fn set_custom_merge(
        &mut self,
        node: &NodeId,
        merge: impl Fn(Vec<DynPipe>) -> DynPipe + Send + Sync + 'static,
    ) -> Result<()> {
        self.def_mut(node)?.merge = MergeStrategy::Custom;
        self.custom_merges.insert(node.clone(), Arc::new(merge));
        Ok(())
    }

    /// Set the pipeline-wide retry options.
    pub fn set_retry_options(&mut self, options: RetryOptions) {
        self.retry = Some(options);
    }

    /// Override retry options for one node.
    pub fn set_node_retry_options(&mut self, node: &NodeId, options: RetryOptions) -> Result<()> {
        self.def_mut(node)?;
        self.node_retry.insert(node.clone(), options);
        Ok(())
    }

    /// Register the node-level error handler for a node consuming `T`.
    pub fn set_node_error_handler<T: Send + Sync + 'static>(
        &mut self,
        node: &impl Inputs<T>,
        handler: Arc<dyn NodeErrorHandler<T>>,
    ) -> Result<()> {
        let id = Inputs::node_id(node).clone();
        self.def_mut(&id)?.error_handler =
            Some(format!("handler<{}>", std::any::type_name::<T>()));
        self.node_error_handlers
            .insert(id, erase_node_error_handler(handler));
        Ok(())
    }

    /// Register the pipeline-level error handler. The last registration
    /// wins.
    pub fn add_pipeline_error_handler(&mut self, handler: Arc<dyn PipelineErrorHandler>) {
        self.pipeline_handler = Some(handler);
    }

    /// Register the dead-letter sink.
    pub fn set_dead_letter_sink(&mut self, sink: Arc<dyn DeadLetterSink>) {
        self.dead_letter = Some(sink);
    }

    // --- validation and build ---------------------------------------

    /// Skip the extended (warning) rule set.
    pub fn without_extended_validation(&mut self) -> &mut Self {
        self.validation.extended = false;
        self
    }

    /// Promote self-loops and duplicate edges to errors.
    pub fn strict(&mut self) -> &mut Self {
        self.validation.strict = true;
        self
    }

    /// Run the configured rule sets and return every finding.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let view = validate::GraphView {
            nodes: &self.nodes,
            edges: &self.edges,
        };
        let env = ValidationEnv {
            has_pipeline_error_handler: self.pipeline_handler.is_some(),
            pipeline_retry: self.retry.clone().unwrap_or_default(),
            node_retry: self.node_retry.clone(),
        };
        validate::run_rules(&view, &env, self.validation)
    }

    /// A deterministic topology listing of the graph built so far.
    pub fn describe(&self) -> String {
        PipelineGraph::assemble(self.name.clone(), self.nodes.clone(), self.edges.clone())
            .describe()
    }

    /// The graph built so far as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        PipelineGraph::assemble(self.name.clone(), self.nodes.clone(), self.edges.clone())
            .to_mermaid()
    }

    /// The graph built so far as a JSON topology export.
    pub fn to_json(&self) -> Result<String> {
        PipelineGraph::assemble(self.name.clone(), self.nodes.clone(), self.edges.clone())
            .to_json()
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<PipelineGraph> {
        let (graph, _) = self.finish()?;
        Ok(graph)
    }

    pub(crate) fn finish(self) -> Result<(PipelineGraph, NodeBindings)> {
        let findings = self.validate();
        for warning in findings
            .iter()
            .filter(|d| d.severity == validate::Severity::Warning)
        {
            tracing::warn!(pipeline = %self.name, "{}", warning);
        }
        let errors = validate::errors(&findings);
        if !errors.is_empty() {
            return Err(PipelineError::Validation(validate::ValidationFailure(
                errors,
            )));
        }
        let graph = PipelineGraph::assemble(self.name, self.nodes, self.edges);
        let bindings = NodeBindings {
            constructors: self.constructors,
            custom_merges: self.custom_merges,
            node_error_handlers: self.node_error_handlers,
            pipeline_handler: self.pipeline_handler,
            dead_letter: self.dead_letter,
            retry: self.retry,
            node_retry: self.node_retry,
            has_preconfigured: self.has_preconfigured,
        };
        Ok((graph, bindings))
    }
}
