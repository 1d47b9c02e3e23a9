//! Pipeline runner: validation, plan compilation and caching, pipe
//! assembly, and concurrent sink execution under a shared cancellation
//! token.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::exec;
use crate::exec::context::{NodeExecutionContext, PipelineContext};
use crate::exec::merge::merge_pipes;
use crate::exec::resilient;
use crate::exec::strategy::ExecutionStrategy;
use crate::graph::builder::{NodeBindings, PipelineBuilder};
use crate::graph::{Edge, InputPort, NodeId, NodeKind, PipelineGraph};
use crate::plan::cache::{InMemoryPlanCache, PlanCache};
use crate::plan::compiler::{CompiledPlans, ObserveFn, PlanCompiler, PlanOp};
use crate::plan::DynPipe;
use crate::{PipelineError, Result};

/// A pipeline definition: the builder callback the runner drives.
pub trait PipelineDefinition: Send + Sync + 'static {
    /// Declare the pipeline's nodes, edges, and configuration.
    fn define(&self, builder: &mut PipelineBuilder, ctx: &PipelineContext) -> Result<()>;
}

/// Summary of one completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Unique id of the run
    pub run_id: Uuid,
    /// Whether plans were compiled (false on a cache hit)
    pub compiled_plans: bool,
    /// Number of sinks that completed
    pub sinks_completed: usize,
    /// Wall-clock duration of the run
    pub elapsed: std::time::Duration,
}

/// Executes pipeline definitions.
pub struct PipelineRunner {
    cache: Arc<dyn PlanCache>,
    caching_enabled: bool,
}

impl PipelineRunner {
    /// A runner with the default in-memory plan cache.
    pub fn new() -> Self {
        Self {
            cache: Arc::new(InMemoryPlanCache::new()),
            caching_enabled: true,
        }
    }

    /// A runner with a caller-supplied plan cache.
    pub fn with_cache(cache: Arc<dyn PlanCache>) -> Self {
        Self {
            cache,
            caching_enabled: true,
        }
    }

    /// Disable plan caching entirely.
    pub fn without_caching(mut self) -> Self {
        self.caching_enabled = false;
        self
    }

    /// Run a definition with a fresh context.
    pub async fn run<D: PipelineDefinition + Default>(&self) -> Result<RunReport> {
        self.run_with::<D>(PipelineContext::new()).await
    }

    /// Run a definition with a caller-prepared context.
    pub async fn run_with<D: PipelineDefinition + Default>(
        &self,
        ctx: PipelineContext,
    ) -> Result<RunReport> {
        self.run_instance(&D::default(), TypeId::of::<D>(), ctx)
            .await
    }

    async fn run_instance<D: PipelineDefinition>(
        &self,
        definition: &D,
        def_type: TypeId,
        ctx: PipelineContext,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let ctx = Arc::new(ctx);
        let name = short_type_name::<D>();

        let mut builder = PipelineBuilder::new(name);
        definition.define(&mut builder, &ctx)?;
        let (graph, bindings) = builder.finish()?;
        install_bindings(&ctx, &bindings);

        let cacheable = self.caching_enabled && !bindings.has_preconfigured;
        let cached = if cacheable {
            self.cache.try_get(def_type, &graph)
        } else {
            None
        };
        let compiled_fresh = cached.is_none();
        let plans = match cached {
            Some(plans) => {
                tracing::debug!(
                    pipeline = graph.name(),
                    hash = &graph.structural_hash()[..12],
                    "plan cache hit"
                );
                plans
            }
            None => {
                let instances = bindings.instantiate();
                let plans = PlanCompiler::compile(&graph, &instances)?;
                if cacheable {
                    self.cache.put(def_type, &graph, plans.clone());
                }
                plans
            }
        };

        let report = drive_sinks(&graph, &plans, &bindings, Arc::clone(&ctx)).await;
        ctx.set_current_node(None);
        let (sinks_completed, outcome) = report;
        match outcome {
            Some(error) => Err(error),
            None => {
                let report = RunReport {
                    run_id: ctx.run_id(),
                    compiled_plans: compiled_fresh,
                    sinks_completed,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    pipeline = graph.name(),
                    run_id = %report.run_id,
                    sinks = report.sinks_completed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "pipeline run completed"
                );
                Ok(report)
            }
        }
    }
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn short_type_name<D: 'static>() -> String {
    let full = std::any::type_name::<D>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

fn install_bindings(ctx: &Arc<PipelineContext>, bindings: &NodeBindings) {
    if let Some(retry) = &bindings.retry {
        ctx.set_retry_options(retry.clone());
    }
    for (node, retry) in &bindings.node_retry {
        ctx.set_node_retry_options(node.clone(), retry.clone());
    }
    if let Some(sink) = &bindings.dead_letter {
        ctx.set_dead_letter_sink(Arc::clone(sink));
    }
    if let Some(handler) = &bindings.pipeline_handler {
        ctx.set_pipeline_error_handler(Arc::clone(handler));
    }
    for (node, handler) in &bindings.node_error_handlers {
        ctx.set_node_error_handler(node.clone(), Arc::clone(handler));
    }
}

/// Assembles pipes back-to-front: each sink's input is composed
/// recursively from upstream plans wrapped in their strategies.
struct PipeAssembler<'a> {
    graph: &'a PipelineGraph,
    plans: &'a CompiledPlans,
    bindings: &'a NodeBindings,
    ctx: Arc<PipelineContext>,
    branch_outputs: HashMap<(NodeId, NodeId), DynPipe>,
}

impl<'a> PipeAssembler<'a> {
    fn new(
        graph: &'a PipelineGraph,
        plans: &'a CompiledPlans,
        bindings: &'a NodeBindings,
        ctx: Arc<PipelineContext>,
    ) -> Self {
        Self {
            graph,
            plans,
            bindings,
            ctx,
            branch_outputs: HashMap::new(),
        }
    }

    fn snapshot(&self, id: &NodeId) -> Arc<NodeExecutionContext> {
        self.ctx.set_current_node(Some(id.clone()));
        Arc::new(NodeExecutionContext::snapshot(
            Arc::clone(&self.ctx),
            id.clone(),
        ))
    }

    fn build_input(&mut self, id: &NodeId) -> Result<DynPipe> {
        let inbound: Vec<Edge> = self.graph.inbound(id).into_iter().cloned().collect();
        match inbound.len() {
            0 => Err(PipelineError::Configuration {
                node: id.clone(),
                message: "node has no inbound edge".to_string(),
            }),
            1 => self.edge_output(&inbound[0]),
            _ => {
                let def = self.graph.node(id).ok_or_else(|| {
                    PipelineError::Internal(format!("unknown node '{}'", id))
                })?;
                let mut pipes = Vec::with_capacity(inbound.len());
                for edge in &inbound {
                    pipes.push(self.edge_output(edge)?);
                }
                Ok(merge_pipes(
                    def.merge,
                    pipes,
                    self.bindings.custom_merges.get(id).cloned(),
                    format!("{}/merge", id),
                    self.ctx.cancellation().clone(),
                ))
            }
        }
    }

    fn port_input(&mut self, id: &NodeId, port: InputPort) -> Result<DynPipe> {
        let edge = self
            .graph
            .inbound(id)
            .into_iter()
            .find(|e| e.port == port)
            .cloned();
        match edge {
            Some(edge) => self.edge_output(&edge),
            None => Err(PipelineError::Configuration {
                node: id.clone(),
                message: format!("join node is missing its {} input", port.label()),
            }),
        }
    }

    fn edge_output(&mut self, edge: &Edge) -> Result<DynPipe> {
        let from_kind = self
            .graph
            .node(&edge.from)
            .map(|def| def.kind)
            .ok_or_else(|| PipelineError::Internal(format!("unknown node '{}'", edge.from)))?;
        if from_kind == NodeKind::Branch {
            self.materialize_branch(&edge.from)?;
            return self
                .branch_outputs
                .remove(&(edge.from.clone(), edge.to.clone()))
                .ok_or_else(|| {
                    PipelineError::Internal(format!(
                        "branch '{}' has no output pipe for '{}'",
                        edge.from, edge.to
                    ))
                });
        }
        self.node_output(&edge.from)
    }

    fn node_output(&mut self, id: &NodeId) -> Result<DynPipe> {
        let plan = self.plans.plan(id)?;
        match &plan.op {
            PlanOp::Source { init } => {
                let snapshot = self.snapshot(id);
                // Source pulls observe the run's shared token.
                let token = snapshot.cancellation().clone();
                init(&snapshot).map(|pipe| pipe.with_cancellation(token))
            }
            PlanOp::Transform { apply, clone_input } => {
                let input = self.build_input(id)?;
                let snapshot = self.snapshot(id);
                Ok(exec::run_transform(
                    &plan.strategy,
                    Arc::clone(apply),
                    Arc::clone(clone_input),
                    input,
                    snapshot,
                ))
            }
            PlanOp::StreamTransform { apply } => {
                let input = self.build_input(id)?;
                let snapshot = self.snapshot(id);
                apply(input, snapshot)
            }
            PlanOp::Join { run } => {
                let left = self.port_input(id, InputPort::JoinLeft)?;
                let right = self.port_input(id, InputPort::JoinRight)?;
                let snapshot = self.snapshot(id);
                Ok(run(left, right, snapshot))
            }
            PlanOp::Aggregate { run } => {
                let input = self.build_input(id)?;
                let snapshot = self.snapshot(id);
                Ok(run(input, snapshot))
            }
            PlanOp::Tap { observe } => {
                let input = self.build_input(id)?;
                let snapshot = self.snapshot(id);
                Ok(tap_pipe(input, Arc::clone(observe), snapshot))
            }
            PlanOp::Branch { .. } => Err(PipelineError::Internal(format!(
                "branch '{}' outputs are materialized per edge",
                id
            ))),
            PlanOp::Sink { .. } => Err(PipelineError::Internal(format!(
                "sink '{}' has no output pipe",
                id
            ))),
        }
    }

    /// Spawn the pump task duplicating a branch's input into one bounded
    /// channel per outbound edge. A slow consumer backpressures the pump
    /// and therefore every sibling.
    fn materialize_branch(&mut self, id: &NodeId) -> Result<()> {
        if self
            .branch_outputs
            .keys()
            .any(|(branch, _)| branch == id)
        {
            return Ok(());
        }
        let plan = self.plans.plan(id)?;
        let PlanOp::Branch { duplicate } = &plan.op else {
            return Err(PipelineError::Internal(format!(
                "node '{}' is not a branch",
                id
            )));
        };
        let duplicate = Arc::clone(duplicate);
        let outbound: Vec<Edge> = self.graph.outbound(id).into_iter().cloned().collect();
        if outbound.is_empty() {
            return Err(PipelineError::Configuration {
                node: id.clone(),
                message: "branch node has no outbound edges".to_string(),
            });
        }
        let mut input = self.build_input(id)?;
        let snapshot = self.snapshot(id);
        let mut senders = Vec::with_capacity(outbound.len());
        for edge in &outbound {
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<crate::plan::AnyItem>>(16);
            let pipe = crate::pipe::Pipe::from_channel(format!("{}/{}", id, edge.to), rx)
                .with_cancellation(self.ctx.cancellation().clone());
            self.branch_outputs
                .insert((id.clone(), edge.to.clone()), pipe);
            senders.push(tx);
        }
        tokio::spawn(async move {
            while let Some(pulled) = input.next().await {
                match pulled {
                    Ok(item) => {
                        let mut delivered = false;
                        let last = senders.len() - 1;
                        for tx in &senders[..last] {
                            match duplicate(&item) {
                                Ok(copy) => {
                                    if tx.send(Ok(copy)).await.is_ok() {
                                        delivered = true;
                                    }
                                }
                                Err(e) => {
                                    let message = e.to_string();
                                    for tx in &senders {
                                        let _ = tx
                                            .send(Err(PipelineError::Internal(message.clone())))
                                            .await;
                                    }
                                    return;
                                }
                            }
                        }
                        // The last consumer takes the original.
                        if senders[last].send(Ok(item)).await.is_ok() {
                            delivered = true;
                        }
                        if !delivered {
                            return;
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        for tx in &senders {
                            let _ = tx.send(Err(PipelineError::Internal(message.clone()))).await;
                        }
                        return;
                    }
                }
            }
            snapshot.finish_window();
        });
        Ok(())
    }
}

fn tap_pipe(
    input: DynPipe,
    observe: ObserveFn,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    input.map(move |item| {
        observe(&item, &ctx);
        item
    })
}

/// Start every sink concurrently and await them all. On the first fatal
/// error the shared token is cancelled, remaining sinks drain, and the
/// original error surfaces.
async fn drive_sinks(
    graph: &PipelineGraph,
    plans: &CompiledPlans,
    bindings: &NodeBindings,
    ctx: Arc<PipelineContext>,
) -> (usize, Option<PipelineError>) {
    let mut assembler = PipeAssembler::new(graph, plans, bindings, Arc::clone(&ctx));
    let mut set: JoinSet<(NodeId, Result<()>)> = JoinSet::new();
    for sink in graph.sinks() {
        let id = sink.id.clone();
        let plan = match plans.plan(&id) {
            Ok(plan) => plan,
            Err(e) => return (0, Some(e)),
        };
        let PlanOp::Sink { consume } = &plan.op else {
            return (
                0,
                Some(PipelineError::Internal(format!(
                    "node '{}' is declared as a sink but compiled differently",
                    id
                ))),
            );
        };
        let input = match assembler.build_input(&id) {
            Ok(input) => input,
            Err(e) => {
                ctx.cancel();
                return (0, Some(e));
            }
        };
        let snapshot = assembler.snapshot(&id);
        let consume = Arc::clone(consume);
        let resilient_sink = matches!(plan.strategy, ExecutionStrategy::Resilient(_));
        set.spawn(async move {
            let result = if resilient_sink {
                resilient::run_sink(consume, input, Arc::clone(&snapshot)).await
            } else {
                consume(input, Arc::clone(&snapshot)).await
            };
            snapshot.finish_window();
            (id, result)
        });
    }

    let mut completed = 0usize;
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => completed += 1,
            Ok((id, Err(e))) => {
                let error = normalize_sink_error(id, e);
                // Prefer the first real failure over drain cancellations.
                match &first_error {
                    None => first_error = Some(error),
                    Some(PipelineError::Cancelled)
                        if !matches!(error, PipelineError::Cancelled) =>
                    {
                        first_error = Some(error)
                    }
                    _ => {}
                }
                ctx.cancel();
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(PipelineError::Internal(format!(
                        "sink task failed: {}",
                        join_error
                    )));
                }
                ctx.cancel();
            }
        }
    }
    (completed, first_error)
}

/// Keep structured errors as-is; wrap raw item/user errors with the sink
/// that surfaced them.
fn normalize_sink_error(id: NodeId, error: PipelineError) -> PipelineError {
    match error {
        PipelineError::Cancelled => PipelineError::Cancelled,
        e @ (PipelineError::NodeFailure { .. }
        | PipelineError::Configuration { .. }
        | PipelineError::Validation(_)) => e,
        other => PipelineError::NodeFailure {
            node: id,
            attempts: 1,
            source: Box::new(other),
        },
    }
}
