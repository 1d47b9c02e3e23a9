//! The plan compiler: frozen graph + node instances in, per-node
//! direct-dispatch plans out.
//!
//! A compiled plan holds one closure per node operation, each capturing
//! the erased instance. Steady-state dispatch is a single indirect call
//! per item; no lookup or reflection happens after compilation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::exec::context::NodeExecutionContext;
use crate::exec::strategy::ExecutionStrategy;
use crate::graph::{NodeId, NodeKind, PipelineGraph};
use crate::plan::{AnyItem, BoxResultFuture, CloneFn, DynPipe, ErasedNode};
use crate::{PipelineError, Result};

pub(crate) type InitFn = Arc<dyn Fn(&NodeExecutionContext) -> Result<DynPipe> + Send + Sync>;
pub(crate) type ApplyFn =
    Arc<dyn Fn(AnyItem, Arc<NodeExecutionContext>) -> BoxResultFuture<AnyItem> + Send + Sync>;
pub(crate) type StreamApplyFn =
    Arc<dyn Fn(DynPipe, Arc<NodeExecutionContext>) -> Result<DynPipe> + Send + Sync>;
pub(crate) type ConsumeFn =
    Arc<dyn Fn(DynPipe, Arc<NodeExecutionContext>) -> BoxResultFuture<()> + Send + Sync>;
pub(crate) type JoinRunFn =
    Arc<dyn Fn(DynPipe, DynPipe, Arc<NodeExecutionContext>) -> DynPipe + Send + Sync>;
pub(crate) type AggregateRunFn =
    Arc<dyn Fn(DynPipe, Arc<NodeExecutionContext>) -> DynPipe + Send + Sync>;
pub(crate) type ObserveFn = Arc<dyn Fn(&AnyItem, &NodeExecutionContext) + Send + Sync>;
pub(crate) type ItemCloneFn = Arc<dyn Fn(&AnyItem, &NodeId) -> Result<AnyItem> + Send + Sync>;

/// The operation a compiled plan dispatches for its node.
pub(crate) enum PlanOp {
    Source {
        init: InitFn,
    },
    Transform {
        apply: ApplyFn,
        clone_input: ItemCloneFn,
    },
    StreamTransform {
        apply: StreamApplyFn,
    },
    Sink {
        consume: ConsumeFn,
    },
    Join {
        run: JoinRunFn,
    },
    Aggregate {
        run: AggregateRunFn,
    },
    Tap {
        observe: ObserveFn,
    },
    Branch {
        duplicate: CloneFn,
    },
}

/// Compiled plan for one node.
pub(crate) struct NodePlan {
    pub id: NodeId,
    pub kind: NodeKind,
    pub strategy: ExecutionStrategy,
    pub op: PlanOp,
}

/// The compiled plans of a whole graph, shared across runs by the cache.
#[derive(Clone)]
pub struct CompiledPlans {
    pub(crate) plans: Arc<HashMap<NodeId, NodePlan>>,
}

impl CompiledPlans {
    /// Number of node plans in the set.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub(crate) fn plan(&self, id: &NodeId) -> Result<&NodePlan> {
        self.plans
            .get(id)
            .ok_or_else(|| PipelineError::Internal(format!("no compiled plan for node '{}'", id)))
    }
}

impl std::fmt::Debug for CompiledPlans {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPlans")
            .field("nodes", &self.plans.len())
            .finish()
    }
}

/// Builds [`CompiledPlans`] from a frozen graph and its node instances.
pub(crate) struct PlanCompiler;

impl PlanCompiler {
    pub(crate) fn compile(
        graph: &PipelineGraph,
        instances: &HashMap<NodeId, ErasedNode>,
    ) -> Result<CompiledPlans> {
        let mut plans = HashMap::with_capacity(graph.nodes().len());
        for def in graph.nodes() {
            let instance = instances.get(&def.id).ok_or_else(|| {
                PipelineError::Internal(format!("no instance supplied for node '{}'", def.id))
            })?;
            let op = Self::compile_op(def, instance)?;
            plans.insert(
                def.id.clone(),
                NodePlan {
                    id: def.id.clone(),
                    kind: def.kind,
                    strategy: def.strategy.clone(),
                    op,
                },
            );
        }
        tracing::debug!(
            pipeline = graph.name(),
            nodes = plans.len(),
            hash = &graph.structural_hash()[..12],
            "compiled execution plans"
        );
        Ok(CompiledPlans {
            plans: Arc::new(plans),
        })
    }

    fn compile_op(def: &crate::graph::NodeDefinition, instance: &ErasedNode) -> Result<PlanOp> {
        let mismatch = || {
            PipelineError::Internal(format!(
                "node '{}' is declared as {} but its instance is a {}",
                def.id,
                def.kind.label(),
                instance.kind_label()
            ))
        };
        Ok(match (def.kind, instance) {
            (NodeKind::Source, ErasedNode::Source(node)) => {
                let node = Arc::clone(node);
                PlanOp::Source {
                    init: Arc::new(move |ctx| node.init(ctx)),
                }
            }
            (NodeKind::Transform, ErasedNode::Transform(node)) => {
                let apply_node = Arc::clone(node);
                let clone_node = Arc::clone(node);
                PlanOp::Transform {
                    apply: Arc::new(move |item, ctx| apply_node.apply(item, ctx)),
                    clone_input: Arc::new(move |item, node_id| {
                        clone_node.clone_input(item, node_id)
                    }),
                }
            }
            (NodeKind::StreamTransform, ErasedNode::StreamTransform(node)) => {
                let node = Arc::clone(node);
                PlanOp::StreamTransform {
                    apply: Arc::new(move |input, ctx| node.apply(input, ctx)),
                }
            }
            (NodeKind::Sink, ErasedNode::Sink(node)) => {
                let node = Arc::clone(node);
                PlanOp::Sink {
                    consume: Arc::new(move |input, ctx| node.consume(input, ctx)),
                }
            }
            (NodeKind::Join, ErasedNode::Join(node)) => {
                let node = Arc::clone(node);
                let merge = def.merge;
                PlanOp::Join {
                    run: Arc::new(move |left, right, ctx| node.run(left, right, merge, ctx)),
                }
            }
            (NodeKind::Aggregate, ErasedNode::Aggregate(node)) => {
                let node = Arc::clone(node);
                PlanOp::Aggregate {
                    run: Arc::new(move |input, ctx| node.run(input, ctx)),
                }
            }
            (NodeKind::Tap, ErasedNode::Tap(node)) => {
                let node = Arc::clone(node);
                PlanOp::Tap {
                    observe: Arc::new(move |item, ctx| node.observe(item, ctx)),
                }
            }
            (NodeKind::Branch, ErasedNode::Branch(duplicate)) => PlanOp::Branch {
                duplicate: Arc::clone(duplicate),
            },
            _ => return Err(mismatch()),
        })
    }
}
