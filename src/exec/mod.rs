//! Execution strategies and the machinery they share.
//!
//! Every strategy executes on top of a compiled plan: it pulls erased
//! items from the node's input pipe, runs them through an item function,
//! and emits the results as the node's output pipe. The resilient
//! strategy wraps the item function with retry handling and adds a
//! restart loop around whichever inner strategy it decorates.

use std::sync::Arc;

use crate::exec::context::NodeExecutionContext;
use crate::exec::strategy::ExecutionStrategy;
use crate::plan::compiler::{ApplyFn, ItemCloneFn};
use crate::plan::{AnyItem, BoxResultFuture, DynPipe};

pub mod context;
pub mod retry;
pub mod strategy;

pub(crate) mod batch;
pub(crate) mod merge;
pub(crate) mod parallel;
pub(crate) mod resilient;
pub(crate) mod sequential;

/// Outcome of pushing one item through a strategy's item function.
pub(crate) enum ItemApplied {
    /// Emit the produced item downstream
    Emit(AnyItem),
    /// The item was consumed without output (skipped or dead-lettered)
    Drop,
}

/// The per-item operation a strategy drives: the plan's apply, possibly
/// wrapped with retry handling.
pub(crate) type ItemFn =
    Arc<dyn Fn(AnyItem, Arc<NodeExecutionContext>) -> BoxResultFuture<ItemApplied> + Send + Sync>;

/// Lift a plan apply into an item function that always emits.
pub(crate) fn plain_item_fn(apply: ApplyFn) -> ItemFn {
    Arc::new(move |item, ctx| {
        let fut = apply(item, ctx);
        Box::pin(async move { fut.await.map(ItemApplied::Emit) })
    })
}

/// Execute a transform node's apply over its input pipe under the given
/// strategy.
pub(crate) fn run_transform(
    strategy: &ExecutionStrategy,
    apply: ApplyFn,
    clone_input: ItemCloneFn,
    input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    match strategy {
        ExecutionStrategy::Resilient(inner) => {
            resilient::run_transform(inner, apply, clone_input, input, ctx)
        }
        other => run_with_item_fn(other, plain_item_fn(apply), input, ctx),
    }
}

/// Dispatch an already-wrapped item function to a non-resilient engine.
pub(crate) fn run_with_item_fn(
    strategy: &ExecutionStrategy,
    item_fn: ItemFn,
    input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    match strategy {
        ExecutionStrategy::Sequential => sequential::run(item_fn, input, ctx),
        ExecutionStrategy::Parallel(cfg) => parallel::run(cfg.clone(), item_fn, input, ctx),
        ExecutionStrategy::Batch(cfg) => batch::run(cfg.clone(), item_fn, input, ctx),
        ExecutionStrategy::Resilient(inner) => {
            tracing::warn!(
                node = %ctx.node_id(),
                "nested resilient strategy has no effect; using its inner strategy"
            );
            run_with_item_fn(inner, item_fn, input, ctx)
        }
    }
}
