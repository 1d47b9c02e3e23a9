//! Sequential execution: one item at a time, order preserved.

use std::sync::Arc;

use async_stream::stream;
use futures::FutureExt;

use crate::exec::context::NodeExecutionContext;
use crate::exec::{ItemApplied, ItemFn};
use crate::plan::DynPipe;
use crate::pipe::Pipe;
use crate::PipelineError;

/// Drive an item function over the input pipe, one item at a time.
///
/// Items that complete without suspending take a fast path: the future is
/// polled once inline, so no waker registration happens for synchronous
/// completions.
pub(crate) fn run(item_fn: ItemFn, mut input: DynPipe, ctx: Arc<NodeExecutionContext>) -> DynPipe {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    let count = input.count();
    let stream = stream! {
        while let Some(pulled) = input.next().await {
            if ctx.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }
            let item = match pulled {
                Ok(item) => item,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if ctx.log_items() {
                tracing::debug!(node = %ctx.node_id(), "processing item");
            }
            let mut fut = item_fn(item, Arc::clone(&ctx));
            // Synchronous-completion fast path.
            let applied = match (&mut fut).now_or_never() {
                Some(applied) => applied,
                None => fut.await,
            };
            match applied {
                Ok(ItemApplied::Emit(out)) => yield Ok(out),
                Ok(ItemApplied::Drop) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        ctx.finish_window();
    };
    let pipe = Pipe::new(name, stream).with_cancellation(cancel);
    match count {
        Some(count) => pipe.with_count(count),
        None => pipe,
    }
}
