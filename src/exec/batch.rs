//! Batching execution: chunked pulls, order preserved.
//!
//! Batching groups upstream pulls into chunks of at most `size` items,
//! flushing a partial chunk on timeout. Items inside a chunk run in
//! order, chunks run in order, so the output sequence matches sequential
//! execution; only the pull granularity changes.

use std::sync::Arc;

use async_stream::stream;

use crate::exec::context::NodeExecutionContext;
use crate::exec::strategy::BatchConfig;
use crate::exec::{ItemApplied, ItemFn};
use crate::pipe::Pipe;
use crate::plan::DynPipe;
use crate::PipelineError;

/// Drive an item function over the input pipe in chunks.
pub(crate) fn run(
    cfg: BatchConfig,
    item_fn: ItemFn,
    input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    let size = cfg.size.max(1);
    let stream = stream! {
        let mut chunks = input.batched(size, cfg.timeout);
        while let Some(chunk) = chunks.next().await {
            if ctx.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if ctx.log_items() {
                tracing::debug!(node = %ctx.node_id(), batch = chunk.len(), "processing batch");
            }
            for item in chunk {
                match item_fn(item, Arc::clone(&ctx)).await {
                    Ok(ItemApplied::Emit(out)) => yield Ok(out),
                    Ok(ItemApplied::Drop) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
        ctx.finish_window();
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::context::PipelineContext;
    use crate::exec::plain_item_fn;
    use crate::graph::NodeId;
    use crate::plan::AnyItem;

    #[tokio::test]
    async fn batching_preserves_order_across_chunks() {
        let ctx = Arc::new(NodeExecutionContext::snapshot(
            Arc::new(PipelineContext::new()),
            NodeId::new("transform-1"),
        ));
        let item_fn = plain_item_fn(Arc::new(|item: AnyItem, _ctx| {
            Box::pin(async move {
                let n = *item
                    .downcast::<i64>()
                    .map_err(|_| PipelineError::Internal("expected i64".to_string()))?;
                Ok(Box::new(n + 100) as AnyItem)
            })
        }));
        let cfg = BatchConfig {
            size: 3,
            timeout: None,
        };
        let input = crate::plan::erase_pipe(Pipe::from_values("numbers", (0..7i64).collect()));
        let out = run(cfg, item_fn, input, ctx)
            .try_map(|item| crate::plan::downcast_item::<i64>(item, &NodeId::new("t")))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, (100..107).collect::<Vec<i64>>());
    }
}
