//! Resilient execution: per-item retry and node restart wrapped around an
//! inner strategy.
//!
//! Item failures go to the node-level error handler, whose decision is
//! honored locally: skip, delayed retry within the per-item budget,
//! dead-letter routing, or escalation. Escalations and non-item failures
//! go to the pipeline-level handler, which may restart the node (replaying
//! recent inputs from a bounded materialization buffer), detach it, or
//! fail the run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::stream;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{DeadLetterEnvelope, NodeDecision, PipelineDecision};
use crate::exec::context::NodeExecutionContext;
use crate::exec::strategy::ExecutionStrategy;
use crate::exec::{ItemApplied, ItemFn};
use crate::graph::NodeId;
use crate::pipe::Pipe;
use crate::plan::compiler::{ApplyFn, ConsumeFn, ItemCloneFn};
use crate::plan::{AnyItem, DynPipe};
use crate::{PipelineError, Result};

/// Bounded record of recent inputs whose processing has not completed,
/// kept for restart replay. In FIFO mode (sequential/batch inner
/// strategies) completions pop the front, so the buffer holds exactly the
/// in-flight remainder; in ring mode (parallel inner) it holds the most
/// recent inputs up to capacity.
struct MaterializationBuffer {
    capacity: Option<usize>,
    fifo: bool,
    items: Mutex<VecDeque<AnyItem>>,
}

impl MaterializationBuffer {
    fn new(capacity: Option<usize>, fifo: bool) -> Self {
        Self {
            capacity,
            fifo,
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, item: &AnyItem, clone_input: &ItemCloneFn, node: &NodeId) -> Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };
        let copy = clone_input(item, node)?;
        let mut items = self.items.lock();
        if items.len() >= capacity {
            items.pop_front();
        }
        items.push_back(copy);
        Ok(())
    }

    fn complete_one(&self) {
        if self.fifo {
            self.items.lock().pop_front();
        }
    }

    fn snapshot(&self, clone_input: &ItemCloneFn, node: &NodeId) -> Result<Vec<AnyItem>> {
        self.items
            .lock()
            .iter()
            .map(|item| clone_input(item, node))
            .collect()
    }
}

/// Wrap a plan apply with node-level retry handling.
fn retrying_item_fn(
    apply: ApplyFn,
    clone_input: ItemCloneFn,
    rng: Arc<Mutex<StdRng>>,
) -> ItemFn {
    Arc::new(move |item: AnyItem, ctx: Arc<NodeExecutionContext>| {
        let apply = Arc::clone(&apply);
        let clone_input = Arc::clone(&clone_input);
        let rng = Arc::clone(&rng);
        Box::pin(async move {
            let node_id = ctx.node_id().clone();
            let opts = ctx.retry().clone();
            let handler = ctx.pipeline().node_error_handler(&node_id);
            let jitter_state = ctx.pipeline().jitter_state(&node_id);
            let mut attempt: u32 = 1;
            loop {
                // Each attempt consumes a copy; the original stays
                // available for the handler and the dead-letter envelope.
                let attempt_item = clone_input(&item, &node_id)?;
                let error = match apply(attempt_item, Arc::clone(&ctx)).await {
                    Ok(out) => return Ok(ItemApplied::Emit(out)),
                    Err(error) => error,
                };
                if error.is_cancellation() || ctx.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                let Some(handler) = handler.as_ref() else {
                    return Err(error);
                };
                match handler.handle(&item, &error, &ctx).await {
                    NodeDecision::Skip => {
                        tracing::warn!(node = %node_id, attempt, error = %error, "skipping failed item");
                        return Ok(ItemApplied::Drop);
                    }
                    NodeDecision::DeadLetter => {
                        let Some(sink) = ctx.pipeline().dead_letter_sink() else {
                            return Err(PipelineError::Configuration {
                                node: node_id,
                                message: "dead-letter decision requires a dead-letter sink"
                                    .to_string(),
                            });
                        };
                        tracing::warn!(node = %node_id, attempt, error = %error, "dead-lettering failed item");
                        let envelope = DeadLetterEnvelope {
                            item,
                            error: Arc::new(error),
                            node: node_id,
                            attempt,
                        };
                        sink.send(envelope, &ctx).await?;
                        return Ok(ItemApplied::Drop);
                    }
                    NodeDecision::Fail => return Err(error),
                    NodeDecision::Retry => {
                        if !(opts.should_retry)(&error) || attempt > opts.max_item_retries {
                            return Err(error);
                        }
                        if let Some(delay) = &opts.delay {
                            let wait = {
                                let mut rng = rng.lock();
                                delay.delay_for(attempt, &mut *rng, &jitter_state)
                            };
                            tracing::debug!(
                                node = %node_id,
                                attempt,
                                delay_ms = wait.as_millis() as u64,
                                "retrying failed item"
                            );
                            tokio::select! {
                                biased;
                                _ = ctx.cancellation().cancelled() => return Err(PipelineError::Cancelled),
                                _ = tokio::time::sleep(wait) => {}
                            }
                        }
                        attempt += 1;
                    }
                }
            }
        })
    })
}

/// Pop the materialization buffer as items complete.
fn completing_item_fn(inner: ItemFn, buffer: Arc<MaterializationBuffer>) -> ItemFn {
    Arc::new(move |item, ctx| {
        let inner = Arc::clone(&inner);
        let buffer = Arc::clone(&buffer);
        Box::pin(async move {
            let applied = inner(item, ctx).await;
            if applied.is_ok() {
                buffer.complete_one();
            }
            applied
        })
    })
}

/// One restartable input segment: buffered replay items first, then the
/// shared upstream remainder, recording each pulled item for replay.
fn segment_pipe(
    replay: Vec<AnyItem>,
    upstream: Arc<AsyncMutex<Option<DynPipe>>>,
    buffer: Arc<MaterializationBuffer>,
    clone_input: ItemCloneFn,
    node: NodeId,
    upstream_failed: Arc<AtomicBool>,
) -> DynPipe {
    let pipe_name = format!("{}/segment", node);
    let stream = stream! {
        for item in replay {
            yield Ok(item);
        }
        loop {
            let mut guard = upstream.lock().await;
            let Some(pipe) = guard.as_mut() else {
                return;
            };
            match pipe.next().await {
                Some(Ok(item)) => {
                    if let Err(e) = buffer.record(&item, &clone_input, &node) {
                        yield Err(e);
                        return;
                    }
                    drop(guard);
                    yield Ok(item);
                }
                Some(Err(e)) => {
                    if !e.is_cancellation() {
                        upstream_failed.store(true, Ordering::Release);
                    }
                    *guard = None;
                    yield Err(e);
                    return;
                }
                None => {
                    *guard = None;
                    return;
                }
            }
        }
    };
    Pipe::new(pipe_name, stream)
}

fn restart_prerequisites(opts: &crate::exec::retry::RetryOptions, node: &NodeId) -> Result<()> {
    if opts.max_node_restart_attempts == 0 {
        return Err(PipelineError::Configuration {
            node: node.clone(),
            message: "RestartNode requires max_node_restart_attempts > 0".to_string(),
        });
    }
    if !matches!(opts.max_materialized_items, Some(n) if n > 0) {
        return Err(PipelineError::Configuration {
            node: node.clone(),
            message: "RestartNode requires a positive, finite max_materialized_items".to_string(),
        });
    }
    Ok(())
}

/// Execute a transform under the resilient strategy.
pub(crate) fn run_transform(
    inner: &ExecutionStrategy,
    apply: ApplyFn,
    clone_input: ItemCloneFn,
    input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    let inner = inner.clone();
    let stream = stream! {
        let node_id = ctx.node_id().clone();
        let opts = ctx.retry().clone();
        if let Err(e) = opts.validate() {
            yield Err(PipelineError::Configuration {
                node: node_id.clone(),
                message: e.to_string(),
            });
            return;
        }
        let rng = Arc::new(Mutex::new(match opts.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }));
        let fifo = matches!(
            inner,
            ExecutionStrategy::Sequential | ExecutionStrategy::Batch(_)
        );
        let buffer = Arc::new(MaterializationBuffer::new(opts.max_materialized_items, fifo));
        let item_fn = completing_item_fn(
            retrying_item_fn(apply, Arc::clone(&clone_input), rng),
            Arc::clone(&buffer),
        );
        let upstream = Arc::new(AsyncMutex::new(Some(input)));
        let upstream_failed = Arc::new(AtomicBool::new(false));
        let mut replay: Vec<AnyItem> = Vec::new();
        let mut episode_restarts: u32 = 0;
        let mut run_restarts: u32 = 0;

        loop {
            let segment = segment_pipe(
                std::mem::take(&mut replay),
                Arc::clone(&upstream),
                Arc::clone(&buffer),
                Arc::clone(&clone_input),
                node_id.clone(),
                Arc::clone(&upstream_failed),
            );
            let mut out =
                crate::exec::run_with_item_fn(&inner, Arc::clone(&item_fn), segment, Arc::clone(&ctx));
            let mut failure: Option<PipelineError> = None;
            while let Some(applied) = out.next().await {
                match applied {
                    Ok(item) => {
                        // A completed item ends the current failure episode.
                        episode_restarts = 0;
                        yield Ok(item);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            let Some(error) = failure else {
                // Full input completed; restart counters are at rest.
                break;
            };
            if error.is_cancellation() || ctx.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }
            if upstream_failed.load(Ordering::Acquire) {
                // Upstream failed, not this node; restart cannot help.
                yield Err(error);
                return;
            }
            let Some(handler) = ctx.pipeline().pipeline_error_handler() else {
                yield Err(PipelineError::NodeFailure {
                    node: node_id.clone(),
                    attempts: run_restarts + 1,
                    source: Box::new(error),
                });
                return;
            };
            match handler.handle_node_failure(&node_id, &error, &ctx).await {
                PipelineDecision::RestartNode => {
                    if let Err(e) = restart_prerequisites(&opts, &node_id) {
                        yield Err(e);
                        return;
                    }
                    episode_restarts += 1;
                    run_restarts += 1;
                    if episode_restarts > opts.max_node_restart_attempts
                        || run_restarts > opts.max_sequential_node_attempts
                    {
                        yield Err(PipelineError::NodeFailure {
                            node: node_id.clone(),
                            attempts: run_restarts,
                            source: Box::new(error),
                        });
                        return;
                    }
                    tracing::warn!(
                        node = %node_id,
                        restart = run_restarts,
                        error = %error,
                        "restarting node, replaying materialized items"
                    );
                    match buffer.snapshot(&clone_input, &node_id) {
                        Ok(items) => replay = items,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                PipelineDecision::ContinueWithoutNode => {
                    tracing::warn!(node = %node_id, error = %error, "detaching node, downstream sees end-of-stream");
                    return;
                }
                PipelineDecision::FailPipeline => {
                    yield Err(PipelineError::NodeFailure {
                        node: node_id.clone(),
                        attempts: run_restarts + 1,
                        source: Box::new(error),
                    });
                    return;
                }
            }
        }
        ctx.finish_window();
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

/// Execute a sink consume under the resilient strategy.
///
/// Sinks pull their items internally, so per-item decisions do not apply;
/// resilience here means restarting the consume call over the unconsumed
/// remainder of the input.
pub(crate) async fn run_sink(
    consume: ConsumeFn,
    input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> Result<()> {
    let node_id = ctx.node_id().clone();
    let opts = ctx.retry().clone();
    let upstream = Arc::new(AsyncMutex::new(Some(input)));
    let upstream_failed = Arc::new(AtomicBool::new(false));
    let noop_buffer = Arc::new(MaterializationBuffer::new(None, false));
    let noop_clone: ItemCloneFn = Arc::new(|_, node| {
        Err(PipelineError::Internal(format!(
            "sink '{}' does not materialize items",
            node
        )))
    });
    let mut episode_restarts: u32 = 0;
    let mut run_restarts: u32 = 0;
    loop {
        let segment = segment_pipe(
            Vec::new(),
            Arc::clone(&upstream),
            Arc::clone(&noop_buffer),
            Arc::clone(&noop_clone),
            node_id.clone(),
            Arc::clone(&upstream_failed),
        );
        let error = match consume(segment, Arc::clone(&ctx)).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        if error.is_cancellation() || ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if upstream_failed.load(Ordering::Acquire) {
            return Err(error);
        }
        let Some(handler) = ctx.pipeline().pipeline_error_handler() else {
            return Err(error);
        };
        match handler.handle_node_failure(&node_id, &error, &ctx).await {
            PipelineDecision::RestartNode => {
                if opts.max_node_restart_attempts == 0 {
                    return Err(PipelineError::Configuration {
                        node: node_id,
                        message: "RestartNode requires max_node_restart_attempts > 0".to_string(),
                    });
                }
                episode_restarts += 1;
                run_restarts += 1;
                if episode_restarts > opts.max_node_restart_attempts
                    || run_restarts > opts.max_sequential_node_attempts
                {
                    return Err(PipelineError::NodeFailure {
                        node: node_id,
                        attempts: run_restarts,
                        source: Box::new(error),
                    });
                }
                tracing::warn!(node = %node_id, restart = run_restarts, "restarting sink over remaining input");
            }
            PipelineDecision::ContinueWithoutNode => {
                tracing::warn!(node = %node_id, error = %error, "detaching sink, completing normally");
                return Ok(());
            }
            PipelineDecision::FailPipeline => {
                return Err(PipelineError::NodeFailure {
                    node: node_id,
                    attempts: run_restarts + 1,
                    source: Box::new(error),
                });
            }
        }
    }
}
