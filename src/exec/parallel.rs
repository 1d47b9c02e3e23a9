//! Parallel execution: a bounded inbound queue feeding a worker pool.
//!
//! The feeder pulls from the input pipe and enqueues under the configured
//! policy: `Block` applies backpressure upstream, the drop policies shed
//! load. Workers run the item function concurrently and report
//! completions tagged with the input sequence number; with
//! `preserve_ordering` a reorder buffer emits them in input order,
//! otherwise completions emit as they become ready.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_stream::stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::exec::context::NodeExecutionContext;
use crate::exec::strategy::{ParallelConfig, QueuePolicy};
use crate::exec::{ItemApplied, ItemFn};
use crate::pipe::Pipe;
use crate::plan::{AnyItem, DynPipe};
use crate::{PipelineError, Result};

struct QueueInner {
    items: VecDeque<(u64, AnyItem)>,
    closed: bool,
}

/// Bounded multi-producer work queue with pluggable overflow policy.
struct WorkQueue {
    inner: Mutex<QueueInner>,
    capacity: Option<usize>,
    policy: QueuePolicy,
    ready: Notify,
    space: Notify,
}

enum Pushed {
    Queued,
    DroppedIncoming,
    DroppedOldest(u64),
}

impl WorkQueue {
    fn new(capacity: Option<usize>, policy: QueuePolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity,
            policy,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    async fn push(&self, seq: u64, item: AnyItem) -> Pushed {
        let mut slot = Some(item);
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                let full = self
                    .capacity
                    .map_or(false, |cap| inner.items.len() >= cap);
                if !full {
                    if let Some(item) = slot.take() {
                        inner.items.push_back((seq, item));
                        self.ready.notify_one();
                    }
                    return Pushed::Queued;
                }
                match self.policy {
                    QueuePolicy::Block => {}
                    QueuePolicy::DropOldest => {
                        let dropped = inner.items.pop_front().map(|(s, _)| s);
                        if let Some(item) = slot.take() {
                            inner.items.push_back((seq, item));
                            self.ready.notify_one();
                        }
                        return match dropped {
                            Some(old) => Pushed::DroppedOldest(old),
                            None => Pushed::Queued,
                        };
                    }
                    QueuePolicy::DropNewest => return Pushed::DroppedIncoming,
                }
            }
            space.await;
        }
    }

    async fn pop(&self) -> Option<(u64, AnyItem)> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.items.pop_front() {
                    self.space.notify_one();
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_waiters();
    }
}

/// Drive an item function over the input pipe with `cfg.degree` workers.
pub(crate) fn run(
    cfg: ParallelConfig,
    item_fn: ItemFn,
    mut input: DynPipe,
    ctx: Arc<NodeExecutionContext>,
) -> DynPipe {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    let degree = cfg.degree.max(1);
    let queue = Arc::new(WorkQueue::new(cfg.queue_capacity, cfg.policy));
    let (out_tx, mut out_rx) =
        mpsc::channel::<(u64, Result<ItemApplied>)>(degree.saturating_mul(2).max(4));

    // Feeder: pull upstream, enqueue under the policy, report drops so the
    // reorder buffer never stalls on a gap.
    {
        let queue = Arc::clone(&queue);
        let out_tx = out_tx.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut seq: u64 = 0;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancellation().cancelled() => None,
                    next = input.next() => next,
                };
                let Some(pulled) = next else { break };
                match pulled {
                    Ok(item) => {
                        let this = seq;
                        seq += 1;
                        let pushed = tokio::select! {
                            biased;
                            _ = ctx.cancellation().cancelled() => break,
                            pushed = queue.push(this, item) => pushed,
                        };
                        match pushed {
                            Pushed::Queued => {}
                            Pushed::DroppedIncoming => {
                                tracing::debug!(node = %ctx.node_id(), seq = this, "queue full, dropping incoming item");
                                if out_tx.send((this, Ok(ItemApplied::Drop))).await.is_err() {
                                    break;
                                }
                            }
                            Pushed::DroppedOldest(old) => {
                                tracing::debug!(node = %ctx.node_id(), seq = old, "queue full, dropping oldest item");
                                if out_tx.send((old, Ok(ItemApplied::Drop))).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let this = seq;
                        let _ = out_tx.send((this, Err(e))).await;
                        break;
                    }
                }
            }
            queue.close();
        });
    }

    for _ in 0..degree {
        let queue = Arc::clone(&queue);
        let out_tx = out_tx.clone();
        let item_fn = Arc::clone(&item_fn);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Some((seq, item)) = queue.pop().await {
                let applied = tokio::select! {
                    biased;
                    _ = ctx.cancellation().cancelled() => Err(PipelineError::Cancelled),
                    applied = item_fn(item, Arc::clone(&ctx)) => applied,
                };
                if out_tx.send((seq, applied)).await.is_err() {
                    return;
                }
            }
        });
    }
    drop(out_tx);

    let preserve_ordering = cfg.preserve_ordering;
    let stream = stream! {
        let mut next_expected: u64 = 0;
        let mut pending: BTreeMap<u64, Result<ItemApplied>> = BTreeMap::new();
        while let Some((seq, applied)) = out_rx.recv().await {
            if preserve_ordering {
                pending.insert(seq, applied);
                while let Some(applied) = pending.remove(&next_expected) {
                    next_expected += 1;
                    match applied {
                        Ok(ItemApplied::Emit(out)) => yield Ok(out),
                        Ok(ItemApplied::Drop) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            } else {
                match applied {
                    Ok(ItemApplied::Emit(out)) => yield Ok(out),
                    Ok(ItemApplied::Drop) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
        // Workers are gone; anything still buffered is complete and in order.
        for (_, applied) in pending {
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
    Pipe::new(name, stream).with_cancellation(cancel)
}
