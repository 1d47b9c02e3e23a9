//! Merging multiple inbound pipes into one, for multi-inbound nodes.

use std::sync::Arc;

use async_stream::stream;
use tokio_util::sync::CancellationToken;

use crate::graph::MergeStrategy;
use crate::pipe::Pipe;
use crate::plan::DynPipe;

/// User-provided merge delegate for [`MergeStrategy::Custom`].
pub type MergeFn = Arc<dyn Fn(Vec<DynPipe>) -> DynPipe + Send + Sync>;

/// Merge inbound pipes ahead of a multi-inbound node's apply.
pub(crate) fn merge_pipes(
    strategy: MergeStrategy,
    mut pipes: Vec<DynPipe>,
    custom: Option<MergeFn>,
    name: String,
    cancel: CancellationToken,
) -> DynPipe {
    if pipes.len() == 1 {
        return pipes.remove(0);
    }
    match strategy {
        MergeStrategy::Concat => concat(pipes, name, cancel),
        MergeStrategy::Interleave => interleave(pipes, name, cancel),
        MergeStrategy::Custom => match custom {
            Some(merge) => merge(pipes),
            None => {
                tracing::warn!(
                    node = name,
                    "custom merge strategy without a registered delegate; interleaving"
                );
                interleave(pipes, name, cancel)
            }
        },
    }
}

/// Drain each input fully, in declared edge order.
fn concat(pipes: Vec<DynPipe>, name: String, cancel: CancellationToken) -> DynPipe {
    let stream = stream! {
        for mut pipe in pipes {
            while let Some(item) = pipe.next().await {
                match item {
                    Ok(item) => yield Ok(item),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

/// Round-robin one item at a time across inputs, skipping exhausted ones.
fn interleave(pipes: Vec<DynPipe>, name: String, cancel: CancellationToken) -> DynPipe {
    let stream = stream! {
        let mut slots: Vec<Option<DynPipe>> = pipes.into_iter().map(Some).collect();
        let mut remaining = slots.len();
        let mut idx = 0;
        while remaining > 0 {
            if let Some(pipe) = slots[idx].as_mut() {
                match pipe.next().await {
                    Some(Ok(item)) => yield Ok(item),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => {
                        slots[idx] = None;
                        remaining -= 1;
                    }
                }
            }
            idx = (idx + 1) % slots.len();
        }
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::erase_pipe;

    async fn collect_i64(pipe: DynPipe) -> Vec<i64> {
        pipe.try_map(|item| {
            crate::plan::downcast_item::<i64>(item, &crate::graph::NodeId::new("merge"))
        })
        .collect()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn concat_drains_in_declared_order() {
        let a = erase_pipe(Pipe::from_values("a", vec![1i64, 2]));
        let b = erase_pipe(Pipe::from_values("b", vec![10i64, 20]));
        let merged = merge_pipes(
            MergeStrategy::Concat,
            vec![a, b],
            None,
            "merge".into(),
            CancellationToken::new(),
        );
        assert_eq!(collect_i64(merged).await, vec![1, 2, 10, 20]);
    }

    #[tokio::test]
    async fn interleave_round_robins() {
        let a = erase_pipe(Pipe::from_values("a", vec![1i64, 2, 3]));
        let b = erase_pipe(Pipe::from_values("b", vec![10i64]));
        let merged = merge_pipes(
            MergeStrategy::Interleave,
            vec![a, b],
            None,
            "merge".into(),
            CancellationToken::new(),
        );
        assert_eq!(collect_i64(merged).await, vec![1, 10, 2, 3]);
    }
}
