//! Keyed join engine.
//!
//! Each side keeps a per-key waiting list. An arriving item combines with
//! every waiting item of the opposite side under the same key (Cartesian
//! product per key), then parks itself for future arrivals. Outer join
//! variants emit their one-sided fallbacks for unmatched items at
//! end-of-input, or at purge time when a time window bounds matching.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_stream::stream;
use chrono::{DateTime, Duration, Utc};
use smallvec::SmallVec;

use crate::exec::context::NodeExecutionContext;
use crate::graph::MergeStrategy;
use crate::pipe::Pipe;
use crate::PipelineError;

/// The matching variant of a join node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Discard unmatched items on both sides
    Inner,
    /// Emit the left fallback for unmatched left items
    LeftOuter,
    /// Emit the right fallback for unmatched right items
    RightOuter,
    /// Emit both fallbacks
    FullOuter,
}

impl JoinType {
    fn emits_left_only(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn emits_right_only(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

/// Time-window constraint for a join: two items match only when their
/// timestamps differ by at most `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinWindow {
    /// Maximum timestamp distance between matching items
    pub size: Duration,
}

/// Side tag distinguishing the two inputs of a join once they share one
/// stream. Self-joins rely on this: two streams of the same element type
/// stay distinguishable, and the engine unwraps the tag before invoking
/// the user's combine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinSide<L, R> {
    /// An item from the left input
    Left(L),
    /// An item from the right input
    Right(R),
}

/// A keyed join node combining `Left` and `Right` items into outputs.
pub trait JoinNode: Send + Sync + 'static {
    /// Join key
    type Key: Eq + Hash + Clone + Send + 'static;
    /// Left element type
    type Left: Send + 'static;
    /// Right element type
    type Right: Send + 'static;
    /// Output element type
    type Output: Send + 'static;

    /// The matching variant.
    fn join_type(&self) -> JoinType;

    /// Optional time window; when set, both timestamp extractors must
    /// return values.
    fn window(&self) -> Option<JoinWindow> {
        None
    }

    /// Key of a left item.
    fn left_key(&self, item: &Self::Left) -> Self::Key;

    /// Key of a right item.
    fn right_key(&self, item: &Self::Right) -> Self::Key;

    /// Combine a matched pair.
    fn combine(&self, left: &Self::Left, right: &Self::Right) -> Self::Output;

    /// Fallback for an unmatched left item under outer variants.
    fn left_only(&self, _item: &Self::Left) -> Option<Self::Output> {
        None
    }

    /// Fallback for an unmatched right item under outer variants.
    fn right_only(&self, _item: &Self::Right) -> Option<Self::Output> {
        None
    }

    /// Event time of a left item; required when a window is set.
    fn left_timestamp(&self, _item: &Self::Left) -> Option<DateTime<Utc>> {
        None
    }

    /// Event time of a right item; required when a window is set.
    fn right_timestamp(&self, _item: &Self::Right) -> Option<DateTime<Utc>> {
        None
    }
}

struct Parked<T> {
    item: Option<T>,
    ts: Option<DateTime<Utc>>,
    matched: bool,
}

struct WaitingSide<K, T> {
    items: Vec<Parked<T>>,
    by_key: HashMap<K, SmallVec<[usize; 4]>>,
}

impl<K: Eq + Hash + Clone, T> WaitingSide<K, T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    fn park(&mut self, key: K, item: T, ts: Option<DateTime<Utc>>, matched: bool) {
        let idx = self.items.len();
        self.items.push(Parked {
            item: Some(item),
            ts,
            matched,
        });
        self.by_key.entry(key).or_default().push(idx);
    }
}

fn within_window(
    window: Option<JoinWindow>,
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> bool {
    match (window, a, b) {
        (Some(window), Some(a), Some(b)) => {
            let delta = if a >= b { a - b } else { b - a };
            delta <= window.size
        }
        (Some(_), _, _) => false,
        (None, _, _) => true,
    }
}

/// Drive a join node over its two input pipes.
///
/// The merge strategy decides arrival interleaving: `Concat` drains the
/// left side fully before the right, `Interleave` alternates. A custom
/// merge delegate is not supported on join nodes and falls back to
/// interleaving.
pub(crate) fn run_join<J: JoinNode>(
    node: Arc<J>,
    mut left: Pipe<J::Left>,
    mut right: Pipe<J::Right>,
    merge: MergeStrategy,
    ctx: Arc<NodeExecutionContext>,
) -> Pipe<J::Output> {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    if merge == MergeStrategy::Custom {
        tracing::warn!(
            node = %ctx.node_id(),
            "custom merge is not supported on join nodes; interleaving inputs"
        );
    }
    let stream = stream! {
        let join_type = node.join_type();
        let window = node.window();
        let mut lefts: WaitingSide<J::Key, J::Left> = WaitingSide::new();
        let mut rights: WaitingSide<J::Key, J::Right> = WaitingSide::new();
        let mut watermark: Option<DateTime<Utc>> = None;
        let mut left_done = false;
        let mut right_done = false;
        let mut prefer_left = true;

        loop {
            if ctx.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }
            if left_done && right_done {
                break;
            }
            let take_left = match merge {
                MergeStrategy::Concat => !left_done,
                MergeStrategy::Interleave | MergeStrategy::Custom => {
                    let choice = if left_done {
                        false
                    } else if right_done {
                        true
                    } else {
                        prefer_left
                    };
                    prefer_left = !prefer_left;
                    choice
                }
            };

            let event: JoinSide<J::Left, J::Right> = if take_left {
                match left.next().await {
                    Some(Ok(item)) => JoinSide::Left(item),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => {
                        left_done = true;
                        continue;
                    }
                }
            } else {
                match right.next().await {
                    Some(Ok(item)) => JoinSide::Right(item),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => {
                        right_done = true;
                        continue;
                    }
                }
            };

            match event {
                JoinSide::Left(item) => {
                    let key = node.left_key(&item);
                    let ts = node.left_timestamp(&item);
                    if window.is_some() {
                        let Some(ts) = ts else {
                            yield Err(PipelineError::Configuration {
                                node: ctx.node_id().clone(),
                                message: "windowed join requires left_timestamp".to_string(),
                            });
                            return;
                        };
                        watermark = Some(watermark.map_or(ts, |w| w.max(ts)));
                        for out in purge::<J>(&node, &mut lefts, &mut rights, window, watermark, join_type) {
                            yield Ok(out);
                        }
                    }
                    let mut matched = false;
                    if let Some(indices) = rights.by_key.get(&key) {
                        for &idx in indices {
                            let parked = &mut rights.items[idx];
                            let Some(r) = parked.item.as_ref() else { continue };
                            if !within_window(window, ts, parked.ts) {
                                continue;
                            }
                            parked.matched = true;
                            matched = true;
                            yield Ok(node.combine(&item, r));
                        }
                    }
                    lefts.park(key, item, ts, matched);
                }
                JoinSide::Right(item) => {
                    let key = node.right_key(&item);
                    let ts = node.right_timestamp(&item);
                    if window.is_some() {
                        let Some(ts) = ts else {
                            yield Err(PipelineError::Configuration {
                                node: ctx.node_id().clone(),
                                message: "windowed join requires right_timestamp".to_string(),
                            });
                            return;
                        };
                        watermark = Some(watermark.map_or(ts, |w| w.max(ts)));
                        for out in purge::<J>(&node, &mut lefts, &mut rights, window, watermark, join_type) {
                            yield Ok(out);
                        }
                    }
                    let mut matched = false;
                    if let Some(indices) = lefts.by_key.get(&key) {
                        for &idx in indices {
                            let parked = &mut lefts.items[idx];
                            let Some(l) = parked.item.as_ref() else { continue };
                            if !within_window(window, parked.ts, ts) {
                                continue;
                            }
                            parked.matched = true;
                            matched = true;
                            yield Ok(node.combine(l, &item));
                        }
                    }
                    rights.park(key, item, ts, matched);
                }
            }
        }

        // End-of-input flush: one-sided fallbacks in arrival order.
        if join_type.emits_left_only() {
            for parked in &mut lefts.items {
                if parked.matched {
                    continue;
                }
                if let Some(item) = parked.item.take() {
                    if let Some(out) = node.left_only(&item) {
                        yield Ok(out);
                    }
                }
            }
        }
        if join_type.emits_right_only() {
            for parked in &mut rights.items {
                if parked.matched {
                    continue;
                }
                if let Some(item) = parked.item.take() {
                    if let Some(out) = node.right_only(&item) {
                        yield Ok(out);
                    }
                }
            }
        }
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

/// Drop parked items that can no longer match because they fell behind
/// the high watermark by more than the window. Unmatched items on an
/// outer side emit their fallback here, since no future match exists.
fn purge<J: JoinNode>(
    node: &Arc<J>,
    lefts: &mut WaitingSide<J::Key, J::Left>,
    rights: &mut WaitingSide<J::Key, J::Right>,
    window: Option<JoinWindow>,
    watermark: Option<DateTime<Utc>>,
    join_type: JoinType,
) -> Vec<J::Output> {
    let (Some(window), Some(watermark)) = (window, watermark) else {
        return Vec::new();
    };
    let horizon = watermark - window.size;
    let mut out = Vec::new();
    for parked in &mut lefts.items {
        if parked.ts.map_or(false, |ts| ts < horizon) {
            if let Some(item) = parked.item.take() {
                if !parked.matched && join_type.emits_left_only() {
                    if let Some(output) = node.left_only(&item) {
                        out.push(output);
                    }
                }
            }
        }
    }
    for parked in &mut rights.items {
        if parked.ts.map_or(false, |ts| ts < horizon) {
            if let Some(item) = parked.item.take() {
                if !parked.matched && join_type.emits_right_only() {
                    if let Some(output) = node.right_only(&item) {
                        out.push(output);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::context::{NodeExecutionContext, PipelineContext};
    use crate::graph::NodeId;

    fn test_ctx() -> Arc<NodeExecutionContext> {
        Arc::new(NodeExecutionContext::snapshot(
            Arc::new(PipelineContext::new()),
            NodeId::new("join-1"),
        ))
    }

    struct PairJoin {
        join_type: JoinType,
    }

    impl JoinNode for PairJoin {
        type Key = u32;
        type Left = (u32, &'static str);
        type Right = (u32, i64);
        type Output = (u32, &'static str, i64);

        fn join_type(&self) -> JoinType {
            self.join_type
        }

        fn left_key(&self, item: &Self::Left) -> u32 {
            item.0
        }

        fn right_key(&self, item: &Self::Right) -> u32 {
            item.0
        }

        fn combine(&self, left: &Self::Left, right: &Self::Right) -> Self::Output {
            (left.0, left.1, right.1)
        }

        fn left_only(&self, item: &Self::Left) -> Option<Self::Output> {
            Some((item.0, item.1, -1))
        }

        fn right_only(&self, item: &Self::Right) -> Option<Self::Output> {
            Some((item.0, "?", item.1))
        }
    }

    #[tokio::test]
    async fn inner_join_discards_unmatched() {
        let node = Arc::new(PairJoin {
            join_type: JoinType::Inner,
        });
        let left = Pipe::from_values("left", vec![(1, "a"), (2, "b"), (3, "c")]);
        let right = Pipe::from_values("right", vec![(1, 10i64), (2, 20)]);
        let out = run_join(node, left, right, MergeStrategy::Concat, test_ctx())
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![(1, "a", 10), (2, "b", 20)]);
    }

    #[tokio::test]
    async fn full_outer_emits_both_fallbacks() {
        let node = Arc::new(PairJoin {
            join_type: JoinType::FullOuter,
        });
        let left = Pipe::from_values("left", vec![(1, "a"), (4, "d")]);
        let right = Pipe::from_values("right", vec![(1, 10i64), (9, 90)]);
        let out = run_join(node, left, right, MergeStrategy::Concat, test_ctx())
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![(1, "a", 10), (4, "d", -1), (9, "?", 90)]);
    }

    #[tokio::test]
    async fn duplicate_keys_produce_cartesian_product() {
        let node = Arc::new(PairJoin {
            join_type: JoinType::Inner,
        });
        let left = Pipe::from_values("left", vec![(1, "a"), (1, "b")]);
        let right = Pipe::from_values("right", vec![(1, 10i64), (1, 20)]);
        let out = run_join(node, left, right, MergeStrategy::Concat, test_ctx())
            .collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.contains(&(1, "a", 10)));
        assert!(out.contains(&(1, "a", 20)));
        assert!(out.contains(&(1, "b", 10)));
        assert!(out.contains(&(1, "b", 20)));
    }

    struct WindowedJoin;

    impl JoinNode for WindowedJoin {
        type Key = u32;
        type Left = (u32, i64, &'static str);
        type Right = (u32, i64, i64);
        type Output = (&'static str, i64);

        fn join_type(&self) -> JoinType {
            JoinType::Inner
        }

        fn window(&self) -> Option<JoinWindow> {
            Some(JoinWindow {
                size: Duration::seconds(10),
            })
        }

        fn left_key(&self, item: &Self::Left) -> u32 {
            item.0
        }

        fn right_key(&self, item: &Self::Right) -> u32 {
            item.0
        }

        fn left_timestamp(&self, item: &Self::Left) -> Option<DateTime<Utc>> {
            DateTime::<Utc>::from_timestamp(item.1, 0)
        }

        fn right_timestamp(&self, item: &Self::Right) -> Option<DateTime<Utc>> {
            DateTime::<Utc>::from_timestamp(item.1, 0)
        }

        fn combine(&self, left: &Self::Left, right: &Self::Right) -> Self::Output {
            (left.2, right.2)
        }
    }

    #[tokio::test]
    async fn windowed_join_rejects_distant_timestamps() {
        let node = Arc::new(WindowedJoin);
        let left = Pipe::from_values("left", vec![(1, 0, "early"), (1, 100, "late")]);
        let right = Pipe::from_values("right", vec![(1, 5, 50i64), (1, 105, 51)]);
        let out = run_join(node, left, right, MergeStrategy::Interleave, test_ctx())
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![("early", 50), ("late", 51)]);
    }
}
