//! Event-time windowed aggregation.
//!
//! Items are assigned to windows by their event time, not arrival time.
//! A monotone watermark trails the highest observed event time by the
//! node's lateness grace; a window closes and emits once the watermark
//! crosses its end, and items whose every target window has already
//! closed are late: dropped, or routed to the dead-letter sink when one
//! is configured.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_stream::stream;
use chrono::{DateTime, Duration, Utc};

use crate::error::DeadLetterEnvelope;
use crate::exec::context::NodeExecutionContext;
use crate::pipe::Pipe;
use crate::{PipelineError, Result};

/// Event-time window variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Non-overlapping windows of `size`, anchored at the epoch
    Tumbling {
        /// Window duration
        size: Duration,
    },
    /// Windows of `size` starting every `step`
    Sliding {
        /// Window duration
        size: Duration,
        /// Distance between window starts
        step: Duration,
    },
    /// Windows that grow while the inter-event gap stays within `gap` and
    /// close after `gap` of inactivity
    Session {
        /// Maximum inactivity inside one session
        gap: Duration,
    },
}

impl WindowSpec {
    fn validate(&self, node: &crate::graph::NodeId) -> Result<()> {
        let positive = |d: Duration, what: &str| {
            if d <= Duration::zero() {
                Err(PipelineError::Configuration {
                    node: node.clone(),
                    message: format!("window {what} must be positive"),
                })
            } else {
                Ok(())
            }
        };
        match self {
            WindowSpec::Tumbling { size } => positive(*size, "size"),
            WindowSpec::Sliding { size, step } => {
                positive(*size, "size")?;
                positive(*step, "step")
            }
            WindowSpec::Session { gap } => positive(*gap, "gap"),
        }
    }
}

/// The half-open `[start, end)` interval of one window instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

/// A node folding keyed items into event-time windows.
pub trait AggregateNode: Send + Sync + 'static {
    /// Element type consumed
    type Input: Send + 'static;
    /// Grouping key
    type Key: Eq + Hash + Clone + Send + 'static;
    /// Per-window accumulation state
    type State: Send + 'static;
    /// Element type produced on window close
    type Output: Send + 'static;

    /// The window variant.
    fn window(&self) -> WindowSpec;

    /// Grace period: the watermark trails the highest event time by this
    /// much, keeping windows open for late arrivals.
    fn max_lateness(&self) -> Duration {
        Duration::zero()
    }

    /// Grouping key of an item.
    fn key(&self, item: &Self::Input) -> Self::Key;

    /// Event time of an item.
    fn timestamp(&self, item: &Self::Input) -> DateTime<Utc>;

    /// Fresh state for a newly opened window.
    fn init(&self, key: &Self::Key, window: &WindowBounds) -> Self::State;

    /// Fold one item into the window state. Called in arrival order.
    fn fold(&self, state: &mut Self::State, item: &Self::Input);

    /// Reduce the state of a closing window to an output item.
    fn finalize(&self, key: &Self::Key, window: &WindowBounds, state: Self::State) -> Self::Output;
}

struct OpenWindow<S> {
    bounds: WindowBounds,
    state: S,
}

struct KeyWindows<S> {
    seq: u64,
    open: Vec<OpenWindow<S>>,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| PipelineError::Internal(format!("window bound {ms}ms out of range")))
}

fn assign_windows(spec: WindowSpec, ts: DateTime<Utc>) -> Result<Vec<WindowBounds>> {
    let ts_ms = ts.timestamp_millis();
    match spec {
        WindowSpec::Tumbling { size } => {
            let size_ms = size.num_milliseconds();
            let start = ts_ms.div_euclid(size_ms) * size_ms;
            Ok(vec![WindowBounds {
                start: from_millis(start)?,
                end: from_millis(start + size_ms)?,
            }])
        }
        WindowSpec::Sliding { size, step } => {
            let size_ms = size.num_milliseconds();
            let step_ms = step.num_milliseconds();
            let mut start = ts_ms.div_euclid(step_ms) * step_ms;
            let mut bounds = Vec::new();
            while start + size_ms > ts_ms {
                bounds.push(WindowBounds {
                    start: from_millis(start)?,
                    end: from_millis(start + size_ms)?,
                });
                start -= step_ms;
            }
            // Oldest window first, matching close order.
            bounds.reverse();
            Ok(bounds)
        }
        WindowSpec::Session { .. } => Ok(Vec::new()),
    }
}

/// Drive an aggregate node over its input pipe.
pub(crate) fn run_aggregate<A: AggregateNode>(
    node: Arc<A>,
    mut input: Pipe<A::Input>,
    ctx: Arc<NodeExecutionContext>,
) -> Pipe<A::Output> {
    let name = format!("{}", ctx.node_id());
    let cancel = ctx.cancellation().clone();
    let stream = stream! {
        let spec = node.window();
        if let Err(e) = spec.validate(ctx.node_id()) {
            yield Err(e);
            return;
        }
        let grace = node.max_lateness();
        let mut watermark: Option<DateTime<Utc>> = None;
        let mut keys: HashMap<A::Key, KeyWindows<A::State>> = HashMap::new();
        let mut next_seq: u64 = 0;

        while let Some(item) = input.next().await {
            if ctx.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let ts = node.timestamp(&item);
            let key = node.key(&item);

            let folded = match spec {
                WindowSpec::Session { gap } => {
                    fold_session(&node, &mut keys, &mut next_seq, key.clone(), &item, ts, gap, watermark)
                }
                _ => {
                    match assign_windows(spec, ts) {
                        Ok(targets) => {
                            fold_fixed(&node, &mut keys, &mut next_seq, key.clone(), &item, watermark, targets)
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            };

            if !folded {
                // Late: every target window already closed under the
                // current watermark.
                tracing::debug!(
                    node = %ctx.node_id(),
                    event_time = %ts,
                    watermark = ?watermark,
                    "dropping late event"
                );
                if let Some(sink) = ctx.pipeline().dead_letter_sink() {
                    let envelope = DeadLetterEnvelope {
                        item: Box::new(item),
                        error: Arc::new(PipelineError::item("event time behind watermark")),
                        node: ctx.node_id().clone(),
                        attempt: 1,
                    };
                    if let Err(e) = sink.send(envelope, &ctx).await {
                        yield Err(e);
                        return;
                    }
                }
                continue;
            }

            let candidate = ts - grace;
            if watermark.map_or(true, |w| candidate > w) {
                watermark = Some(candidate);
            }
            for output in close_ready(&node, &mut keys, watermark) {
                yield Ok(output);
            }
        }

        // End of input closes everything still open.
        let mut closing: Vec<(DateTime<Utc>, u64, A::Key, WindowBounds, A::State)> = Vec::new();
        for (key, kw) in keys.iter_mut() {
            for open in kw.open.drain(..) {
                closing.push((open.bounds.end, kw.seq, key.clone(), open.bounds, open.state));
            }
        }
        closing.sort_by_key(|(end, seq, _, _, _)| (*end, *seq));
        for (_, _, key, bounds, state) in closing {
            yield Ok(node.finalize(&key, &bounds, state));
        }
    };
    Pipe::new(name, stream).with_cancellation(cancel)
}

/// Fold into tumbling/sliding target windows. Returns false when the item
/// is late (no target window is still open).
#[allow(clippy::too_many_arguments)]
fn fold_fixed<A: AggregateNode>(
    node: &Arc<A>,
    keys: &mut HashMap<A::Key, KeyWindows<A::State>>,
    next_seq: &mut u64,
    key: A::Key,
    item: &A::Input,
    watermark: Option<DateTime<Utc>>,
    targets: Vec<WindowBounds>,
) -> bool {
    let open_targets: Vec<WindowBounds> = targets
        .into_iter()
        .filter(|b| watermark.map_or(true, |w| b.end > w))
        .collect();
    if open_targets.is_empty() {
        return false;
    }
    let kw = keys.entry(key.clone()).or_insert_with(|| {
        let seq = *next_seq;
        *next_seq += 1;
        KeyWindows {
            seq,
            open: Vec::new(),
        }
    });
    for bounds in open_targets {
        match kw.open.iter_mut().find(|w| w.bounds == bounds) {
            Some(open) => node.fold(&mut open.state, item),
            None => {
                let mut state = node.init(&key, &bounds);
                node.fold(&mut state, item);
                kw.open.push(OpenWindow { bounds, state });
            }
        }
    }
    true
}

/// Fold into a session window, extending and merging sessions as needed.
#[allow(clippy::too_many_arguments)]
fn fold_session<A: AggregateNode>(
    node: &Arc<A>,
    keys: &mut HashMap<A::Key, KeyWindows<A::State>>,
    next_seq: &mut u64,
    key: A::Key,
    item: &A::Input,
    ts: DateTime<Utc>,
    gap: Duration,
    watermark: Option<DateTime<Utc>>,
) -> bool {
    if watermark.map_or(false, |w| ts < w) {
        return false;
    }
    let kw = keys.entry(key.clone()).or_insert_with(|| {
        let seq = *next_seq;
        *next_seq += 1;
        KeyWindows {
            seq,
            open: Vec::new(),
        }
    });
    // A session accepts the event when it lands within gap of its span.
    // Out-of-order arrivals can leave two sessions transiently
    // overlapping; they close independently, since states cannot be
    // merged without a user-level merge operation.
    let position = kw
        .open
        .iter()
        .position(|w| ts >= w.bounds.start - gap && ts < w.bounds.end);
    match position {
        Some(idx) => {
            let open = &mut kw.open[idx];
            open.bounds.start = open.bounds.start.min(ts);
            open.bounds.end = open.bounds.end.max(ts + gap);
            node.fold(&mut open.state, item);
        }
        None => {
            let bounds = WindowBounds {
                start: ts,
                end: ts + gap,
            };
            let mut state = node.init(&key, &bounds);
            node.fold(&mut state, item);
            kw.open.push(OpenWindow { bounds, state });
        }
    }
    true
}

/// Close and finalize every window whose end the watermark has crossed.
/// Outputs come back ordered by window end time, ties by key first-seen
/// order.
fn close_ready<A: AggregateNode>(
    node: &Arc<A>,
    keys: &mut HashMap<A::Key, KeyWindows<A::State>>,
    watermark: Option<DateTime<Utc>>,
) -> Vec<A::Output> {
    let Some(watermark) = watermark else {
        return Vec::new();
    };
    let mut closing: Vec<(DateTime<Utc>, u64, A::Key, WindowBounds, A::State)> = Vec::new();
    for (key, kw) in keys.iter_mut() {
        let mut idx = 0;
        while idx < kw.open.len() {
            if kw.open[idx].bounds.end <= watermark {
                let open = kw.open.remove(idx);
                closing.push((open.bounds.end, kw.seq, key.clone(), open.bounds, open.state));
            } else {
                idx += 1;
            }
        }
    }
    closing.sort_by_key(|(end, seq, _, _, _)| (*end, *seq));
    closing
        .into_iter()
        .map(|(_, _, key, bounds, state)| node.finalize(&key, &bounds, state))
        .collect()
}
