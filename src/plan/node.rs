//! The typed node contracts user code implements.
//!
//! Join and aggregate contracts live with their engines in
//! [`crate::join`] and [`crate::window`].

use async_trait::async_trait;

use crate::exec::context::NodeExecutionContext;
use crate::pipe::Pipe;
use crate::Result;

/// A node producing items without an upstream.
///
/// `init` returns synchronously with a lazy pipe; production happens as
/// downstream pulls, under the context's cancellation token.
pub trait SourceNode: Send + Sync + 'static {
    /// Element type produced
    type Output: Send + 'static;

    /// Create the output pipe. Called once per run.
    fn init(&self, ctx: &NodeExecutionContext) -> Result<Pipe<Self::Output>>;
}

/// A 1-to-1 transform applied to each item.
///
/// Inputs must be `Clone` so the resilient strategy can retry an attempt,
/// forward a failed item to the dead-letter sink, and keep the restart
/// materialization buffer.
#[async_trait]
pub trait TransformNode: Send + Sync + 'static {
    /// Element type consumed
    type Input: Clone + Send + 'static;
    /// Element type produced
    type Output: Send + 'static;

    /// Map one item. May suspend; must observe the context's cancellation.
    async fn apply(&self, item: Self::Input, ctx: &NodeExecutionContext) -> Result<Self::Output>;
}

/// A transform that rewrites a whole stream rather than single items.
pub trait StreamTransformNode: Send + Sync + 'static {
    /// Element type consumed
    type Input: Send + 'static;
    /// Element type produced
    type Output: Send + 'static;

    /// Wrap the input pipe into the output pipe. Called once per run;
    /// the returned pipe is pulled lazily.
    fn apply(
        &self,
        input: Pipe<Self::Input>,
        ctx: &NodeExecutionContext,
    ) -> Result<Pipe<Self::Output>>;
}

/// A node terminating a stream.
#[async_trait]
pub trait SinkNode: Send + Sync + 'static {
    /// Element type consumed
    type Input: Send + 'static;

    /// Drain the input pipe. Completion of every sink completes the run.
    async fn consume(&self, input: Pipe<Self::Input>, ctx: &NodeExecutionContext) -> Result<()>;
}

/// A node observing items as they pass through unchanged.
pub trait TapNode: Send + Sync + 'static {
    /// Element type observed
    type Item: Send + 'static;

    /// Called for each item. Must not block.
    fn observe(&self, item: &Self::Item, ctx: &NodeExecutionContext);
}
