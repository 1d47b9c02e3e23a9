//! Error-handling contracts: node- and pipeline-level decisions, handler
//! traits, and dead-letter routing.
//!
//! Item errors are handled locally by a node-level handler without tearing
//! the pipeline down; node errors go to the pipeline-level handler, which
//! decides between restart, detach, and failure.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::exec::context::NodeExecutionContext;
use crate::graph::NodeId;
use crate::plan::AnyItem;
use crate::{PipelineError, Result};

/// What to do with a single failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDecision {
    /// Discard the item and continue
    Skip,
    /// Schedule a delayed retry, up to the per-item budget
    Retry,
    /// Forward the item to the dead-letter sink and continue
    DeadLetter,
    /// Re-raise the error, escalating to the pipeline level
    Fail,
}

/// What to do with a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDecision {
    /// Restart the node, replaying from the materialization buffer
    RestartNode,
    /// Detach the node; its output edge carries an end-of-stream
    ContinueWithoutNode,
    /// Terminate the run with the original error
    FailPipeline,
}

/// Node-level error handler for items of type `T`.
#[async_trait]
pub trait NodeErrorHandler<T: Send + Sync>: Send + Sync {
    /// Decide what to do with `item` after `error`.
    async fn handle(
        &self,
        item: &T,
        error: &PipelineError,
        ctx: &NodeExecutionContext,
    ) -> NodeDecision;
}

/// Pipeline-level error handler consulted when a node fails outside the
/// per-item path or exhausts its item-retry budget.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync {
    /// Decide the fate of the failing node.
    async fn handle_node_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        ctx: &NodeExecutionContext,
    ) -> PipelineDecision;
}

/// A failed item and its failure context, as delivered to the dead-letter
/// sink.
pub struct DeadLetterEnvelope {
    /// The item the pipeline decided not to process
    pub item: AnyItem,
    /// The error that triggered the decision
    pub error: Arc<PipelineError>,
    /// The node the item failed in
    pub node: NodeId,
    /// The attempt number at the time of the decision
    pub attempt: u32,
}

impl DeadLetterEnvelope {
    /// Borrow the item as `T`, when the types line up.
    pub fn item_as<T: 'static>(&self) -> Option<&T> {
        self.item.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for DeadLetterEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterEnvelope")
            .field("node", &self.node)
            .field("attempt", &self.attempt)
            .field("error", &self.error)
            .finish()
    }
}

/// External collaborator receiving items the pipeline decided not to
/// process. Delivery is at-least-once; implementations must be safe to
/// call concurrently.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Deliver one envelope.
    async fn send(&self, envelope: DeadLetterEnvelope, ctx: &NodeExecutionContext) -> Result<()>;
}

/// Type-erased node error handler stored on the pipeline context.
pub(crate) trait ErasedNodeErrorHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        item: &'a AnyItem,
        error: &'a PipelineError,
        ctx: &'a NodeExecutionContext,
    ) -> BoxFuture<'a, NodeDecision>;
}

struct NodeErrorHandlerAdapter<T> {
    inner: Arc<dyn NodeErrorHandler<T>>,
}

impl<T: Send + Sync + 'static> ErasedNodeErrorHandler for NodeErrorHandlerAdapter<T> {
    fn handle<'a>(
        &'a self,
        item: &'a AnyItem,
        error: &'a PipelineError,
        ctx: &'a NodeExecutionContext,
    ) -> BoxFuture<'a, NodeDecision> {
        let typed = item.downcast_ref::<T>();
        Box::pin(async move {
            match typed {
                Some(typed) => self.inner.handle(typed, error, ctx).await,
                None => {
                    tracing::error!(
                        node = %ctx.node_id(),
                        "error handler received an item of an unexpected type"
                    );
                    NodeDecision::Fail
                }
            }
        })
    }
}

pub(crate) fn erase_node_error_handler<T: Send + Sync + 'static>(
    handler: Arc<dyn NodeErrorHandler<T>>,
) -> Arc<dyn ErasedNodeErrorHandler> {
    Arc::new(NodeErrorHandlerAdapter { inner: handler })
}
