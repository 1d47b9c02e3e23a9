//! Compiled execution plans.
//!
//! Node contracts are generic, but a graph is assembled at run time, so
//! items cross node boundaries type-erased: each adapter downcasts once
//! per item at the pipe boundary, with type agreement already proven by
//! validation. Join and aggregate adapters instead un-erase whole pipes
//! and run their typed engines directly.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::exec::context::NodeExecutionContext;
use crate::graph::NodeId;
use crate::join::JoinNode;
use crate::pipe::Pipe;
use crate::window::AggregateNode;
use crate::{PipelineError, Result};

pub mod cache;
pub mod compiler;
pub mod node;

use node::{SinkNode, SourceNode, StreamTransformNode, TapNode, TransformNode};

/// A type-erased item crossing a node boundary.
pub type AnyItem = Box<dyn Any + Send>;

/// A pipe of type-erased items.
pub type DynPipe = Pipe<AnyItem>;

pub(crate) type BoxResultFuture<T> = BoxFuture<'static, Result<T>>;

/// Duplicates an erased item; captured where the concrete `Clone` impl is
/// known.
pub(crate) type CloneFn = Arc<dyn Fn(&AnyItem) -> Result<AnyItem> + Send + Sync>;

/// Box each item of a typed pipe, preserving name, count, and
/// cancellation.
pub(crate) fn erase_pipe<T: Send + 'static>(pipe: Pipe<T>) -> DynPipe {
    pipe.map(|item| Box::new(item) as AnyItem)
}

/// Downcast each item of an erased pipe back to `T`.
pub(crate) fn downcast_pipe<T: Send + 'static>(pipe: DynPipe, node: &NodeId) -> Pipe<T> {
    let node = node.clone();
    pipe.try_map(move |item| downcast_item::<T>(item, &node))
}

pub(crate) fn downcast_item<T: 'static>(item: AnyItem, node: &NodeId) -> Result<T> {
    item.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        PipelineError::Internal(format!(
            "type confusion at node '{}': item is not a {}",
            node,
            std::any::type_name::<T>()
        ))
    })
}

pub(crate) fn downcast_item_ref<'a, T: 'static>(item: &'a AnyItem, node: &NodeId) -> Result<&'a T> {
    item.downcast_ref::<T>().ok_or_else(|| {
        PipelineError::Internal(format!(
            "type confusion at node '{}': item is not a {}",
            node,
            std::any::type_name::<T>()
        ))
    })
}

/// Type-erased source contract.
pub(crate) trait ErasedSource: Send + Sync {
    fn init(&self, ctx: &NodeExecutionContext) -> Result<DynPipe>;
}

/// Type-erased 1-to-1 transform contract.
pub(crate) trait ErasedTransform: Send + Sync {
    fn apply(&self, item: AnyItem, ctx: Arc<NodeExecutionContext>) -> BoxResultFuture<AnyItem>;
    fn clone_input(&self, item: &AnyItem, node: &NodeId) -> Result<AnyItem>;
}

/// Type-erased stream transform contract.
pub(crate) trait ErasedStreamTransform: Send + Sync {
    fn apply(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> Result<DynPipe>;
}

/// Type-erased sink contract.
pub(crate) trait ErasedSink: Send + Sync {
    fn consume(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> BoxResultFuture<()>;
}

/// Type-erased join: un-erases both sides and runs the typed engine.
pub(crate) trait ErasedJoin: Send + Sync {
    fn run(
        &self,
        left: DynPipe,
        right: DynPipe,
        merge: crate::graph::MergeStrategy,
        ctx: Arc<NodeExecutionContext>,
    ) -> DynPipe;
}

/// Type-erased aggregate: un-erases the input and runs the typed engine.
pub(crate) trait ErasedAggregate: Send + Sync {
    fn run(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> DynPipe;
}

/// Type-erased tap contract.
pub(crate) trait ErasedTap: Send + Sync {
    fn observe(&self, item: &AnyItem, ctx: &NodeExecutionContext);
}

struct SourceAdapter<S>(Arc<S>);

impl<S: SourceNode> ErasedSource for SourceAdapter<S> {
    fn init(&self, ctx: &NodeExecutionContext) -> Result<DynPipe> {
        Ok(erase_pipe(self.0.init(ctx)?))
    }
}

struct TransformAdapter<T>(Arc<T>);

impl<T: TransformNode> ErasedTransform for TransformAdapter<T> {
    fn apply(&self, item: AnyItem, ctx: Arc<NodeExecutionContext>) -> BoxResultFuture<AnyItem> {
        let node = Arc::clone(&self.0);
        Box::pin(async move {
            let input = downcast_item::<T::Input>(item, ctx.node_id())?;
            let output = node.apply(input, &ctx).await?;
            Ok(Box::new(output) as AnyItem)
        })
    }

    fn clone_input(&self, item: &AnyItem, node: &NodeId) -> Result<AnyItem> {
        let input = downcast_item_ref::<T::Input>(item, node)?;
        Ok(Box::new(input.clone()) as AnyItem)
    }
}

struct StreamTransformAdapter<T>(Arc<T>);

impl<T: StreamTransformNode> ErasedStreamTransform for StreamTransformAdapter<T> {
    fn apply(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> Result<DynPipe> {
        let typed = downcast_pipe::<T::Input>(input, ctx.node_id());
        Ok(erase_pipe(self.0.apply(typed, &ctx)?))
    }
}

struct SinkAdapter<S>(Arc<S>);

impl<S: SinkNode> ErasedSink for SinkAdapter<S> {
    fn consume(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> BoxResultFuture<()> {
        let node = Arc::clone(&self.0);
        Box::pin(async move {
            let typed = downcast_pipe::<S::Input>(input, ctx.node_id());
            node.consume(typed, &ctx).await
        })
    }
}

struct JoinAdapter<J>(Arc<J>);

impl<J: JoinNode> ErasedJoin for JoinAdapter<J> {
    fn run(
        &self,
        left: DynPipe,
        right: DynPipe,
        merge: crate::graph::MergeStrategy,
        ctx: Arc<NodeExecutionContext>,
    ) -> DynPipe {
        let left = downcast_pipe::<J::Left>(left, ctx.node_id());
        let right = downcast_pipe::<J::Right>(right, ctx.node_id());
        erase_pipe(crate::join::run_join(
            Arc::clone(&self.0),
            left,
            right,
            merge,
            ctx,
        ))
    }
}

struct AggregateAdapter<A>(Arc<A>);

impl<A: AggregateNode> ErasedAggregate for AggregateAdapter<A> {
    fn run(&self, input: DynPipe, ctx: Arc<NodeExecutionContext>) -> DynPipe {
        let typed = downcast_pipe::<A::Input>(input, ctx.node_id());
        erase_pipe(crate::window::run_aggregate(Arc::clone(&self.0), typed, ctx))
    }
}

struct TapAdapter<T>(Arc<T>);

impl<T: TapNode> ErasedTap for TapAdapter<T> {
    fn observe(&self, item: &AnyItem, ctx: &NodeExecutionContext) {
        match item.downcast_ref::<T::Item>() {
            Some(item) => self.0.observe(item, ctx),
            None => tracing::error!(
                node = %ctx.node_id(),
                "tap received an item of an unexpected type"
            ),
        }
    }
}

/// A node instance with its contract erased, ready for plan compilation.
#[derive(Clone)]
pub(crate) enum ErasedNode {
    Source(Arc<dyn ErasedSource>),
    Transform(Arc<dyn ErasedTransform>),
    StreamTransform(Arc<dyn ErasedStreamTransform>),
    Sink(Arc<dyn ErasedSink>),
    Join(Arc<dyn ErasedJoin>),
    Aggregate(Arc<dyn ErasedAggregate>),
    Tap(Arc<dyn ErasedTap>),
    Branch(CloneFn),
}

impl ErasedNode {
    pub(crate) fn source<S: SourceNode>(instance: S) -> Self {
        ErasedNode::Source(Arc::new(SourceAdapter(Arc::new(instance))))
    }

    pub(crate) fn transform<T: TransformNode>(instance: T) -> Self {
        ErasedNode::Transform(Arc::new(TransformAdapter(Arc::new(instance))))
    }

    pub(crate) fn stream_transform<T: StreamTransformNode>(instance: T) -> Self {
        ErasedNode::StreamTransform(Arc::new(StreamTransformAdapter(Arc::new(instance))))
    }

    pub(crate) fn sink<S: SinkNode>(instance: S) -> Self {
        ErasedNode::Sink(Arc::new(SinkAdapter(Arc::new(instance))))
    }

    pub(crate) fn join<J: JoinNode>(instance: J) -> Self {
        ErasedNode::Join(Arc::new(JoinAdapter(Arc::new(instance))))
    }

    pub(crate) fn aggregate<A: AggregateNode>(instance: A) -> Self {
        ErasedNode::Aggregate(Arc::new(AggregateAdapter(Arc::new(instance))))
    }

    pub(crate) fn tap<T: TapNode>(instance: T) -> Self {
        ErasedNode::Tap(Arc::new(TapAdapter(Arc::new(instance))))
    }

    pub(crate) fn branch<T: Clone + Send + 'static>() -> Self {
        ErasedNode::Branch(Arc::new(|item: &AnyItem| {
            let typed = item.downcast_ref::<T>().ok_or_else(|| {
                PipelineError::Internal(format!(
                    "type confusion at branch: item is not a {}",
                    std::any::type_name::<T>()
                ))
            })?;
            Ok(Box::new(typed.clone()) as AnyItem)
        }))
    }

    pub(crate) fn kind_label(&self) -> &'static str {
        match self {
            ErasedNode::Source(_) => "source",
            ErasedNode::Transform(_) => "transform",
            ErasedNode::StreamTransform(_) => "stream-transform",
            ErasedNode::Sink(_) => "sink",
            ErasedNode::Join(_) => "join",
            ErasedNode::Aggregate(_) => "aggregate",
            ErasedNode::Tap(_) => "tap",
            ErasedNode::Branch(_) => "branch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn erase_and_downcast_round_trip() {
        let node = NodeId::new("transform-1");
        let pipe = Pipe::from_values("numbers", vec![1u32, 2, 3]);
        let erased = erase_pipe(pipe);
        assert_eq!(erased.count(), Some(3));
        let typed = downcast_pipe::<u32>(erased, &node);
        assert_eq!(typed.collect().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn downcast_mismatch_is_an_internal_error() {
        let node = NodeId::new("transform-1");
        let erased = erase_pipe(Pipe::from_values("numbers", vec![1u32]));
        let mut typed = downcast_pipe::<String>(erased, &node);
        match typed.next().await {
            Some(Err(PipelineError::Internal(msg))) => assert!(msg.contains("transform-1")),
            other => panic!("expected internal error, got {:?}", other.map(|r| r.is_ok())),
        }
    }
}
