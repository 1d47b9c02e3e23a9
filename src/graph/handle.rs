//! Typed, opaque handles returned by builder `add_*` operations.
//!
//! A handle carries only its node id and the element types the node
//! declared. Connections are checked at compile time through the
//! [`Outputs`] and [`Inputs`] marker traits: `connect(a, b)` only compiles
//! when the element type `a` produces equals the one `b` consumes.

use std::marker::PhantomData;

use crate::graph::node::NodeId;

/// Implemented by handles whose node produces items of type `T`.
pub trait Outputs<T> {
    /// The id of the producing node.
    fn node_id(&self) -> &NodeId;
}

/// Implemented by handles whose node consumes items of type `T`.
pub trait Inputs<T> {
    /// The id of the consuming node.
    fn node_id(&self) -> &NodeId;
}

macro_rules! handle_common {
    ($name:ident < $($p:ident),+ >) => {
        impl<$($p),+> $name<$($p),+> {
            pub(crate) fn for_node(id: NodeId) -> Self {
                Self { id, _marker: PhantomData }
            }

            /// The id of the node this handle refers to.
            pub fn id(&self) -> &NodeId {
                &self.id
            }
        }

        impl<$($p),+> Clone for $name<$($p),+> {
            fn clone(&self) -> Self {
                Self { id: self.id.clone(), _marker: PhantomData }
            }
        }

        impl<$($p),+> std::fmt::Debug for $name<$($p),+> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.id).finish()
            }
        }
    };
}

/// Handle to a source node producing `T`.
pub struct SourceHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}
handle_common!(SourceHandle<T>);

impl<T> Outputs<T> for SourceHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a 1-to-1 transform node mapping `I` to `O`.
pub struct TransformHandle<I, O> {
    id: NodeId,
    _marker: PhantomData<fn(I) -> O>,
}
handle_common!(TransformHandle<I, O>);

impl<I, O> Inputs<I> for TransformHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I, O> Outputs<O> for TransformHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a stream transform node rewriting a `Pipe<I>` into a `Pipe<O>`.
pub struct StreamTransformHandle<I, O> {
    id: NodeId,
    _marker: PhantomData<fn(I) -> O>,
}
handle_common!(StreamTransformHandle<I, O>);

impl<I, O> Inputs<I> for StreamTransformHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I, O> Outputs<O> for StreamTransformHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a sink node consuming `T`.
pub struct SinkHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T)>,
}
handle_common!(SinkHandle<T>);

impl<T> Inputs<T> for SinkHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a tap node observing `T` items as they pass through.
pub struct TapHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T) -> T>,
}
handle_common!(TapHandle<T>);

impl<T> Inputs<T> for TapHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<T> Outputs<T> for TapHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a branch node duplicating `T` items to several downstream
/// edges.
pub struct BranchHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T) -> T>,
}
handle_common!(BranchHandle<T>);

impl<T> Inputs<T> for BranchHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<T> Outputs<T> for BranchHandle<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to a join node keyed by `K`, combining `L` and `R` into `O`.
///
/// Join inputs are wired through
/// [`connect_join_left`](crate::graph::builder::PipelineBuilder::connect_join_left)
/// and
/// [`connect_join_right`](crate::graph::builder::PipelineBuilder::connect_join_right)
/// rather than the generic `connect`, because the two sides are distinct
/// ports with their own element types.
pub struct JoinHandle<K, L, R, O> {
    id: NodeId,
    _marker: PhantomData<fn(K, L, R) -> O>,
}
handle_common!(JoinHandle<K, L, R, O>);

impl<K, L, R, O> Outputs<O> for JoinHandle<K, L, R, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

/// Handle to an aggregate node folding `I` items into `O` outputs.
pub struct AggregateHandle<I, O> {
    id: NodeId,
    _marker: PhantomData<fn(I) -> O>,
}
handle_common!(AggregateHandle<I, O>);

impl<I, O> Inputs<I> for AggregateHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I, O> Outputs<O> for AggregateHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}
