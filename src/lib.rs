//! # Flowline
//!
//! A streaming data-pipeline execution core for Rust.
//!
//! ## Overview
//!
//! Flowline executes directed acyclic graphs of typed processing nodes:
//! sources produce items, transforms map them, sinks terminate streams.
//! Execution is lazy and pull-driven with cooperative cancellation,
//! per-item retries, node restarts, cached compiled plans, and a choice
//! of execution strategies per node.
//!
//! ## Key Features
//!
//! - **Typed graph construction**: handles carry element types, so most
//!   wiring mistakes fail at compile time
//! - **Validation**: a structural rule set (core errors + extended
//!   warnings) runs before anything executes
//! - **Compiled plans**: per-node direct-dispatch closures, built once
//!   per graph structure and cached across runs
//! - **Execution strategies**: sequential, parallel with bounded queues,
//!   batching, and a resilient wrapper with retry and restart
//! - **Event-time engines**: keyed joins with optional time windows, and
//!   windowed aggregation with watermarks and lateness grace

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Graph validation failed before execution
    #[error("validation failed: {0}")]
    Validation(crate::validate::ValidationFailure),

    /// A runtime prerequisite was missing on a node
    #[error("configuration error on node '{node}': {message}")]
    Configuration {
        /// The node whose configuration is incomplete
        node: NodeId,
        /// The missing requirement
        message: String,
    },

    /// A node failed after exhausting its recovery budget
    #[error("node '{node}' failed after {attempts} attempt(s): {source}")]
    NodeFailure {
        /// The failing node
        node: NodeId,
        /// Attempts made before giving up
        attempts: u32,
        /// The original error
        #[source]
        source: Box<PipelineError>,
    },

    /// An item-level processing error raised by node code
    #[error("item error: {message}")]
    Item {
        /// Description of the failure
        message: String,
    },

    /// The shared cancellation handle was triggered
    #[error("pipeline cancelled")]
    Cancelled,

    /// Iteration was attempted on a closed pipe
    #[error("pipe '{0}' is closed")]
    PipeClosed(String),

    /// An edge could not be added to the graph
    #[error("cannot connect: {0}")]
    Connect(crate::graph::ConnectError),

    /// Graph structure error outside of validation
    #[error("graph error: {0}")]
    Graph(String),

    /// Dead-letter delivery failed
    #[error("dead-letter delivery failed: {0}")]
    DeadLetter(String),

    /// The JSON topology export failed to serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error for unexpected conditions
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Build an item-level error from any displayable cause.
    pub fn item(message: impl std::fmt::Display) -> Self {
        PipelineError::Item {
            message: message.to_string(),
        }
    }

    /// True when the error is (or wraps) a cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::NodeFailure { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

/// Graph model: node definitions, edges, typed handles, and the builder
pub mod graph;

/// Lazy, cancellation-aware data pipes
pub mod pipe;

/// Structural and configuration validation rules
pub mod validate;

/// Compiled per-node execution plans and the plan cache
pub mod plan;

/// Execution strategies, retry policies, and the pipeline context
pub mod exec;

/// Node- and pipeline-level error handling contracts
pub mod error;

/// Keyed join engine
pub mod join;

/// Event-time windowed aggregation engine
pub mod window;

/// Pipeline runner orchestration
pub mod runner;

/// Optional tracing bootstrap
pub mod telemetry;

pub use error::{DeadLetterEnvelope, DeadLetterSink, NodeDecision, NodeErrorHandler, PipelineDecision, PipelineErrorHandler};
pub use exec::context::{NodeExecutionContext, PipelineContext};
pub use exec::retry::{Backoff, DelayStrategy, Jitter, RetryOptions};
pub use exec::strategy::{BatchConfig, ExecutionStrategy, ParallelConfig, QueuePolicy};
pub use graph::builder::PipelineBuilder;
pub use graph::{MergeStrategy, NodeId, NodeKind, PipelineGraph};
pub use join::{JoinNode, JoinType, JoinWindow};
pub use pipe::Pipe;
pub use plan::cache::{InMemoryPlanCache, NullPlanCache, PlanCache};
pub use plan::node::{SinkNode, SourceNode, StreamTransformNode, TapNode, TransformNode};
pub use runner::{PipelineDefinition, PipelineRunner, RunReport};
pub use validate::{Diagnostic, Severity, ValidationOptions};
pub use window::{AggregateNode, WindowBounds, WindowSpec};
