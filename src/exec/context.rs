//! Per-run pipeline context and the per-node execution snapshot.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DeadLetterSink, ErasedNodeErrorHandler, PipelineErrorHandler};
use crate::exec::retry::{JitterState, RetryOptions};
use crate::graph::NodeId;

/// Shared, per-run pipeline state.
///
/// The context is handed to every node. Item and parameter maps support
/// concurrent reads; writes are the caller's responsibility and must
/// happen before a node's execution window opens or after it closes.
pub struct PipelineContext {
    run_id: Uuid,
    cancellation: CancellationToken,
    items: DashMap<String, Arc<dyn Any + Send + Sync>>,
    parameters: DashMap<String, String>,
    retry: RwLock<RetryOptions>,
    node_retry: RwLock<HashMap<NodeId, RetryOptions>>,
    dead_letter: RwLock<Option<Arc<dyn DeadLetterSink>>>,
    pipeline_handler: RwLock<Option<Arc<dyn PipelineErrorHandler>>>,
    node_handlers: RwLock<HashMap<NodeId, Arc<dyn ErasedNodeErrorHandler>>>,
    jitter_states: DashMap<NodeId, Arc<JitterState>>,
    current_node: Mutex<Option<NodeId>>,
    log_items: AtomicBool,
    trace_spans: AtomicBool,
}

impl PipelineContext {
    /// A fresh context with a new run id and cancellation token.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
            items: DashMap::new(),
            parameters: DashMap::new(),
            retry: RwLock::new(RetryOptions::default()),
            node_retry: RwLock::new(HashMap::new()),
            dead_letter: RwLock::new(None),
            pipeline_handler: RwLock::new(None),
            node_handlers: RwLock::new(HashMap::new()),
            jitter_states: DashMap::new(),
            current_node: Mutex::new(None),
            log_items: AtomicBool::new(false),
            trace_spans: AtomicBool::new(false),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The unique id of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The shared cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel the run cooperatively.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Store a keyed item, readable by any node.
    pub fn insert_item<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Arc::new(value));
    }

    /// Read a keyed item as `T`.
    pub fn item<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.items
            .get(key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    /// Set a string parameter.
    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    /// Read a string parameter.
    pub fn parameter(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(|v| v.clone())
    }

    /// Set the pipeline-wide retry options.
    pub fn set_retry_options(&self, options: RetryOptions) {
        *self.retry.write() = options;
    }

    /// The pipeline-wide retry options.
    pub fn retry_options(&self) -> RetryOptions {
        self.retry.read().clone()
    }

    /// Override retry options for one node.
    pub fn set_node_retry_options(&self, node: NodeId, options: RetryOptions) {
        self.node_retry.write().insert(node, options);
    }

    /// The effective retry options for `node`.
    pub fn retry_for(&self, node: &NodeId) -> RetryOptions {
        self.node_retry
            .read()
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.retry.read().clone())
    }

    /// Install the dead-letter sink.
    pub fn set_dead_letter_sink(&self, sink: Arc<dyn DeadLetterSink>) {
        *self.dead_letter.write() = Some(sink);
    }

    /// The dead-letter sink, when one is configured.
    pub fn dead_letter_sink(&self) -> Option<Arc<dyn DeadLetterSink>> {
        self.dead_letter.read().clone()
    }

    /// Install the pipeline-level error handler.
    pub fn set_pipeline_error_handler(&self, handler: Arc<dyn PipelineErrorHandler>) {
        *self.pipeline_handler.write() = Some(handler);
    }

    /// The pipeline-level error handler, when one is registered.
    pub fn pipeline_error_handler(&self) -> Option<Arc<dyn PipelineErrorHandler>> {
        self.pipeline_handler.read().clone()
    }

    pub(crate) fn set_node_error_handler(
        &self,
        node: NodeId,
        handler: Arc<dyn ErasedNodeErrorHandler>,
    ) {
        self.node_handlers.write().insert(node, handler);
    }

    pub(crate) fn node_error_handler(
        &self,
        node: &NodeId,
    ) -> Option<Arc<dyn ErasedNodeErrorHandler>> {
        self.node_handlers.read().get(node).cloned()
    }

    /// Decorrelated-jitter state for `node`, created on first use.
    pub(crate) fn jitter_state(&self, node: &NodeId) -> Arc<JitterState> {
        self.jitter_states
            .entry(node.clone())
            .or_insert_with(|| Arc::new(JitterState::new()))
            .clone()
    }

    /// Record the node the runner is about to invoke.
    pub fn set_current_node(&self, node: Option<NodeId>) {
        *self.current_node.lock() = node;
    }

    /// The node the runner most recently invoked.
    pub fn current_node(&self) -> Option<NodeId> {
        self.current_node.lock().clone()
    }

    /// Enable per-item logging in execution engines.
    pub fn set_log_items(&self, enabled: bool) {
        self.log_items.store(enabled, Ordering::Relaxed);
    }

    /// Whether per-item logging is enabled.
    pub fn log_items(&self) -> bool {
        self.log_items.load(Ordering::Relaxed)
    }

    /// Enable tracing spans around node invocations.
    pub fn set_trace_spans(&self, enabled: bool) {
        self.trace_spans.store(enabled, Ordering::Relaxed);
    }

    /// Whether tracing spans are enabled.
    pub fn trace_spans(&self) -> bool {
        self.trace_spans.load(Ordering::Relaxed)
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("items", &self.items.len())
            .field("parameters", &self.parameters.len())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// Per-node execution snapshot.
///
/// Captured at node start: retry options, the cancellation token, and the
/// tracing/logging flags. The snapshot is assumed stable for the duration
/// of the node's execution window; debug builds verify that on exit.
pub struct NodeExecutionContext {
    node_id: NodeId,
    retry: RetryOptions,
    cancellation: CancellationToken,
    log_items: bool,
    trace_spans: bool,
    pipeline: Arc<PipelineContext>,
}

impl NodeExecutionContext {
    pub(crate) fn snapshot(pipeline: Arc<PipelineContext>, node_id: NodeId) -> Self {
        Self {
            retry: pipeline.retry_for(&node_id),
            cancellation: pipeline.cancellation().clone(),
            log_items: pipeline.log_items(),
            trace_spans: pipeline.trace_spans(),
            pipeline,
            node_id,
        }
    }

    /// The node this snapshot belongs to.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Retry options captured at node start.
    pub fn retry(&self) -> &RetryOptions {
        &self.retry
    }

    /// The shared cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether per-item logging was enabled at node start.
    pub fn log_items(&self) -> bool {
        self.log_items
    }

    /// Whether tracing spans were enabled at node start.
    pub fn trace_spans(&self) -> bool {
        self.trace_spans
    }

    /// The shared pipeline context.
    pub fn pipeline(&self) -> &Arc<PipelineContext> {
        &self.pipeline
    }

    /// Verify the snapshot still matches the context at window exit.
    ///
    /// Mutating retry options or flags during a node's execution window is
    /// a programming error. Debug builds re-read the context here and
    /// report the offending field; release builds elide the check.
    pub(crate) fn finish_window(&self) {
        #[cfg(debug_assertions)]
        {
            let mut violations: Vec<&'static str> = Vec::new();
            if self.pipeline.retry_for(&self.node_id) != self.retry {
                violations.push("retry options");
            }
            if self.pipeline.log_items() != self.log_items {
                violations.push("log_items");
            }
            if self.pipeline.trace_spans() != self.trace_spans {
                violations.push("trace_spans");
            }
            if !violations.is_empty() {
                tracing::error!(
                    node = %self.node_id,
                    fields = ?violations,
                    "execution snapshot mutated during node execution window"
                );
                debug_assert!(
                    violations.is_empty(),
                    "node '{}' snapshot mutated during execution window: {:?}",
                    self.node_id,
                    violations
                );
            }
        }
    }
}

impl std::fmt::Debug for NodeExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutionContext")
            .field("node_id", &self.node_id)
            .field("log_items", &self.log_items)
            .field("trace_spans", &self.trace_spans)
            .finish()
    }
}
