//! Per-node execution strategy configuration.

use std::time::Duration;

/// Behavior of a parallel strategy's inbound queue when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Apply backpressure upstream until space frees up
    Block,
    /// Evict the oldest queued item to admit the new one
    DropOldest,
    /// Discard the incoming item
    DropNewest,
}

impl QueuePolicy {
    /// Label used in the structural hash and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            QueuePolicy::Block => "block",
            QueuePolicy::DropOldest => "drop-oldest",
            QueuePolicy::DropNewest => "drop-newest",
        }
    }
}

/// Configuration for the parallel execution strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Number of concurrent workers
    pub degree: usize,
    /// Inbound queue bound; `None` means unbounded
    pub queue_capacity: Option<usize>,
    /// What to do when the inbound queue is full
    pub policy: QueuePolicy,
    /// Emit completions in input order instead of completion order
    pub preserve_ordering: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            degree: 4,
            queue_capacity: Some(16),
            policy: QueuePolicy::Block,
            preserve_ordering: true,
        }
    }
}

impl ParallelConfig {
    /// A config with the given worker count and defaults otherwise.
    pub fn with_degree(degree: usize) -> Self {
        Self {
            degree: degree.max(1),
            ..Self::default()
        }
    }
}

/// Configuration for the batching execution strategy.
///
/// Batching groups pulls for operational reasons (bulk writes, chunked
/// processing); it never reorders items, and edge element types are
/// unchanged by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum items per batch
    pub size: usize,
    /// Flush a partial batch after this long
    pub timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 32,
            timeout: Some(Duration::from_millis(100)),
        }
    }
}

/// The execution strategy selected for a node.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStrategy {
    /// One item at a time, order preserved, minimum overhead
    Sequential,
    /// A bounded worker pool with a queue policy
    Parallel(ParallelConfig),
    /// Chunked pulls, order preserved
    Batch(BatchConfig),
    /// Retry and restart wrapped around an inner strategy
    Resilient(Box<ExecutionStrategy>),
}

impl ExecutionStrategy {
    /// A resilient wrapper around `inner`.
    pub fn resilient(inner: ExecutionStrategy) -> Self {
        ExecutionStrategy::Resilient(Box::new(inner))
    }

    /// Whether this strategy (possibly through its wrapper) is resilient.
    pub fn is_resilient(&self) -> bool {
        matches!(self, ExecutionStrategy::Resilient(_))
    }

    /// The parallel config, looking through a resilient wrapper.
    pub fn parallel_config(&self) -> Option<&ParallelConfig> {
        match self {
            ExecutionStrategy::Parallel(cfg) => Some(cfg),
            ExecutionStrategy::Resilient(inner) => inner.parallel_config(),
            _ => None,
        }
    }

    /// Canonical tag fed into the structural graph hash.
    pub fn hash_tag(&self) -> String {
        match self {
            ExecutionStrategy::Sequential => "sequential".to_string(),
            ExecutionStrategy::Parallel(cfg) => format!(
                "parallel(d={},q={},{},{})",
                cfg.degree,
                cfg.queue_capacity
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| "unbounded".to_string()),
                cfg.policy.label(),
                if cfg.preserve_ordering { "ordered" } else { "unordered" },
            ),
            ExecutionStrategy::Batch(cfg) => format!(
                "batch(n={},t={})",
                cfg.size,
                cfg.timeout
                    .map(|t| format!("{}ms", t.as_millis()))
                    .unwrap_or_else(|| "none".to_string()),
            ),
            ExecutionStrategy::Resilient(inner) => format!("resilient({})", inner.hash_tag()),
        }
    }
}
