//! Plan cache: compiled plans keyed by definition type and graph
//! structure, reused across runs.

use std::any::TypeId;

use dashmap::DashMap;

use crate::graph::PipelineGraph;
use crate::plan::compiler::CompiledPlans;

/// Cache of compiled execution plans.
///
/// Keys combine the pipeline definition's type identity with the graph's
/// structural hash, so a definition whose graph shape changes compiles
/// fresh plans while an unchanged one reuses the cached set. Writes under
/// the same key are last-writer-wins; that is benign because equal keys
/// imply equivalent plans.
pub trait PlanCache: Send + Sync {
    /// Look up plans for a definition and graph. `None` means miss.
    fn try_get(&self, definition: TypeId, graph: &PipelineGraph) -> Option<CompiledPlans>;

    /// Store plans for a definition and graph.
    fn put(&self, definition: TypeId, graph: &PipelineGraph, plans: CompiledPlans);

    /// Drop all cached plans.
    fn clear(&self);

    /// Number of cached plan sets.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default concurrency-safe in-memory cache. No size cap; replace the
/// implementation to add eviction.
#[derive(Default)]
pub struct InMemoryPlanCache {
    entries: DashMap<(TypeId, String), CompiledPlans>,
}

impl InMemoryPlanCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanCache for InMemoryPlanCache {
    fn try_get(&self, definition: TypeId, graph: &PipelineGraph) -> Option<CompiledPlans> {
        self.entries
            .get(&(definition, graph.structural_hash().to_string()))
            .map(|entry| entry.value().clone())
    }

    fn put(&self, definition: TypeId, graph: &PipelineGraph, plans: CompiledPlans) {
        self.entries
            .insert((definition, graph.structural_hash().to_string()), plans);
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A cache that never hits and discards every put.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlanCache;

impl PlanCache for NullPlanCache {
    fn try_get(&self, _definition: TypeId, _graph: &PipelineGraph) -> Option<CompiledPlans> {
        None
    }

    fn put(&self, _definition: TypeId, _graph: &PipelineGraph, _plans: CompiledPlans) {}

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }
}
