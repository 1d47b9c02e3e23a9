//! Parallel and batching strategies through the runner: ordering
//! guarantees, multiset equivalence, and the degree-1 boundary.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flowline::{
    BatchConfig, NodeExecutionContext, ParallelConfig, Pipe, PipelineBuilder, PipelineContext,
    PipelineDefinition, PipelineRunner, QueuePolicy, Result, SinkNode, SourceNode, TransformNode,
};

const INPUT: std::ops::Range<i64> = 0..24;

#[derive(Default)]
struct NumberSource;

impl SourceNode for NumberSource {
    type Output = i64;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<i64>> {
        Ok(Pipe::from_values("numbers", INPUT.collect()))
    }
}

/// Doubles each item after a delay that shrinks with the value, so later
/// items finish before earlier ones under parallel execution.
#[derive(Default)]
struct SlowDouble;

#[async_trait]
impl TransformNode for SlowDouble {
    type Input = i64;
    type Output = i64;

    async fn apply(&self, item: i64, _ctx: &NodeExecutionContext) -> Result<i64> {
        let millis = 12u64.saturating_sub(item as u64 / 2);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(item * 2)
    }
}

#[derive(Default)]
struct CollectSink;

#[async_trait]
impl SinkNode for CollectSink {
    type Input = i64;

    async fn consume(&self, mut input: Pipe<i64>, ctx: &NodeExecutionContext) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<i64>>>("collected")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

fn parallel_config(degree: usize, preserve_ordering: bool) -> ParallelConfig {
    ParallelConfig {
        degree,
        queue_capacity: Some(8),
        policy: QueuePolicy::Block,
        preserve_ordering,
    }
}

struct OrderedParallel;

impl Default for OrderedParallel {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for OrderedParallel {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<NumberSource>("numbers");
        let double = builder.add_transform::<SlowDouble>("double");
        let sink = builder.add_sink::<CollectSink>("collect");
        builder.connect(&source, &double)?;
        builder.connect(&double, &sink)?;
        builder.set_parallel(double.id(), parallel_config(4, true))?;
        Ok(())
    }
}

struct UnorderedParallel;

impl Default for UnorderedParallel {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for UnorderedParallel {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<NumberSource>("numbers");
        let double = builder.add_transform::<SlowDouble>("double");
        let sink = builder.add_sink::<CollectSink>("collect");
        builder.connect(&source, &double)?;
        builder.connect(&double, &sink)?;
        builder.set_parallel(double.id(), parallel_config(4, false))?;
        Ok(())
    }
}

struct DegreeOneParallel;

impl Default for DegreeOneParallel {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for DegreeOneParallel {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<NumberSource>("numbers");
        let double = builder.add_transform::<SlowDouble>("double");
        let sink = builder.add_sink::<CollectSink>("collect");
        builder.connect(&source, &double)?;
        builder.connect(&double, &sink)?;
        builder.set_parallel(double.id(), parallel_config(1, false))?;
        Ok(())
    }
}

struct BatchedChain;

impl Default for BatchedChain {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for BatchedChain {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<NumberSource>("numbers");
        let double = builder.add_transform::<SlowDouble>("double");
        let sink = builder.add_sink::<CollectSink>("collect");
        builder.connect(&source, &double)?;
        builder.connect(&double, &sink)?;
        builder.set_batch(
            double.id(),
            BatchConfig {
                size: 5,
                timeout: Some(Duration::from_millis(200)),
            },
        )?;
        Ok(())
    }
}

async fn run_and_collect<D: PipelineDefinition + Default>() -> Vec<i64> {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("collected", Mutex::new(Vec::<i64>::new()));
    let collected = ctx.item::<Mutex<Vec<i64>>>("collected").unwrap();
    runner.run_with::<D>(ctx).await.expect("run should succeed");
    let collected = collected.lock().unwrap().clone();
    collected
}

fn expected() -> Vec<i64> {
    INPUT.map(|n| n * 2).collect()
}

#[tokio::test]
async fn preserve_ordering_matches_sequential_output() {
    assert_eq!(run_and_collect::<OrderedParallel>().await, expected());
}

#[tokio::test]
async fn unordered_parallel_preserves_the_multiset() {
    let mut collected = run_and_collect::<UnorderedParallel>().await;
    collected.sort_unstable();
    assert_eq!(collected, expected());
}

#[tokio::test]
async fn degree_one_behaves_like_sequential() {
    assert_eq!(run_and_collect::<DegreeOneParallel>().await, expected());
}

#[tokio::test]
async fn batching_preserves_order_within_and_across_batches() {
    assert_eq!(run_and_collect::<BatchedChain>().await, expected());
}
