//! Resilient-strategy tests: per-item retry with backoff, dead-letter
//! routing, node restart, detachment, and restart prerequisites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowline::{
    Backoff, DeadLetterEnvelope, DeadLetterSink, DelayStrategy, ExecutionStrategy,
    NodeDecision, NodeErrorHandler, NodeExecutionContext, Pipe, PipelineBuilder,
    PipelineContext, PipelineDecision, PipelineDefinition, PipelineError, PipelineErrorHandler,
    PipelineRunner, Result, RetryOptions, SinkNode, SourceNode, TransformNode,
};

#[derive(Default)]
struct SingleWordSource;

impl SourceNode for SingleWordSource {
    type Output = String;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<String>> {
        Ok(Pipe::from_values("words", vec!["X".to_string()]))
    }
}

/// Fails the first two attempts for every item, succeeds on the third.
#[derive(Default)]
struct FlakyTransform;

#[async_trait]
impl TransformNode for FlakyTransform {
    type Input = String;
    type Output = String;

    async fn apply(&self, item: String, ctx: &NodeExecutionContext) -> Result<String> {
        let attempts = ctx
            .pipeline()
            .item::<AtomicU32>("attempts")
            .expect("attempt counter registered");
        let seen = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if seen < 3 {
            Err(PipelineError::item(format!("transient failure {seen}")))
        } else {
            Ok(item)
        }
    }
}

#[derive(Default)]
struct CollectSink;

#[async_trait]
impl SinkNode for CollectSink {
    type Input = String;

    async fn consume(&self, mut input: Pipe<String>, ctx: &NodeExecutionContext) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<String>>>("collected")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct RetryHandler;

#[async_trait]
impl NodeErrorHandler<String> for RetryHandler {
    async fn handle(
        &self,
        _item: &String,
        _error: &PipelineError,
        _ctx: &NodeExecutionContext,
    ) -> NodeDecision {
        NodeDecision::Retry
    }
}

struct RetryPipeline;

impl Default for RetryPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for RetryPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<SingleWordSource>("words");
        let flaky = builder.add_transform::<FlakyTransform>("flaky");
        let sink = builder.add_sink::<CollectSink>("collect");
        builder.connect(&source, &flaky)?;
        builder.connect(&flaky, &sink)?;
        builder.set_resilient(flaky.id())?;
        builder.set_node_error_handler(&flaky, Arc::new(RetryHandler))?;
        builder.set_retry_options(
            RetryOptions::default()
                .with_item_retries(3)
                .with_delay(DelayStrategy::backoff_only(Backoff::exponential(
                    Duration::from_millis(10),
                    Duration::from_secs(1),
                ))),
        );
        Ok(())
    }
}

#[tokio::test]
async fn retry_succeeds_on_third_attempt_with_backoff() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("attempts", AtomicU32::new(0));
    ctx.insert_item("collected", Mutex::new(Vec::<String>::new()));
    let attempts = ctx.item::<AtomicU32>("attempts").unwrap();
    let collected = ctx.item::<Mutex<Vec<String>>>("collected").unwrap();

    let started = Instant::now();
    runner.run_with::<RetryPipeline>(ctx).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(*collected.lock().unwrap(), vec!["X"]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Exponential backoff: 10ms after the first failure, 20ms after the
    // second.
    assert!(elapsed >= Duration::from_millis(28), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
}

// --- dead-letter routing ---------------------------------------------

#[derive(Default)]
struct AmountSource;

impl SourceNode for AmountSource {
    type Output = i64;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<i64>> {
        Ok(Pipe::from_values("amounts", vec![100, -5, 50, 0, 75]))
    }
}

#[derive(Default)]
struct AmountValidator;

#[async_trait]
impl TransformNode for AmountValidator {
    type Input = i64;
    type Output = i64;

    async fn apply(&self, item: i64, _ctx: &NodeExecutionContext) -> Result<i64> {
        if item <= 0 {
            Err(PipelineError::item(format!("amount {item} must be positive")))
        } else {
            Ok(item)
        }
    }
}

#[derive(Default)]
struct AmountSink;

#[async_trait]
impl SinkNode for AmountSink {
    type Input = i64;

    async fn consume(&self, mut input: Pipe<i64>, ctx: &NodeExecutionContext) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<i64>>>("amounts")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct DeadLetterHandler;

#[async_trait]
impl NodeErrorHandler<i64> for DeadLetterHandler {
    async fn handle(
        &self,
        _item: &i64,
        _error: &PipelineError,
        _ctx: &NodeExecutionContext,
    ) -> NodeDecision {
        NodeDecision::DeadLetter
    }
}

/// Records envelopes into the "dead-letters" context item, so a
/// factory-created sink stays observable from the test.
#[derive(Default)]
struct ContextDeadLetters;

#[async_trait]
impl DeadLetterSink for ContextDeadLetters {
    async fn send(&self, envelope: DeadLetterEnvelope, ctx: &NodeExecutionContext) -> Result<()> {
        let received = ctx
            .pipeline()
            .item::<Mutex<Vec<(i64, String, u32)>>>("dead-letters")
            .expect("dead-letter collector registered");
        let item = *envelope.item_as::<i64>().expect("i64 envelope");
        received
            .lock()
            .unwrap()
            .push((item, envelope.node.to_string(), envelope.attempt));
        Ok(())
    }
}

struct DeadLetterPipeline;

impl Default for DeadLetterPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for DeadLetterPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<AmountSource>("amounts");
        let validator = builder.add_transform::<AmountValidator>("validate");
        let sink = builder.add_sink::<AmountSink>("collect");
        builder.connect(&source, &validator)?;
        builder.connect(&validator, &sink)?;
        builder.set_resilient(validator.id())?;
        builder.set_node_error_handler(&validator, Arc::new(DeadLetterHandler))?;
        builder.set_dead_letter_sink(Arc::new(ContextDeadLetters));
        Ok(())
    }
}

#[tokio::test]
async fn rejected_items_route_to_the_dead_letter_sink() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("amounts", Mutex::new(Vec::<i64>::new()));
    ctx.insert_item("dead-letters", Mutex::new(Vec::<(i64, String, u32)>::new()));
    let collected = ctx.item::<Mutex<Vec<i64>>>("amounts").unwrap();
    let dead = ctx
        .item::<Mutex<Vec<(i64, String, u32)>>>("dead-letters")
        .unwrap();

    runner
        .run_with::<DeadLetterPipeline>(ctx)
        .await
        .expect("dead-lettered items must not fail the pipeline");

    assert_eq!(*collected.lock().unwrap(), vec![100, 50, 75]);
    assert_eq!(
        *dead.lock().unwrap(),
        vec![
            (-5, "transform-1".to_string(), 1),
            (0, "transform-1".to_string(), 1),
        ]
    );
}

// --- node restart ----------------------------------------------------

#[derive(Default)]
struct FiveNumberSource;

impl SourceNode for FiveNumberSource {
    type Output = i64;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<i64>> {
        Ok(Pipe::from_values("numbers", (1..=5).collect()))
    }
}

/// Fails the first time it sees item 3, succeeds after a restart.
#[derive(Default)]
struct FailsOnceOnThree;

#[async_trait]
impl TransformNode for FailsOnceOnThree {
    type Input = i64;
    type Output = i64;

    async fn apply(&self, item: i64, ctx: &NodeExecutionContext) -> Result<i64> {
        if item == 3 {
            let failures = ctx
                .pipeline()
                .item::<AtomicU32>("failures")
                .expect("failure counter registered");
            if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PipelineError::item("item 3 failed this time"));
            }
        }
        Ok(item * 10)
    }
}

#[derive(Default)]
struct NumberSink;

#[async_trait]
impl SinkNode for NumberSink {
    type Input = i64;

    async fn consume(&self, mut input: Pipe<i64>, ctx: &NodeExecutionContext) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<i64>>>("numbers")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct RestartHandler;

#[async_trait]
impl PipelineErrorHandler for RestartHandler {
    async fn handle_node_failure(
        &self,
        _node: &flowline::NodeId,
        _error: &PipelineError,
        _ctx: &NodeExecutionContext,
    ) -> PipelineDecision {
        PipelineDecision::RestartNode
    }
}

struct RestartPipeline;

impl Default for RestartPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for RestartPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<FiveNumberSource>("numbers");
        let transform = builder.add_transform::<FailsOnceOnThree>("fragile");
        let sink = builder.add_sink::<NumberSink>("collect");
        builder.connect(&source, &transform)?;
        builder.connect(&transform, &sink)?;
        builder.set_resilient(transform.id())?;
        builder.add_pipeline_error_handler(Arc::new(RestartHandler));
        builder.set_retry_options(
            RetryOptions::default()
                .with_node_restarts(2)
                .with_materialized_items(8),
        );
        Ok(())
    }
}

#[tokio::test]
async fn restart_replays_the_failing_item_and_completes() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("failures", AtomicU32::new(0));
    ctx.insert_item("numbers", Mutex::new(Vec::<i64>::new()));
    let collected = ctx.item::<Mutex<Vec<i64>>>("numbers").unwrap();

    runner.run_with::<RestartPipeline>(ctx).await.unwrap();
    assert_eq!(*collected.lock().unwrap(), vec![10, 20, 30, 40, 50]);
}

struct MisconfiguredRestartPipeline;

impl Default for MisconfiguredRestartPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for MisconfiguredRestartPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<FiveNumberSource>("numbers");
        let transform = builder.add_transform::<FailsOnceOnThree>("fragile");
        let sink = builder.add_sink::<NumberSink>("collect");
        builder.connect(&source, &transform)?;
        builder.connect(&transform, &sink)?;
        builder.set_resilient(transform.id())?;
        builder.add_pipeline_error_handler(Arc::new(RestartHandler));
        // No max_materialized_items: the first restart attempt must fail
        // with a configuration error naming the requirement.
        builder.set_retry_options(RetryOptions::default().with_node_restarts(2));
        Ok(())
    }
}

#[tokio::test]
async fn restart_without_materialization_raises_configuration_error() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("failures", AtomicU32::new(0));
    ctx.insert_item("numbers", Mutex::new(Vec::<i64>::new()));

    let result = runner.run_with::<MisconfiguredRestartPipeline>(ctx).await;
    match result {
        Err(PipelineError::Configuration { node, message }) => {
            assert_eq!(node.as_str(), "transform-1");
            assert!(
                message.contains("max_materialized_items"),
                "message: {message}"
            );
        }
        other => panic!("expected configuration error, got {:?}", other.err()),
    }
}

// --- detachment ------------------------------------------------------

struct DetachHandler;

#[async_trait]
impl PipelineErrorHandler for DetachHandler {
    async fn handle_node_failure(
        &self,
        _node: &flowline::NodeId,
        _error: &PipelineError,
        _ctx: &NodeExecutionContext,
    ) -> PipelineDecision {
        PipelineDecision::ContinueWithoutNode
    }
}

/// Always fails item 3; with a detach handler the node drops out after
/// emitting 1 and 2.
#[derive(Default)]
struct AlwaysFailsOnThree;

#[async_trait]
impl TransformNode for AlwaysFailsOnThree {
    type Input = i64;
    type Output = i64;

    async fn apply(&self, item: i64, _ctx: &NodeExecutionContext) -> Result<i64> {
        if item == 3 {
            Err(PipelineError::item("item 3 always fails"))
        } else {
            Ok(item * 10)
        }
    }
}

struct DetachPipeline;

impl Default for DetachPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for DetachPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<FiveNumberSource>("numbers");
        let transform = builder.add_transform::<AlwaysFailsOnThree>("fragile");
        let sink = builder.add_sink::<NumberSink>("collect");
        builder.connect(&source, &transform)?;
        builder.connect(&transform, &sink)?;
        builder.set_resilient(transform.id())?;
        builder.add_pipeline_error_handler(Arc::new(DetachHandler));
        builder.set_retry_options(
            RetryOptions::default()
                .with_node_restarts(1)
                .with_materialized_items(4),
        );
        Ok(())
    }
}

#[tokio::test]
async fn continue_without_node_ends_the_stream_early() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("numbers", Mutex::new(Vec::<i64>::new()));
    let collected = ctx.item::<Mutex<Vec<i64>>>("numbers").unwrap();

    runner
        .run_with::<DetachPipeline>(ctx)
        .await
        .expect("detaching must complete the pipeline normally");
    assert_eq!(*collected.lock().unwrap(), vec![10, 20]);
}

// --- strategy wrapping -----------------------------------------------

#[tokio::test]
async fn set_resilient_wraps_the_current_strategy() {
    let mut builder = PipelineBuilder::new("demo");
    let source = builder.add_source::<FiveNumberSource>("numbers");
    let transform = builder.add_transform::<AlwaysFailsOnThree>("fragile");
    let sink = builder.add_sink::<NumberSink>("collect");
    builder.connect(&source, &transform).unwrap();
    builder.connect(&transform, &sink).unwrap();
    builder
        .set_strategy(
            transform.id(),
            ExecutionStrategy::Parallel(flowline::ParallelConfig::with_degree(2)),
        )
        .unwrap();
    builder.set_resilient(transform.id()).unwrap();
    let graph = builder.build().unwrap();
    let def = graph.node(transform.id()).unwrap();
    assert!(def.strategy.is_resilient());
    assert!(def.strategy.parallel_config().is_some());
}
