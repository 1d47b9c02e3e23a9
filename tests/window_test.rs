//! Windowed aggregation through the runner: tumbling windows with a
//! lateness grace, and the same stream without grace.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowline::{
    AggregateNode, NodeExecutionContext, Pipe, PipelineBuilder, PipelineContext,
    PipelineDefinition, PipelineRunner, Result, SinkNode, SourceNode, WindowBounds, WindowSpec,
};

#[derive(Debug, Clone, PartialEq)]
struct Event {
    at_secs: i64,
    value: i64,
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp in range")
}

/// Events in arrival order; the reading at 00:50 arrives after the high
/// watermark reached 01:10.
#[derive(Default)]
struct SensorReadings;

impl SourceNode for SensorReadings {
    type Output = Event;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<Event>> {
        Ok(Pipe::from_values(
            "readings",
            vec![
                Event { at_secs: 0, value: 1 },
                Event { at_secs: 30, value: 2 },
                Event { at_secs: 70, value: 3 },
                Event { at_secs: 50, value: 5 },
                Event { at_secs: 100, value: 4 },
            ],
        ))
    }
}

struct MinuteSums {
    grace_secs: i64,
}

impl AggregateNode for MinuteSums {
    type Input = Event;
    type Key = u8;
    type State = i64;
    type Output = (i64, i64);

    fn window(&self) -> WindowSpec {
        WindowSpec::Tumbling {
            size: Duration::seconds(60),
        }
    }

    fn max_lateness(&self) -> Duration {
        Duration::seconds(self.grace_secs)
    }

    fn key(&self, _event: &Event) -> u8 {
        0
    }

    fn timestamp(&self, event: &Event) -> DateTime<Utc> {
        at(event.at_secs)
    }

    fn init(&self, _key: &u8, _window: &WindowBounds) -> i64 {
        0
    }

    fn fold(&self, state: &mut i64, event: &Event) {
        *state += event.value;
    }

    fn finalize(&self, _key: &u8, window: &WindowBounds, state: i64) -> (i64, i64) {
        (window.start.timestamp(), state)
    }
}

#[derive(Default)]
struct WindowSink;

#[async_trait]
impl SinkNode for WindowSink {
    type Input = (i64, i64);

    async fn consume(
        &self,
        mut input: Pipe<(i64, i64)>,
        ctx: &NodeExecutionContext,
    ) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<(i64, i64)>>>("windows")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct GracefulSums;

impl Default for GracefulSums {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for GracefulSums {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<SensorReadings>("readings");
        let sums = builder.add_aggregate_with("minute-sums", || MinuteSums { grace_secs: 20 });
        let sink = builder.add_sink::<WindowSink>("collect");
        builder.connect(&source, &sums)?;
        builder.connect(&sums, &sink)?;
        Ok(())
    }
}

struct StrictSums;

impl Default for StrictSums {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for StrictSums {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let source = builder.add_source::<SensorReadings>("readings");
        let sums = builder.add_aggregate_with("minute-sums", || MinuteSums { grace_secs: 0 });
        let sink = builder.add_sink::<WindowSink>("collect");
        builder.connect(&source, &sums)?;
        builder.connect(&sums, &sink)?;
        Ok(())
    }
}

#[tokio::test]
async fn grace_admits_the_late_reading_into_its_window() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("windows", Mutex::new(Vec::<(i64, i64)>::new()));
    let collected = ctx.item::<Mutex<Vec<(i64, i64)>>>("windows").unwrap();

    runner.run_with::<GracefulSums>(ctx).await.unwrap();

    // [00:00, 01:00) sums 1 + 2 + 5, [01:00, 02:00) sums 3 + 4, emitted
    // in window-end order.
    assert_eq!(*collected.lock().unwrap(), vec![(0, 8), (60, 7)]);
}

#[tokio::test]
async fn without_grace_the_late_reading_is_dropped() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("windows", Mutex::new(Vec::<(i64, i64)>::new()));
    let collected = ctx.item::<Mutex<Vec<(i64, i64)>>>("windows").unwrap();

    runner.run_with::<StrictSums>(ctx).await.unwrap();

    assert_eq!(*collected.lock().unwrap(), vec![(0, 3), (60, 7)]);
}
