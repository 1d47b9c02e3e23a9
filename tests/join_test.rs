//! Join engine tests driven through the runner: inner keyed enrichment
//! and a left-outer self-join over streams of the same element type.

use std::sync::Mutex;

use async_trait::async_trait;
use flowline::{
    JoinNode, JoinType, NodeExecutionContext, Pipe, PipelineBuilder, PipelineContext,
    PipelineDefinition, PipelineRunner, Result, SinkNode, SourceNode,
};

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: u32,
    customer_id: u32,
    amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct Customer {
    id: u32,
    name: String,
}

#[derive(Default)]
struct OrderSource;

impl SourceNode for OrderSource {
    type Output = Order;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<Order>> {
        Ok(Pipe::from_values(
            "orders",
            vec![
                Order { id: 101, customer_id: 1, amount: 100 },
                Order { id: 102, customer_id: 2, amount: 250 },
                Order { id: 103, customer_id: 1, amount: 50 },
                Order { id: 104, customer_id: 3, amount: 75 },
            ],
        ))
    }
}

#[derive(Default)]
struct CustomerSource;

impl SourceNode for CustomerSource {
    type Output = Customer;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<Customer>> {
        Ok(Pipe::from_values(
            "customers",
            vec![
                Customer { id: 1, name: "Alice".to_string() },
                Customer { id: 2, name: "Bob".to_string() },
            ],
        ))
    }
}

#[derive(Default)]
struct EnrichOrders;

impl JoinNode for EnrichOrders {
    type Key = u32;
    type Left = Order;
    type Right = Customer;
    type Output = (u32, String, i64);

    fn join_type(&self) -> JoinType {
        JoinType::Inner
    }

    fn left_key(&self, order: &Order) -> u32 {
        order.customer_id
    }

    fn right_key(&self, customer: &Customer) -> u32 {
        customer.id
    }

    fn combine(&self, order: &Order, customer: &Customer) -> (u32, String, i64) {
        (order.id, customer.name.clone(), order.amount)
    }
}

#[derive(Default)]
struct EnrichedSink;

#[async_trait]
impl SinkNode for EnrichedSink {
    type Input = (u32, String, i64);

    async fn consume(
        &self,
        mut input: Pipe<(u32, String, i64)>,
        ctx: &NodeExecutionContext,
    ) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<(u32, String, i64)>>>("enriched")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct EnrichmentPipeline;

impl Default for EnrichmentPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for EnrichmentPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let orders = builder.add_source::<OrderSource>("orders");
        let customers = builder.add_source::<CustomerSource>("customers");
        let join = builder.add_join::<EnrichOrders>("enrich");
        let sink = builder.add_sink::<EnrichedSink>("collect");
        builder.connect_join_left(&orders, &join)?;
        builder.connect_join_right(&customers, &join)?;
        builder.connect(&join, &sink)?;
        Ok(())
    }
}

#[tokio::test]
async fn inner_join_enriches_matched_orders_and_drops_the_rest() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("enriched", Mutex::new(Vec::<(u32, String, i64)>::new()));
    let collected = ctx
        .item::<Mutex<Vec<(u32, String, i64)>>>("enriched")
        .unwrap();

    runner.run_with::<EnrichmentPipeline>(ctx).await.unwrap();

    let mut enriched = collected.lock().unwrap().clone();
    enriched.sort_by_key(|(order_id, _, _)| *order_id);
    assert_eq!(
        enriched,
        vec![
            (101, "Alice".to_string(), 100),
            (102, "Bob".to_string(), 250),
            (103, "Alice".to_string(), 50),
        ]
    );
}

// --- left-outer self-join --------------------------------------------

/// Year-over-year comparison: this year's orders joined against last
/// year's by customer. Both sides carry the same element type; the join
/// engine keeps them apart by side.
#[derive(Default)]
struct ThisYearOrders;

impl SourceNode for ThisYearOrders {
    type Output = Order;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<Order>> {
        Ok(Pipe::from_values(
            "orders-2024",
            vec![
                Order { id: 1, customer_id: 101, amount: 1000 },
                Order { id: 2, customer_id: 102, amount: 1500 },
                Order { id: 3, customer_id: 103, amount: 2000 },
            ],
        ))
    }
}

#[derive(Default)]
struct LastYearOrders;

impl SourceNode for LastYearOrders {
    type Output = Order;

    fn init(&self, _ctx: &NodeExecutionContext) -> Result<Pipe<Order>> {
        Ok(Pipe::from_values(
            "orders-2023",
            vec![
                Order { id: 4, customer_id: 101, amount: 800 },
                Order { id: 5, customer_id: 102, amount: 1200 },
                Order { id: 6, customer_id: 104, amount: 900 },
            ],
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct YearOverYear {
    customer_id: u32,
    current: i64,
    previous: Option<i64>,
}

#[derive(Default)]
struct CompareYears;

impl JoinNode for CompareYears {
    type Key = u32;
    type Left = Order;
    type Right = Order;
    type Output = YearOverYear;

    fn join_type(&self) -> JoinType {
        JoinType::LeftOuter
    }

    fn left_key(&self, order: &Order) -> u32 {
        order.customer_id
    }

    fn right_key(&self, order: &Order) -> u32 {
        order.customer_id
    }

    fn combine(&self, current: &Order, previous: &Order) -> YearOverYear {
        YearOverYear {
            customer_id: current.customer_id,
            current: current.amount,
            previous: Some(previous.amount),
        }
    }

    fn left_only(&self, current: &Order) -> Option<YearOverYear> {
        Some(YearOverYear {
            customer_id: current.customer_id,
            current: current.amount,
            previous: None,
        })
    }
}

#[derive(Default)]
struct ComparisonSink;

#[async_trait]
impl SinkNode for ComparisonSink {
    type Input = YearOverYear;

    async fn consume(
        &self,
        mut input: Pipe<YearOverYear>,
        ctx: &NodeExecutionContext,
    ) -> Result<()> {
        let collected = ctx
            .pipeline()
            .item::<Mutex<Vec<YearOverYear>>>("comparison")
            .expect("collector registered");
        while let Some(item) = input.next().await {
            collected.lock().unwrap().push(item?);
        }
        Ok(())
    }
}

struct SelfJoinPipeline;

impl Default for SelfJoinPipeline {
    fn default() -> Self {
        Self
    }
}

impl PipelineDefinition for SelfJoinPipeline {
    fn define(&self, builder: &mut PipelineBuilder, _ctx: &PipelineContext) -> Result<()> {
        let current = builder.add_source::<ThisYearOrders>("orders-2024");
        let previous = builder.add_source::<LastYearOrders>("orders-2023");
        let join = builder.add_join::<CompareYears>("year-over-year");
        let sink = builder.add_sink::<ComparisonSink>("collect");
        builder.connect_join_left(&current, &join)?;
        builder.connect_join_right(&previous, &join)?;
        builder.connect(&join, &sink)?;
        Ok(())
    }
}

#[tokio::test]
async fn left_outer_self_join_keeps_unmatched_current_orders() {
    let runner = PipelineRunner::new();
    let ctx = PipelineContext::new();
    ctx.insert_item("comparison", Mutex::new(Vec::<YearOverYear>::new()));
    let collected = ctx.item::<Mutex<Vec<YearOverYear>>>("comparison").unwrap();

    runner.run_with::<SelfJoinPipeline>(ctx).await.unwrap();

    let mut comparison = collected.lock().unwrap().clone();
    comparison.sort_by_key(|yoy| yoy.customer_id);
    assert_eq!(
        comparison,
        vec![
            YearOverYear { customer_id: 101, current: 1000, previous: Some(800) },
            YearOverYear { customer_id: 102, current: 1500, previous: Some(1200) },
            YearOverYear { customer_id: 103, current: 2000, previous: None },
        ]
    );
    // Customer 104 only exists on the right side of a left-outer join.
    assert!(comparison.iter().all(|yoy| yoy.customer_id != 104));
}
