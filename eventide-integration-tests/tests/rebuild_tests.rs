//! Lease-based projection rebuilds: readiness, exclusivity, checkpoints,
//! failures and the parallelism bound.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventide::cancellation::Cancellation;
use eventide::config::{LeaseTimeoutMs, MaxParallelTasks, PollIntervalMs, ReplayBatchSize};
use eventide::cqrs::{
    CqrsError, DocumentStore, FieldKind, FieldSpec, IndexRebuildOutcome, IndexStateStore,
    IndexStatus, ProjectionDocument, ProjectionSchema,
};
use eventide::types::{EventType, IndexName};
use eventide::{
    DocumentWriter, EventLog, ProjectionBuilder, ProjectionEngineConfig, ProjectionError,
    ProjectionResult, RebuildConfig, RecordedEvent,
};
use eventide_integration_tests::harness::{eventually, partition, worker, Harness};
use eventide_integration_tests::orders::OrderEvent;
use eventide_integration_tests::projections::{CustomerActivity, OrderSummary};
use serde::{Deserialize, Serialize};
use tracing_test::traced_test;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AuditTrail {
    events: u32,
}

impl ProjectionSchema for AuditTrail {
    fn index_name() -> IndexName {
        IndexName::of("order-audit")
    }

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec::new("events", FieldKind::Integer).filterable()]
    }
}

/// Counts every order event per order.
///
/// Cancels `stop` once it has applied `stop_after` events and fails every
/// event while `broken` is set.
#[derive(Clone)]
struct AuditBuilder {
    applied: Arc<AtomicUsize>,
    stop_after: Option<usize>,
    stop: Cancellation,
    broken: Arc<AtomicBool>,
}

impl AuditBuilder {
    fn new() -> Self {
        Self {
            applied: Arc::new(AtomicUsize::new(0)),
            stop_after: None,
            stop: Cancellation::new(),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn stopping_after(mut self, events: usize, stop: &Cancellation) -> Self {
        self.stop_after = Some(events);
        self.stop = stop.clone();
        self
    }

    fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectionBuilder<OrderEvent> for AuditBuilder {
    type Document = AuditTrail;

    fn name(&self) -> &str {
        "order-audit"
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![EventType::of("OrderPlaced"), EventType::of("OrderItemAdded")]
    }

    async fn apply(
        &self,
        event: &RecordedEvent<OrderEvent>,
        documents: &DocumentWriter<'_, AuditTrail>,
    ) -> ProjectionResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ProjectionError::builder_failed(
                self.name(),
                event.event_id,
                "audit sink rejected the write",
            ));
        }
        let id = event.aggregate_id.to_string();
        if let OrderEvent::OrderPlaced { .. } = event.payload {
            documents
                .upsert_document(ProjectionDocument::new(
                    id,
                    event.partition_key.clone(),
                    event.timestamp,
                    AuditTrail { events: 1 },
                ))
                .await?;
        } else {
            documents
                .update_document(&id, &event.partition_key, event.timestamp, |trail| {
                    trail.events += 1;
                })
                .await?;
        }

        let applied = self.applied.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stop_after == Some(applied) {
            self.stop.cancel();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lane<const N: usize> {
    seen: u32,
}

impl<const N: usize> ProjectionSchema for Lane<N> {
    fn index_name() -> IndexName {
        IndexName::try_new(format!("lane-{N}")).unwrap()
    }

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec::new("seen", FieldKind::Integer)]
    }
}

/// Tracks how many lane builders are applying an event at the same time.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    applied: AtomicUsize,
}

struct LaneBuilder<const N: usize> {
    name: String,
    gauge: Arc<Gauge>,
}

impl<const N: usize> LaneBuilder<N> {
    fn new(gauge: &Arc<Gauge>) -> Self {
        Self {
            name: format!("lane-{N}"),
            gauge: Arc::clone(gauge),
        }
    }
}

#[async_trait]
impl<const N: usize> ProjectionBuilder<OrderEvent> for LaneBuilder<N> {
    type Document = Lane<N>;

    fn name(&self) -> &str {
        &self.name
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![EventType::of("OrderPlaced")]
    }

    async fn apply(
        &self,
        _event: &RecordedEvent<OrderEvent>,
        _documents: &DocumentWriter<'_, Lane<N>>,
    ) -> ProjectionResult<()> {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        self.gauge.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WeightedItems {
    weight: u32,
}

impl ProjectionSchema for WeightedItems {
    fn index_name() -> IndexName {
        IndexName::of("weighted-items")
    }

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec::new("weight", FieldKind::Integer).filterable()]
    }
}

/// Adds the current `per_item` value for every item added to an order;
/// changing it stands in for shipping a corrected builder.
struct WeightedItemsBuilder {
    per_item: Arc<AtomicU32>,
}

#[async_trait]
impl ProjectionBuilder<OrderEvent> for WeightedItemsBuilder {
    type Document = WeightedItems;

    fn name(&self) -> &str {
        "weighted-items"
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![EventType::of("OrderPlaced"), EventType::of("OrderItemAdded")]
    }

    async fn apply(
        &self,
        event: &RecordedEvent<OrderEvent>,
        documents: &DocumentWriter<'_, WeightedItems>,
    ) -> ProjectionResult<()> {
        let id = event.aggregate_id.to_string();
        if let OrderEvent::OrderPlaced { .. } = event.payload {
            documents
                .upsert_document(ProjectionDocument::new(
                    id,
                    event.partition_key.clone(),
                    event.timestamp,
                    WeightedItems { weight: 0 },
                ))
                .await?;
        } else {
            let per_item = self.per_item.load(Ordering::SeqCst);
            documents
                .update_document(&id, &event.partition_key, event.timestamp, |items| {
                    items.weight += per_item;
                })
                .await?;
        }
        Ok(())
    }
}

fn small_batches() -> RebuildConfig {
    RebuildConfig::default().with_batch_size(ReplayBatchSize::try_new(10).unwrap())
}

async fn place_orders(harness: &Harness, count: usize, items_each: usize) {
    let lines: Vec<(&str, u32, i64)> = (0..items_each).map(|_| ("sku-1", 1, 100)).collect();
    for n in 0..count {
        harness
            .place_order(&format!("order-{n}"), "tenant-a", "customer-1", &lines)
            .await
            .unwrap();
    }
}

async fn status(harness: &Harness, index: &IndexName) -> IndexStatus {
    harness.store.index_status(index).await.unwrap().unwrap()
}

#[tokio::test]
async fn rebuild_makes_existing_history_queryable() {
    let harness = Harness::new();
    place_orders(&harness, 3, 1).await;
    harness.register_order_projections().await.unwrap();

    let before = harness
        .reader::<OrderSummary>()
        .get("order-0", &partition("tenant-a"))
        .await;
    assert!(matches!(before, Err(CqrsError::IndexNotReady { .. })));

    let report = harness
        .coordinator("rebuilder", small_batches())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    assert_eq!(report.rounds, 1);
    assert_eq!(report.completed.len(), 2);
    assert!(report.failed.is_empty());
    let summary = harness
        .reader::<OrderSummary>()
        .get("order-2", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(summary.body.item_count, 1);
    let activity = harness
        .reader::<CustomerActivity>()
        .get("customer-1", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(activity.body.orders_placed, 3);

    let summaries = status(&harness, &OrderSummary::index_name()).await;
    assert!(summaries.is_ready());
    assert!(!summaries.is_locked());
    assert_eq!(summaries.total_events_to_process, 6);
    assert_eq!(summaries.events_processed, 6);
}

#[tokio::test]
async fn a_pass_with_nothing_to_rebuild_is_empty() {
    let harness = Harness::new();
    harness.register_order_projections().await.unwrap();
    let coordinator = harness.coordinator("rebuilder", RebuildConfig::default());
    coordinator.run_pass(&Cancellation::new()).await.unwrap();

    let second = coordinator.run_pass(&Cancellation::new()).await.unwrap();

    assert!(second.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_coordinators_rebuild_each_index_once() {
    let harness = Harness::new();
    place_orders(&harness, 5, 0).await;
    let first_gauge = Arc::new(Gauge::default());
    let second_gauge = Arc::new(Gauge::default());
    let peer = harness.peer_engine(ProjectionEngineConfig::default());
    harness
        .engine
        .add_projection_builder(LaneBuilder::<1>::new(&first_gauge))
        .await
        .unwrap();
    harness
        .engine
        .add_projection_builder(LaneBuilder::<2>::new(&first_gauge))
        .await
        .unwrap();
    peer.add_projection_builder(LaneBuilder::<1>::new(&second_gauge))
        .await
        .unwrap();
    peer.add_projection_builder(LaneBuilder::<2>::new(&second_gauge))
        .await
        .unwrap();

    let first = harness.coordinator("worker-a", RebuildConfig::default());
    let second = eventide::cqrs::RebuildCoordinator::new(
        peer,
        worker("worker-b"),
        RebuildConfig::default(),
    );
    let cancel = Cancellation::new();
    let (a, b) = tokio::join!(first.run_pass(&cancel), second.run_pass(&cancel));
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut completed: Vec<IndexName> = a.completed.into_iter().chain(b.completed).collect();
    completed.sort();
    assert_eq!(completed, vec![Lane::<1>::index_name(), Lane::<2>::index_name()]);
    let applied = first_gauge.applied.load(Ordering::SeqCst)
        + second_gauge.applied.load(Ordering::SeqCst);
    assert_eq!(applied, 10);
}

#[tokio::test]
async fn cancelled_rebuild_resumes_from_its_checkpoint() {
    let harness = Harness::new();
    place_orders(&harness, 10, 2).await;
    let history = harness.log.read_all_after(None, 100).await.unwrap();
    assert_eq!(history.len(), 30);

    let first_pass = Cancellation::new();
    let builder = AuditBuilder::new().stopping_after(15, &first_pass);
    harness
        .engine
        .add_projection_builder(builder.clone())
        .await
        .unwrap();

    let report = harness
        .coordinator("worker-a", small_batches())
        .run_pass(&first_pass)
        .await
        .unwrap();

    // Cancellation is observed between batches, so the second batch finishes.
    assert_eq!(report.abandoned, vec![AuditTrail::index_name()]);
    let paused = status(&harness, &AuditTrail::index_name()).await;
    assert!(!paused.is_locked());
    assert!(paused.requires_rebuild);
    assert_eq!(paused.events_processed, 20);
    assert_eq!(
        paused.last_processed_event_timestamp,
        Some(history[19].timestamp)
    );
    assert_eq!(builder.applied(), 20);

    let lease = harness
        .store
        .acquire_and_lock_projection_that_requires_rebuild(&worker("worker-b"), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.status.events_processed, 20);
    assert_eq!(lease.reclaimed_from, None);

    let outcome = harness
        .coordinator("worker-b", small_batches())
        .rebuild_index(&lease, &Cancellation::new())
        .await;

    assert_eq!(
        outcome,
        IndexRebuildOutcome::Completed {
            events_processed: 10
        }
    );
    assert_eq!(builder.applied(), 30);
    let done = status(&harness, &AuditTrail::index_name()).await;
    assert!(done.is_ready());
    assert_eq!(done.events_processed, 30);
    let trail = harness
        .reader::<AuditTrail>()
        .get("order-9", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(trail.body.events, 3);
}

#[tokio::test]
#[traced_test]
async fn failed_rebuild_is_logged_and_keeps_its_lease() {
    let harness = Harness::new();
    place_orders(&harness, 2, 1).await;
    let builder = AuditBuilder::new();
    builder.broken.store(true, Ordering::SeqCst);
    harness
        .engine
        .add_projection_builder(builder.clone())
        .await
        .unwrap();
    harness.register_order_projections().await.unwrap();

    let report = harness
        .coordinator("worker-a", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, AuditTrail::index_name());
    assert!(report.failed[0].1.contains("audit sink rejected the write"));
    assert!(logs_contain("Rebuild worker failed"));

    let failed = status(&harness, &AuditTrail::index_name()).await;
    assert_eq!(failed.locked_by, Some(worker("worker-a")));
    assert!(failed.requires_rebuild);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("audit sink rejected the write")));
}

#[tokio::test]
async fn a_stale_lease_is_reclaimed_by_another_worker() {
    let harness = Harness::new();
    place_orders(&harness, 2, 1).await;
    let builder = AuditBuilder::new();
    builder.broken.store(true, Ordering::SeqCst);
    harness
        .engine
        .add_projection_builder(builder.clone())
        .await
        .unwrap();
    let config = RebuildConfig::default().with_lease_timeout(LeaseTimeoutMs::try_new(50).unwrap());

    let failed = harness
        .coordinator("worker-a", config)
        .run_pass(&Cancellation::new())
        .await
        .unwrap();
    assert_eq!(failed.failed.len(), 1);

    let too_soon = harness
        .coordinator("worker-b", config)
        .run_pass(&Cancellation::new())
        .await
        .unwrap();
    assert!(too_soon.is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    builder.broken.store(false, Ordering::SeqCst);
    let lease = harness
        .store
        .acquire_and_lock_projection_that_requires_rebuild(&worker("worker-b"), config.lease_timeout.as_duration())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.reclaimed_from, Some(worker("worker-a")));

    let outcome = harness
        .coordinator("worker-b", config)
        .rebuild_index(&lease, &Cancellation::new())
        .await;

    assert!(matches!(outcome, IndexRebuildOutcome::Completed { .. }));
    let done = status(&harness, &AuditTrail::index_name()).await;
    assert!(done.is_ready());
    assert_eq!(done.last_error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebuilds_never_exceed_the_parallelism_bound() {
    let harness = Harness::new();
    place_orders(&harness, 3, 0).await;
    let gauge = Arc::new(Gauge::default());
    harness
        .engine
        .add_projection_builder(LaneBuilder::<1>::new(&gauge))
        .await
        .unwrap();
    harness
        .engine
        .add_projection_builder(LaneBuilder::<2>::new(&gauge))
        .await
        .unwrap();
    harness
        .engine
        .add_projection_builder(LaneBuilder::<3>::new(&gauge))
        .await
        .unwrap();
    harness
        .engine
        .add_projection_builder(LaneBuilder::<4>::new(&gauge))
        .await
        .unwrap();
    let config = RebuildConfig::default()
        .with_max_parallel_tasks(MaxParallelTasks::try_new(2).unwrap());

    let report = harness
        .coordinator("worker-a", config)
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    assert_eq!(report.rounds, 2);
    assert_eq!(report.completed.len(), 4);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(gauge.applied.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn a_rearmed_index_is_unreadable_until_rebuilt_again() {
    let harness = Harness::new();
    place_orders(&harness, 2, 1).await;
    harness.register_order_projections().await.unwrap();
    let coordinator = harness.coordinator("worker-a", RebuildConfig::default());
    coordinator.run_pass(&Cancellation::new()).await.unwrap();

    let rearmed = harness
        .store
        .request_rebuild(&OrderSummary::index_name())
        .await
        .unwrap();
    assert!(rearmed.requires_rebuild);
    assert_eq!(rearmed.events_processed, 0);
    let unreadable = harness
        .reader::<OrderSummary>()
        .get("order-0", &partition("tenant-a"))
        .await;
    assert!(matches!(unreadable, Err(CqrsError::IndexNotReady { .. })));

    let report = coordinator.run_pass(&Cancellation::new()).await.unwrap();

    assert_eq!(report.completed, vec![OrderSummary::index_name()]);
    let summary = harness
        .reader::<OrderSummary>()
        .get("order-0", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(summary.body.item_count, 1);
}

#[tokio::test]
async fn a_rebuild_from_scratch_regenerates_documents_with_the_current_builder() {
    let harness = Harness::new();
    place_orders(&harness, 2, 2).await;
    let per_item = Arc::new(AtomicU32::new(2));
    harness
        .engine
        .add_projection_builder(WeightedItemsBuilder {
            per_item: Arc::clone(&per_item),
        })
        .await
        .unwrap();
    let coordinator = harness.coordinator("worker-a", small_batches());
    coordinator.run_pass(&Cancellation::new()).await.unwrap();
    let weighed = harness
        .reader::<WeightedItems>()
        .get("order-1", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(weighed.body.weight, 4);

    per_item.store(1, Ordering::SeqCst);
    harness
        .store
        .request_rebuild(&WeightedItems::index_name())
        .await
        .unwrap();
    let report = coordinator.run_pass(&Cancellation::new()).await.unwrap();

    assert_eq!(report.completed, vec![WeightedItems::index_name()]);
    let reader = harness.reader::<WeightedItems>();
    for order in ["order-0", "order-1"] {
        let regenerated = reader.get(order, &partition("tenant-a")).await.unwrap();
        assert_eq!(regenerated.body.weight, 2, "{order} kept its stale weight");
    }
    assert_eq!(
        harness.store.count(&WeightedItems::index_name()).await.unwrap(),
        2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn the_background_loop_picks_up_new_rebuild_requests() {
    let harness = Harness::new();
    place_orders(&harness, 2, 1).await;
    harness.register_order_projections().await.unwrap();
    let config = RebuildConfig::default()
        .with_scheduling_interval(PollIntervalMs::try_new(10).unwrap());
    let coordinator = harness.coordinator("worker-a", config);
    let shutdown = Cancellation::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { coordinator.run(shutdown).await }
    });

    let reader = &harness.reader::<OrderSummary>();
    let readable = || async move { reader.get("order-1", &partition("tenant-a")).await.is_ok() };
    assert!(eventually(Duration::from_secs(5), readable).await);

    harness
        .store
        .request_rebuild(&OrderSummary::index_name())
        .await
        .unwrap();
    let harness_ref = &harness;
    let rebuilt = || async move {
        let summaries = status(harness_ref, &OrderSummary::index_name()).await;
        summaries.is_ready()
    };
    assert!(eventually(Duration::from_secs(5), rebuilt).await);

    shutdown.cancel();
    task.await.unwrap();
}
