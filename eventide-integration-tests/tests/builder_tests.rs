//! How the engine applies events to builders: isolation, idempotence and
//! updates that target documents which do not exist yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventide::cancellation::Cancellation;
use eventide::config::MaxDeadLetterAttempts;
use eventide::cqrs::{
    CqrsError, CqrsResult, DocumentStore, FieldKind, FieldSpec, InMemoryProjectionStore,
    IndexLease, IndexStateStore, IndexStatus, ProjectionDocument, ProjectionIndexState,
    ProjectionSchema, RebuildCheckpoint,
};
use eventide::types::{EventType, IndexName, WorkerId};
use eventide::{
    DocumentWriter, EventLog, MissingDocumentPolicy, ProjectionBuilder, ProjectionEngineConfig,
    ProjectionError, ProjectionResult, ProjectionsEngine, RebuildConfig, RecordedEvent,
};
use eventide_integration_tests::harness::{partition, Harness};
use eventide_integration_tests::orders::OrderEvent;
use eventide_integration_tests::projections::{
    CustomerActivity, CustomerActivityBuilder, OrderSummary, OrderSummaryBuilder,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Shipment {
    shipped: bool,
}

impl ProjectionSchema for Shipment {
    fn index_name() -> IndexName {
        IndexName::of("shipments")
    }

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec::new("shipped", FieldKind::Boolean).filterable()]
    }
}

/// Fails every event while `broken` is set.
struct ShipmentBuilder {
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl ProjectionBuilder<OrderEvent> for ShipmentBuilder {
    type Document = Shipment;

    fn name(&self) -> &str {
        "shipments"
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![EventType::of("OrderPlaced")]
    }

    async fn apply(
        &self,
        event: &RecordedEvent<OrderEvent>,
        documents: &DocumentWriter<'_, Shipment>,
    ) -> ProjectionResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ProjectionError::builder_failed(
                self.name(),
                event.event_id,
                "carrier service unavailable",
            ));
        }
        documents
            .upsert_document(ProjectionDocument::new(
                event.aggregate_id.to_string(),
                event.partition_key.clone(),
                event.timestamp,
                Shipment { shipped: false },
            ))
            .await?;
        Ok(())
    }
}

/// Index state whose rebuild flag cannot be written.
struct UnwritableRearm {
    inner: InMemoryProjectionStore,
}

#[async_trait]
impl IndexStateStore for UnwritableRearm {
    async fn register_index(&self, index: &IndexName) -> CqrsResult<IndexStatus> {
        self.inner.register_index(index).await
    }

    async fn index_status(&self, index: &IndexName) -> CqrsResult<Option<IndexStatus>> {
        self.inner.index_status(index).await
    }

    async fn index_state(&self) -> CqrsResult<ProjectionIndexState> {
        self.inner.index_state().await
    }

    async fn acquire_and_lock_projection_that_requires_rebuild(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> CqrsResult<Option<IndexLease>> {
        self.inner
            .acquire_and_lock_projection_that_requires_rebuild(worker, lease_timeout)
            .await
    }

    async fn save_progress(
        &self,
        lease: &IndexLease,
        checkpoint: &RebuildCheckpoint,
    ) -> CqrsResult<IndexStatus> {
        self.inner.save_progress(lease, checkpoint).await
    }

    async fn complete_rebuild(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        self.inner.complete_rebuild(lease).await
    }

    async fn release_lease(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        self.inner.release_lease(lease).await
    }

    async fn record_failure(&self, lease: &IndexLease, reason: &str) -> CqrsResult<IndexStatus> {
        self.inner.record_failure(lease, reason).await
    }

    async fn request_rebuild(&self, _index: &IndexName) -> CqrsResult<IndexStatus> {
        Err(CqrsError::storage("control table is read-only"))
    }
}

async fn events(harness: &Harness) -> Vec<RecordedEvent<OrderEvent>> {
    harness.log.read_all_after(None, 100).await.unwrap()
}

async fn summary(harness: &Harness, id: &str) -> Option<OrderSummary> {
    harness
        .store
        .get(&OrderSummary::index_name(), id, &partition("tenant-a"))
        .await
        .unwrap()
        .map(|stored| stored.to_typed::<OrderSummary>().unwrap().body)
}

async fn requires_rebuild(harness: &Harness, index: &IndexName) -> bool {
    harness
        .store
        .index_status(index)
        .await
        .unwrap()
        .unwrap()
        .requires_rebuild
}

#[tokio::test]
async fn a_failing_builder_does_not_affect_its_siblings() {
    let harness = Harness::new();
    let broken = Arc::new(AtomicBool::new(true));
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .engine
        .add_projection_builder(ShipmentBuilder {
            broken: Arc::clone(&broken),
        })
        .await
        .unwrap();
    harness
        .coordinator("bootstrap", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    harness
        .place_order("order-1", "tenant-a", "customer-1", &[])
        .await
        .unwrap();
    let placed = events(&harness).await.remove(0);
    harness.engine.dispatch(&placed).await.unwrap();

    assert!(summary(&harness, "order-1").await.is_some());
    assert!(!requires_rebuild(&harness, &OrderSummary::index_name()).await);
    assert!(requires_rebuild(&harness, &Shipment::index_name()).await);
    assert_eq!(harness.engine.stats().builder_failures, 1);

    broken.store(false, Ordering::SeqCst);
    let report = harness
        .coordinator("rebuilder", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    assert_eq!(report.completed, vec![Shipment::index_name()]);
    let shipment = harness
        .reader::<Shipment>()
        .get("order-1", &partition("tenant-a"))
        .await
        .unwrap();
    assert!(!shipment.body.shipped);
}

#[tokio::test]
async fn live_failures_leave_the_index_alone_when_rearming_is_off() {
    let harness =
        Harness::with_config(ProjectionEngineConfig::default().with_rearm_on_live_failure(false));
    harness
        .engine
        .add_projection_builder(ShipmentBuilder {
            broken: Arc::new(AtomicBool::new(true)),
        })
        .await
        .unwrap();
    harness
        .coordinator("bootstrap", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();

    harness
        .place_order("order-1", "tenant-a", "customer-1", &[])
        .await
        .unwrap();
    harness
        .engine
        .dispatch(&events(&harness).await[0])
        .await
        .unwrap();

    assert_eq!(harness.engine.stats().builder_failures, 1);
    assert!(!requires_rebuild(&harness, &Shipment::index_name()).await);
}

#[tokio::test]
async fn a_failed_rearm_is_reported_after_every_builder_is_handled() {
    let harness = Harness::new();
    let engine = ProjectionsEngine::new(
        harness.log_handle(),
        Arc::new(harness.store.clone()),
        Arc::new(UnwritableRearm {
            inner: harness.store.clone(),
        }),
        ProjectionEngineConfig::default(),
    );
    engine
        .add_projection_builder(ShipmentBuilder {
            broken: Arc::new(AtomicBool::new(true)),
        })
        .await
        .unwrap();
    engine.add_projection_builder(OrderSummaryBuilder).await.unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();
    let history = events(&harness).await;

    engine.dispatch(&history[1]).await.unwrap();
    assert_eq!(engine.dead_letters().len(), 1);

    let result = engine.dispatch(&history[0]).await;

    assert!(matches!(result, Err(ProjectionError::Store(CqrsError::Storage(_)))));
    assert_eq!(engine.stats().builder_failures, 1);
    assert!(engine.dead_letters().is_empty());
    assert_eq!(summary(&harness, "order-1").await.unwrap().item_count, 1);
}

#[tokio::test]
async fn applying_an_event_twice_counts_it_once() {
    let harness = Harness::new();
    harness.register_order_projections().await.unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 2, 300)])
        .await
        .unwrap();

    for event in events(&harness).await.iter().chain(events(&harness).await.iter()) {
        harness.engine.dispatch(event).await.unwrap();
    }

    let summary = summary(&harness, "order-1").await.unwrap();
    assert_eq!(summary.item_count, 1);
    assert_eq!(summary.total_cents, 600);
}

#[tokio::test]
async fn replaying_over_live_documents_changes_nothing() {
    let harness = Harness::new();
    harness.register_order_projections().await.unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 100)])
        .await
        .unwrap();
    harness
        .place_order("order-2", "tenant-a", "customer-1", &[])
        .await
        .unwrap();
    for event in &events(&harness).await {
        harness.engine.dispatch(event).await.unwrap();
    }

    let report = harness
        .coordinator("rebuilder", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 2);

    let activity = harness
        .reader::<CustomerActivity>()
        .get("customer-1", &partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(activity.body.orders_placed, 2);
    assert_eq!(activity.body.last_order_id, "order-2");
    assert_eq!(summary(&harness, "order-1").await.unwrap().item_count, 1);
}

#[tokio::test]
async fn child_events_wait_for_their_parent_document() {
    let harness = Harness::new();
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();
    let history = events(&harness).await;

    harness.engine.dispatch(&history[1]).await.unwrap();
    let parked = harness.engine.dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].builder, "order-summary");
    assert_eq!(parked[0].missing[0].id, "order-1");
    assert!(summary(&harness, "order-1").await.is_none());

    harness.engine.dispatch(&history[0]).await.unwrap();

    assert!(harness.engine.dead_letters().is_empty());
    let summary = summary(&harness, "order-1").await.unwrap();
    assert_eq!(summary.item_count, 1);
    assert_eq!(summary.total_cents, 250);
    let stats = harness.engine.stats();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.dead_letters_resolved, 1);
}

#[tokio::test]
async fn parked_events_are_discarded_after_their_attempts_run_out() {
    let harness = Harness::with_config(
        ProjectionEngineConfig::default()
            .with_max_dead_letter_attempts(MaxDeadLetterAttempts::try_new(3).unwrap()),
    );
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();
    let orphan = events(&harness).await.remove(1);
    harness.engine.dispatch(&orphan).await.unwrap();
    assert_eq!(harness.engine.dead_letters()[0].attempts, 1);

    let first = harness.engine.retry_dead_letters().await;
    assert_eq!((first.resolved, first.remaining, first.discarded), (0, 1, 0));
    assert_eq!(harness.engine.dead_letters()[0].attempts, 2);

    let second = harness.engine.retry_dead_letters().await;
    assert_eq!((second.resolved, second.remaining, second.discarded), (0, 0, 1));
    assert!(harness.engine.dead_letters().is_empty());
    assert_eq!(harness.engine.stats().dead_letters_discarded, 1);
}

#[tokio::test]
async fn a_delivery_that_parks_its_event_does_not_spend_a_retry() {
    let harness = Harness::new();
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();
    harness
        .place_order("order-2", "tenant-a", "customer-1", &[("sku-2", 1, 100)])
        .await
        .unwrap();
    let history = events(&harness).await;
    let orphans: Vec<_> = history
        .iter()
        .filter(|event| event.event_type == EventType::of("OrderItemAdded"))
        .collect();

    harness.engine.dispatch(orphans[0]).await.unwrap();
    harness.engine.dispatch(orphans[1]).await.unwrap();

    let parked = harness.engine.dead_letters();
    assert_eq!(parked.len(), 2);
    assert!(parked.iter().all(|letter| letter.attempts == 1));
    assert_eq!(harness.engine.stats().dead_letters_resolved, 0);
}

#[tokio::test]
async fn drop_policy_skips_updates_to_missing_documents() {
    let harness = Harness::with_config(
        ProjectionEngineConfig::default().with_missing_document_policy(MissingDocumentPolicy::Drop),
    );
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();

    harness
        .engine
        .dispatch(&events(&harness).await[1])
        .await
        .unwrap();

    assert_eq!(harness.engine.stats().dropped_updates, 1);
    assert!(harness.engine.dead_letters().is_empty());
    assert_eq!(harness.store.count(&OrderSummary::index_name()).await.unwrap(), 0);
}

#[tokio::test]
async fn fail_policy_counts_a_builder_failure_and_rearms() {
    let harness = Harness::with_config(
        ProjectionEngineConfig::default().with_missing_document_policy(MissingDocumentPolicy::Fail),
    );
    harness
        .engine
        .add_projection_builder(OrderSummaryBuilder)
        .await
        .unwrap();
    harness
        .coordinator("bootstrap", RebuildConfig::default())
        .run_pass(&Cancellation::new())
        .await
        .unwrap();
    harness
        .place_order("order-1", "tenant-a", "customer-1", &[("sku-1", 1, 250)])
        .await
        .unwrap();

    harness
        .engine
        .dispatch(&events(&harness).await[1])
        .await
        .unwrap();

    assert_eq!(harness.engine.stats().builder_failures, 1);
    assert!(requires_rebuild(&harness, &OrderSummary::index_name()).await);
}

#[tokio::test]
async fn builder_names_must_be_unique() {
    let harness = Harness::new();
    harness
        .engine
        .add_projection_builder(CustomerActivityBuilder)
        .await
        .unwrap();

    let duplicate = harness
        .engine
        .add_projection_builder(CustomerActivityBuilder)
        .await;

    assert!(matches!(duplicate, Err(ProjectionError::DuplicateBuilder(name)) if name == "customer-activity"));
    assert_eq!(harness.engine.builder_names(), vec!["customer-activity"]);
    assert_eq!(harness.engine.indexes(), vec![CustomerActivity::index_name()]);
}
