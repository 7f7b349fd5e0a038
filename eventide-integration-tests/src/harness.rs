//! In-memory wiring of the order domain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eventide::cqrs::{InMemoryProjectionStore, ProjectionReader, ProjectionSchema, RebuildCoordinator};
use eventide::types::{AggregateId, PartitionKey, WorkerId};
use eventide::{
    AggregateRoot, EventLog, ProjectionEngineConfig, ProjectionResult, ProjectionsEngine,
    RebuildConfig, Repository,
};
use eventide_memory::InMemoryEventLog;

use crate::orders::{self, Order, OrderError, OrderEvent};
use crate::projections::{CustomerActivityBuilder, OrderSummaryBuilder};

/// Builds a partition key; panics on an invalid name.
#[track_caller]
pub fn partition(name: &str) -> PartitionKey {
    PartitionKey::try_new(name).expect("fixture partition keys are valid")
}

/// Builds an aggregate id; panics on an invalid name.
#[track_caller]
pub fn order_id(name: &str) -> AggregateId {
    AggregateId::try_new(name).expect("fixture aggregate ids are valid")
}

/// Builds a worker id; panics on an invalid name.
#[track_caller]
pub fn worker(name: &str) -> WorkerId {
    WorkerId::try_new(name).expect("fixture worker ids are valid")
}

/// One log, one projection store, and an engine over both.
pub struct Harness {
    pub log: InMemoryEventLog<OrderEvent>,
    pub store: InMemoryProjectionStore,
    pub engine: ProjectionsEngine<OrderEvent>,
    pub repository: Repository<Order>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ProjectionEngineConfig::default())
    }

    pub fn with_config(config: ProjectionEngineConfig) -> Self {
        let log = InMemoryEventLog::new();
        let store = InMemoryProjectionStore::new();
        let engine = Self::engine_over(&log, &store, config);
        let repository = Repository::new(Arc::new(log.clone()));
        Self {
            log,
            store,
            engine,
            repository,
        }
    }

    /// A second engine over the same log and stores, as another process
    /// would have.
    pub fn peer_engine(&self, config: ProjectionEngineConfig) -> ProjectionsEngine<OrderEvent> {
        Self::engine_over(&self.log, &self.store, config)
    }

    fn engine_over(
        log: &InMemoryEventLog<OrderEvent>,
        store: &InMemoryProjectionStore,
        config: ProjectionEngineConfig,
    ) -> ProjectionsEngine<OrderEvent> {
        ProjectionsEngine::new(
            Arc::new(log.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config,
        )
    }

    pub fn log_handle(&self) -> Arc<dyn EventLog<Event = OrderEvent>> {
        Arc::new(self.log.clone())
    }

    /// Registers the summary and customer-activity builders.
    pub async fn register_order_projections(&self) -> ProjectionResult<()> {
        self.engine.add_projection_builder(OrderSummaryBuilder).await?;
        self.engine.add_projection_builder(CustomerActivityBuilder).await
    }

    pub fn coordinator(&self, worker_name: &str, config: RebuildConfig) -> RebuildCoordinator<OrderEvent> {
        RebuildCoordinator::new(self.engine.clone(), worker(worker_name), config)
    }

    pub fn reader<T: ProjectionSchema>(&self) -> ProjectionReader<T> {
        ProjectionReader::new(Arc::new(self.store.clone()), Arc::new(self.store.clone()))
    }

    /// Places an order with the given `(sku, quantity, unit price)` lines in
    /// a single append.
    pub async fn place_order(
        &self,
        id: &str,
        partition_key: &str,
        customer_id: &str,
        lines: &[(&str, u32, i64)],
    ) -> Result<AggregateRoot<Order>, OrderError> {
        let mut order = self.repository.create(order_id(id), partition(partition_key));
        orders::place(&mut order, customer_id)?;
        for (sku, quantity, unit_price_cents) in lines {
            orders::add_item(&mut order, sku, *quantity, *unit_price_cents)?;
        }
        self.repository.save(&mut order).await?;
        Ok(order)
    }
}

/// Polls `check` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
