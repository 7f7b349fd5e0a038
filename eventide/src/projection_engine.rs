//! The projections engine: builder registry, live dispatch and replay.
//!
//! Builders are registered explicitly and indexed by the event types they
//! declare. Live events arrive through an [`EventsObserver`]; replays are
//! driven by the rebuild coordinator through
//! [`ProjectionsEngine::replay_events`]. Both paths apply an event to a
//! builder in exactly the same way.
//!
//! During live delivery builders are isolated from each other: a builder that
//! fails is logged, counted and (by default) has its index flagged for
//! rebuild, while the other builders still receive the event. During replay
//! any failure is returned to the caller.

use crate::cancellation::Cancellation;
use crate::config::{MissingDocumentPolicy, ProjectionEngineConfig};
use crate::cqrs::{DocumentStore, IndexStateStore, ProjectionSchema};
use crate::errors::{ProjectionError, ProjectionResult};
use crate::event::{DomainEvent, EventPosition, RecordedEvent};
use crate::event_store::{replay_all, EventLog, ReplayOutcome};
use crate::observer::{EventSink, EventsObserver};
use crate::projection::{BuilderHandle, MissingTarget, ProjectionBuilder, RegisteredBuilder};
use crate::types::{EventId, EventType, IndexName, Timestamp, WorkerId};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Which builders a replay targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFilter {
    /// Every registered builder.
    All,
    /// Builders maintaining one of these indexes.
    Only(Vec<IndexName>),
}

impl IndexFilter {
    /// Targets a single index.
    pub fn only(index: IndexName) -> Self {
        Self::Only(vec![index])
    }

    /// Whether `index` is targeted.
    pub fn includes(&self, index: &IndexName) -> bool {
        match self {
            Self::All => true,
            Self::Only(indexes) => indexes.contains(index),
        }
    }
}

/// Reported to the replay caller after each batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayProgress {
    /// Events in the batch just applied.
    pub events_in_batch: usize,
    /// The last event of that batch; its timestamp is the new checkpoint.
    pub last_event: EventPosition,
}

/// Counters describing what the engine has done since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Events received from the observer.
    pub events_dispatched: u64,
    /// Events applied during replays.
    pub events_replayed: u64,
    /// Live builder applications that failed.
    pub builder_failures: u64,
    /// Updates skipped because their document was missing.
    pub dropped_updates: u64,
    /// Events parked because their document was missing.
    pub dead_lettered: u64,
    /// Parked events that were later applied.
    pub dead_letters_resolved: u64,
    /// Parked events given up on.
    pub dead_letters_discarded: u64,
}

#[derive(Default)]
struct EngineCounters {
    events_dispatched: AtomicU64,
    events_replayed: AtomicU64,
    builder_failures: AtomicU64,
    dropped_updates: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letters_resolved: AtomicU64,
    dead_letters_discarded: AtomicU64,
}

impl EngineCounters {
    fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            builder_failures: self.builder_failures.load(Ordering::Relaxed),
            dropped_updates: self.dropped_updates.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letters_resolved: self.dead_letters_resolved.load(Ordering::Relaxed),
            dead_letters_discarded: self.dead_letters_discarded.load(Ordering::Relaxed),
        }
    }
}

/// A parked event, as reported by [`ProjectionsEngine::dead_letters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Builder that could not apply the event.
    pub builder: String,
    /// The parked event.
    pub event_id: EventId,
    /// Its type.
    pub event_type: EventType,
    /// Documents it targeted that were missing on the last attempt.
    pub missing: Vec<MissingTarget>,
    /// Attempts so far, including the first delivery.
    pub attempts: u32,
    /// When the event was first parked.
    pub parked_at: Timestamp,
}

/// Totals of one dead-letter retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterRetryReport {
    /// Events applied in full.
    pub resolved: usize,
    /// Events still parked.
    pub remaining: usize,
    /// Events that ran out of attempts.
    pub discarded: usize,
}

struct ParkedEvent<E> {
    event: RecordedEvent<E>,
    missing: Vec<MissingTarget>,
    attempts: u32,
    parked_at: Timestamp,
}

struct BuilderRegistry<E: DomainEvent> {
    by_event_type: HashMap<EventType, Vec<Arc<dyn RegisteredBuilder<E>>>>,
    builders: Vec<Arc<dyn RegisteredBuilder<E>>>,
}

impl<E: DomainEvent> Default for BuilderRegistry<E> {
    fn default() -> Self {
        Self {
            by_event_type: HashMap::new(),
            builders: Vec::new(),
        }
    }
}

impl<E: DomainEvent> BuilderRegistry<E> {
    fn contains(&self, name: &str) -> bool {
        self.builders.iter().any(|builder| builder.name() == name)
    }

    fn insert(&mut self, builder: Arc<dyn RegisteredBuilder<E>>) {
        for event_type in builder.handled_event_types() {
            let handlers = self.by_event_type.entry(event_type).or_default();
            if !handlers.iter().any(|known| known.name() == builder.name()) {
                handlers.push(Arc::clone(&builder));
            }
        }
        self.builders.push(builder);
    }

    fn handlers(&self, event_type: &EventType) -> Vec<Arc<dyn RegisteredBuilder<E>>> {
        self.by_event_type.get(event_type).cloned().unwrap_or_default()
    }
}

struct EngineInner<E: DomainEvent> {
    log: Arc<dyn EventLog<Event = E>>,
    documents: Arc<dyn DocumentStore>,
    index_state: Arc<dyn IndexStateStore>,
    config: ProjectionEngineConfig,
    registry: RwLock<BuilderRegistry<E>>,
    observer: RwLock<Option<Arc<dyn EventsObserver<E>>>>,
    dead_letters: Mutex<HashMap<String, VecDeque<ParkedEvent<E>>>>,
    running: AtomicBool,
    counters: EngineCounters,
}

/// Routes events to projection builders.
///
/// Cloning is cheap; clones share the registry, the observer and the
/// dead-letter queue.
///
/// # Example
///
/// ```rust,ignore
/// let engine = ProjectionsEngine::new(log.clone(), store.clone(), store.clone(), ProjectionEngineConfig::default());
/// engine.add_projection_builder(OrderSummaryBuilder).await?;
/// engine.set_events_observer(Arc::new(ChangeFeedObserver::new(log.clone())));
/// let handle = engine.start(WorkerId::try_new("projector-1")?)?;
/// // ...
/// handle.stop().await?;
/// ```
pub struct ProjectionsEngine<E: DomainEvent> {
    inner: Arc<EngineInner<E>>,
}

impl<E: DomainEvent> Clone for ProjectionsEngine<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: DomainEvent> ProjectionsEngine<E> {
    /// Creates an engine with no builders and no observer.
    pub fn new(
        log: Arc<dyn EventLog<Event = E>>,
        documents: Arc<dyn DocumentStore>,
        index_state: Arc<dyn IndexStateStore>,
        config: ProjectionEngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                log,
                documents,
                index_state,
                config,
                registry: RwLock::new(BuilderRegistry::default()),
                observer: RwLock::new(None),
                dead_letters: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                counters: EngineCounters::default(),
            }),
        }
    }

    /// The event log replays read from.
    pub fn event_log(&self) -> &Arc<dyn EventLog<Event = E>> {
        &self.inner.log
    }

    /// The document store builders write to.
    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.documents
    }

    /// The index state store.
    pub fn index_state(&self) -> &Arc<dyn IndexStateStore> {
        &self.inner.index_state
    }

    /// Registers a builder.
    ///
    /// Ensures the builder's index exists in the document store and registers
    /// its index status; a new index starts out flagged for rebuild. Builder
    /// names must be unique.
    #[instrument(skip(self, builder), fields(builder = builder.name(), index = %B::Document::index_name()))]
    pub async fn add_projection_builder<B>(&self, builder: B) -> ProjectionResult<()>
    where
        B: ProjectionBuilder<E>,
    {
        let name = builder.name().to_string();
        if self.registry().contains(&name) {
            return Err(ProjectionError::DuplicateBuilder(name));
        }

        let definition = B::Document::definition();
        self.inner.documents.ensure_index(&definition).await?;
        let status = self.inner.index_state.register_index(&definition.name).await?;

        let handle: Arc<dyn RegisteredBuilder<E>> = Arc::new(BuilderHandle::new(builder));
        {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if registry.contains(&name) {
                return Err(ProjectionError::DuplicateBuilder(name));
            }
            registry.insert(handle);
        }
        info!(
            requires_rebuild = status.requires_rebuild,
            "Projection builder registered"
        );
        Ok(())
    }

    /// Names of the registered builders, in registration order.
    pub fn builder_names(&self) -> Vec<String> {
        self.registry()
            .builders
            .iter()
            .map(|builder| builder.name().to_string())
            .collect()
    }

    /// Indexes maintained by the registered builders.
    pub fn indexes(&self) -> Vec<IndexName> {
        let mut indexes: Vec<IndexName> = Vec::new();
        for builder in &self.registry().builders {
            let index = builder.index_name();
            if !indexes.contains(&index) {
                indexes.push(index);
            }
        }
        indexes
    }

    /// Sets the observer used by [`ProjectionsEngine::start`].
    pub fn set_events_observer(&self, observer: Arc<dyn EventsObserver<E>>) {
        *self
            .inner
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Starts live delivery on a background task.
    ///
    /// Fails with `NoObserver` when no observer is set and with
    /// `AlreadyRunning` when delivery is already active.
    pub fn start(&self, worker: WorkerId) -> ProjectionResult<EngineHandle> {
        let observer = self
            .inner
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProjectionError::NoObserver)?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ProjectionError::AlreadyRunning(worker.to_string()));
        }

        let cancellation = Cancellation::new();
        let engine = self.clone();
        let token = cancellation.clone();
        info!(worker = %worker, mode = ?observer.mode(), "Starting live event delivery");
        let task = tokio::spawn(async move {
            let sink: Arc<dyn EventSink<E>> = Arc::new(engine.clone());
            let result = observer.run(&worker, sink, token).await;
            if let Err(error) = &result {
                error!(worker = %worker, error = %error, "Live event delivery stopped with an error");
            }
            engine.inner.running.store(false, Ordering::SeqCst);
            result
        });
        Ok(EngineHandle { cancellation, task })
    }

    /// Whether live delivery is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Counters since creation.
    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    /// Applies one live event to every builder that handles its type.
    ///
    /// Builders run concurrently and independently; failures are logged and
    /// never returned. A builder that applies the event in full gets its
    /// parked events retried. A failure to re-arm an index is returned once
    /// every builder's result has been handled.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &RecordedEvent<E>) -> ProjectionResult<()> {
        EngineCounters::add(&self.inner.counters.events_dispatched, 1);
        let handlers = self.registry().handlers(&event.event_type);
        if handlers.is_empty() {
            debug!("No builder handles this event type");
            return Ok(());
        }

        let results = join_all(handlers.iter().map(|builder| self.apply_to(builder, event))).await;

        let mut rearm_failure = None;
        for (builder, result) in handlers.iter().zip(results) {
            match result {
                Ok(true) => {
                    self.retry_parked_for(builder).await;
                }
                Ok(false) => {}
                Err(failure) => {
                    EngineCounters::add(&self.inner.counters.builder_failures, 1);
                    error!(
                        builder = builder.name(),
                        index = %builder.index_name(),
                        error = %failure,
                        "Projection builder failed to apply live event"
                    );
                    if !self.inner.config.rearm_on_live_failure {
                        continue;
                    }
                    match self
                        .inner
                        .index_state
                        .request_rebuild(&builder.index_name())
                        .await
                    {
                        Ok(_) => warn!(
                            builder = builder.name(),
                            index = %builder.index_name(),
                            "Index flagged for rebuild after live failure"
                        ),
                        Err(rearm_error) => {
                            error!(
                                builder = builder.name(),
                                index = %builder.index_name(),
                                error = %rearm_error,
                                "Could not flag index for rebuild after live failure"
                            );
                            rearm_failure.get_or_insert(rearm_error);
                        }
                    }
                }
            }
        }
        match rearm_failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Replays the log after `from` into the builders selected by `filter`.
    ///
    /// Batches come from [`replay_all`] and are applied exactly as in live
    /// delivery. `on_progress` is called with each batch as it is read; the
    /// future it returns is awaited once the batch has been applied and
    /// before the next one is read, so the caller can persist the batch's
    /// last event as a checkpoint. Cancellation is observed between
    /// batches. Any builder or store failure, and any error from
    /// `on_progress`, stops the replay and is returned.
    #[instrument(skip(self, filter, on_progress, cancellation), fields(worker = %worker))]
    pub async fn replay_events<F, Fut>(
        &self,
        worker: &WorkerId,
        filter: &IndexFilter,
        from: Option<Timestamp>,
        batch_size: usize,
        mut on_progress: F,
        cancellation: &Cancellation,
    ) -> ProjectionResult<ReplayOutcome>
    where
        F: FnMut(ReplayProgress) -> Fut + Send,
        Fut: Future<Output = ProjectionResult<()>> + Send,
    {
        let targets = self.targets(filter)?;
        let targets = targets.as_slice();
        replay_all(
            self.inner.log.as_ref(),
            from,
            batch_size,
            cancellation,
            move |batch: Vec<RecordedEvent<E>>| {
                let reported = batch
                    .last()
                    .map(|last| ReplayProgress {
                        events_in_batch: batch.len(),
                        last_event: last.position(),
                    })
                    .map(&mut on_progress);
                async move {
                    self.apply_batch(targets, &batch).await?;
                    if let Some(reported) = reported {
                        reported.await?;
                    }
                    Ok::<_, ProjectionError>(())
                }
            },
        )
        .await
    }

    /// Parked events, oldest first per builder.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let parked = self.parked();
        let mut letters: Vec<DeadLetter> = parked
            .iter()
            .flat_map(|(builder, queue)| {
                queue.iter().map(move |entry| DeadLetter {
                    builder: builder.clone(),
                    event_id: entry.event.event_id,
                    event_type: entry.event.event_type.clone(),
                    missing: entry.missing.clone(),
                    attempts: entry.attempts,
                    parked_at: entry.parked_at,
                })
            })
            .collect();
        letters.sort_by(|a, b| a.builder.cmp(&b.builder));
        letters
    }

    /// Re-applies every parked event once.
    pub async fn retry_dead_letters(&self) -> DeadLetterRetryReport {
        let builders = self.registry().builders.clone();
        let mut report = DeadLetterRetryReport::default();
        for builder in &builders {
            let sweep = self.retry_parked_for(builder).await;
            report.resolved += sweep.resolved;
            report.remaining += sweep.remaining;
            report.discarded += sweep.discarded;
        }
        report
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, BuilderRegistry<E>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<ParkedEvent<E>>>> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn targets(&self, filter: &IndexFilter) -> ProjectionResult<Vec<Arc<dyn RegisteredBuilder<E>>>> {
        let registry = self.registry();
        if let IndexFilter::Only(indexes) = filter {
            for index in indexes {
                if !registry
                    .builders
                    .iter()
                    .any(|builder| &builder.index_name() == index)
                {
                    return Err(ProjectionError::UnknownIndex(index.clone()));
                }
            }
        }
        Ok(registry
            .builders
            .iter()
            .filter(|builder| filter.includes(&builder.index_name()))
            .cloned()
            .collect())
    }

    async fn apply_batch(
        &self,
        targets: &[Arc<dyn RegisteredBuilder<E>>],
        batch: &[RecordedEvent<E>],
    ) -> ProjectionResult<()> {
        for event in batch {
            let builders: Vec<_> = targets
                .iter()
                .filter(|builder| builder.handled_event_types().contains(&event.event_type))
                .collect();
            let results =
                join_all(builders.iter().map(|builder| self.apply_to(builder, event))).await;
            results.into_iter().collect::<ProjectionResult<Vec<bool>>>()?;
        }
        EngineCounters::add(&self.inner.counters.events_replayed, batch.len() as u64);
        if let Some(last) = batch.last() {
            debug!(events = batch.len(), checkpoint = %last.timestamp, "Replayed batch");
        }
        Ok(())
    }

    /// Applies `event` to one builder. Returns whether every write landed,
    /// that is, nothing was parked.
    async fn apply_to(
        &self,
        builder: &Arc<dyn RegisteredBuilder<E>>,
        event: &RecordedEvent<E>,
    ) -> ProjectionResult<bool> {
        let report = builder
            .apply(
                event,
                self.inner.documents.as_ref(),
                self.inner.config.missing_document_policy,
            )
            .await?;
        if report.dropped > 0 {
            EngineCounters::add(&self.inner.counters.dropped_updates, report.dropped as u64);
        }
        if report.missing.is_empty() {
            return Ok(true);
        }
        self.park(builder.name(), event, report.missing);
        Ok(false)
    }

    fn park(&self, builder: &str, event: &RecordedEvent<E>, missing: Vec<MissingTarget>) {
        EngineCounters::add(&self.inner.counters.dead_lettered, 1);
        warn!(
            builder,
            event_id = %event.event_id,
            missing = missing.len(),
            "Update targets a missing document; event parked for retry"
        );
        let capacity = usize::from(self.inner.config.dead_letter_capacity);
        let mut parked = self.parked();
        let queue = parked.entry(builder.to_string()).or_default();
        if queue.len() >= capacity {
            if let Some(evicted) = queue.pop_front() {
                EngineCounters::add(&self.inner.counters.dead_letters_discarded, 1);
                error!(
                    builder,
                    event_id = %evicted.event.event_id,
                    "Dead-letter queue full; discarding the oldest parked event"
                );
            }
        }
        queue.push_back(ParkedEvent {
            event: event.clone(),
            missing,
            attempts: 1,
            parked_at: Timestamp::now(),
        });
    }

    async fn retry_parked_for(&self, builder: &Arc<dyn RegisteredBuilder<E>>) -> DeadLetterRetryReport {
        let queue = self.parked().remove(builder.name()).unwrap_or_default();
        let mut report = DeadLetterRetryReport::default();
        if queue.is_empty() {
            return report;
        }

        let max_attempts = u32::from(self.inner.config.max_dead_letter_attempts);
        let mut still_parked = VecDeque::new();
        for mut entry in queue {
            let attempt = builder
                .apply(
                    &entry.event,
                    self.inner.documents.as_ref(),
                    MissingDocumentPolicy::DeadLetter,
                )
                .await;
            match attempt {
                Ok(write) if write.missing.is_empty() => {
                    report.resolved += 1;
                    EngineCounters::add(&self.inner.counters.dead_letters_resolved, 1);
                    debug!(
                        builder = builder.name(),
                        event_id = %entry.event.event_id,
                        "Parked event applied"
                    );
                    continue;
                }
                Ok(write) => entry.missing = write.missing,
                Err(failure) => {
                    warn!(
                        builder = builder.name(),
                        event_id = %entry.event.event_id,
                        error = %failure,
                        "Retrying parked event failed"
                    );
                }
            }
            entry.attempts += 1;
            if entry.attempts >= max_attempts {
                report.discarded += 1;
                EngineCounters::add(&self.inner.counters.dead_letters_discarded, 1);
                error!(
                    builder = builder.name(),
                    event_id = %entry.event.event_id,
                    attempts = entry.attempts,
                    "Parked event still targets a missing document; discarding it"
                );
            } else {
                still_parked.push_back(entry);
            }
        }

        report.remaining = still_parked.len();
        if !still_parked.is_empty() {
            let mut parked = self.parked();
            let queue = parked.entry(builder.name().to_string()).or_default();
            // Events parked while this sweep ran go after the older ones.
            while let Some(entry) = still_parked.pop_back() {
                queue.push_front(entry);
            }
        }
        report
    }
}

#[async_trait]
impl<E: DomainEvent> EventSink<E> for ProjectionsEngine<E> {
    async fn deliver(&self, event: RecordedEvent<E>) -> ProjectionResult<()> {
        self.dispatch(&event).await
    }
}

/// Controls a running live delivery.
pub struct EngineHandle {
    cancellation: Cancellation,
    task: JoinHandle<ProjectionResult<()>>,
}

impl EngineHandle {
    /// Stops delivery after the event in flight and waits for the task.
    pub async fn stop(self) -> ProjectionResult<()> {
        self.cancellation.cancel();
        self.task
            .await
            .map_err(|e| ProjectionError::Internal(format!("Live delivery task failed: {e}")))?
    }

    /// Whether the delivery task has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
