//! Loading and saving aggregates through an event log.

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::config::ConflictRetryConfig;
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event_store::EventLog;
use crate::types::{AggregateId, PartitionKey, StreamKey};
use rand::Rng;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Rehydrates aggregates from their streams and appends what they record.
///
/// The repository never retries on its own: a `ConcurrencyConflict` from
/// [`Repository::save`] is returned to the caller, who reloads and decides.
/// [`Repository::execute`] packages that reload-and-retry loop for callers
/// that want it.
pub struct Repository<A: Aggregate> {
    log: Arc<dyn EventLog<Event = A::Event>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> Repository<A> {
    /// Creates a repository over `log`.
    pub fn new(log: Arc<dyn EventLog<Event = A::Event>>) -> Self {
        Self {
            log,
            _aggregate: PhantomData,
        }
    }

    /// A fresh aggregate for a new stream.
    pub fn create(&self, aggregate_id: AggregateId, partition_key: PartitionKey) -> AggregateRoot<A> {
        AggregateRoot::new(aggregate_id, partition_key)
    }

    /// Loads an aggregate by folding its full stream.
    ///
    /// Fails with `StreamNotFound` when the stream has no events.
    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, partition_key = %partition_key))]
    pub async fn load(
        &self,
        aggregate_id: &AggregateId,
        partition_key: &PartitionKey,
    ) -> EventStoreResult<AggregateRoot<A>> {
        let stream = StreamKey::new(aggregate_id.clone(), partition_key.clone());
        let events = self.log.read_stream(&stream).await?;
        let Some(last) = events.last() else {
            return Err(EventStoreError::StreamNotFound(stream));
        };
        let version = last.version;
        debug!(events = events.len(), %version, "Rehydrated aggregate");
        Ok(AggregateRoot::from_history(
            stream,
            version,
            events.iter().map(|event| &event.payload),
        ))
    }

    /// Loads an aggregate, or starts a fresh one when its stream is empty.
    pub async fn load_or_create(
        &self,
        aggregate_id: &AggregateId,
        partition_key: &PartitionKey,
    ) -> EventStoreResult<AggregateRoot<A>> {
        match self.load(aggregate_id, partition_key).await {
            Ok(aggregate) => Ok(aggregate),
            Err(EventStoreError::StreamNotFound(_)) => {
                Ok(self.create(aggregate_id.clone(), partition_key.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Appends the aggregate's uncommitted events, expecting the version it
    /// was loaded at.
    ///
    /// On success the version advances and the buffer is cleared. On any
    /// error the buffer is left intact and the error is returned unchanged.
    #[instrument(skip(self, aggregate), fields(stream = %aggregate.stream(), version = %aggregate.version()))]
    pub async fn save(&self, aggregate: &mut AggregateRoot<A>) -> EventStoreResult<()> {
        if !aggregate.has_changes() {
            return Ok(());
        }
        let events = aggregate.take_uncommitted();
        let count = events.len();
        let pending = events.clone();
        match self
            .log
            .append(aggregate.stream(), aggregate.version(), events)
            .await
        {
            Ok(new_version) => {
                aggregate.mark_committed(new_version);
                debug!(count, %new_version, "Saved aggregate");
                Ok(())
            }
            Err(e) => {
                aggregate.restore_uncommitted(pending);
                Err(e)
            }
        }
    }

    /// Runs `command` against the latest state and saves the result,
    /// reloading and running it again after a concurrency conflict.
    ///
    /// Delays between attempts grow exponentially with jitter. Errors other
    /// than conflicts, and the last conflict once attempts run out, are
    /// returned as-is.
    pub async fn execute<F, T, Err>(
        &self,
        aggregate_id: &AggregateId,
        partition_key: &PartitionKey,
        retry: &ConflictRetryConfig,
        mut command: F,
    ) -> Result<T, Err>
    where
        F: FnMut(&mut AggregateRoot<A>) -> Result<T, Err> + Send,
        T: Send,
        Err: From<EventStoreError> + Send,
    {
        let attempts = retry.attempts();
        let mut attempt = 0;
        loop {
            let mut aggregate = self.load_or_create(aggregate_id, partition_key).await?;
            let output = command(&mut aggregate)?;
            match self.save(&mut aggregate).await {
                Ok(()) => return Ok(output),
                Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                    let delay = with_jitter(retry.backoff(attempt));
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis(),
                        "Concurrency conflict, reloading aggregate"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..1.2);
    delay.mul_f64(factor)
}
