//! Events observers: how committed events reach the projections engine.
//!
//! Backends with a change-notification mechanism push events through a
//! [`ChangeFeed`] ([`ChangeFeedObserver`]); backends without one are polled
//! through [`ReplayCursor`] ([`PollingObserver`]). Both deliver every
//! committed event at least once, in commit order, and only after it is
//! durable. Each event is fully applied before the next one is received.

use crate::cancellation::Cancellation;
use crate::config::PollingConfig;
use crate::errors::{EventStoreResult, ProjectionResult};
use crate::event::RecordedEvent;
use crate::event_store::{EventLog, ReplayCursor};
use crate::types::{Timestamp, WorkerId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

/// How an observer learns about new events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The backend notifies the observer as events commit.
    Push,
    /// The observer scans the log for events it has not seen.
    Pull,
}

/// Where an observer starts when it has no saved checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Every event in the log.
    Beginning,
    /// Only events committed after the observer starts.
    #[default]
    Tail,
    /// Events committed after the given timestamp.
    After(Timestamp),
}

/// Receives events from an observer. Implemented by the projections engine.
#[async_trait]
pub trait EventSink<E>: Send + Sync {
    /// Applies one event. Returning only after the event is fully applied
    /// gives the observer its back-pressure.
    async fn deliver(&self, event: RecordedEvent<E>) -> ProjectionResult<()>;
}

/// Drives live delivery into an [`EventSink`].
#[async_trait]
pub trait EventsObserver<E>: Send + Sync {
    /// Push or pull.
    fn mode(&self) -> DeliveryMode;

    /// Delivers events until `cancellation` fires or the source closes.
    async fn run(
        &self,
        worker: &WorkerId,
        sink: Arc<dyn EventSink<E>>,
        cancellation: Cancellation,
    ) -> ProjectionResult<()>;
}

/// An ordered, at-least-once, checkpoint-resumable notification channel of
/// committed events, keyed by processor identity.
#[async_trait]
pub trait ChangeFeed<E>: Send + Sync {
    /// Opens a subscription for `processor`.
    ///
    /// Events already committed after `from` are sent first, then new
    /// events as they commit, with no gap in between.
    async fn open(
        &self,
        processor: &WorkerId,
        from: StartPosition,
    ) -> EventStoreResult<mpsc::UnboundedReceiver<RecordedEvent<E>>>;

    /// Records that `processor` has fully handled everything up to `position`.
    async fn checkpoint(&self, processor: &WorkerId, position: Timestamp) -> EventStoreResult<()>;

    /// The last position checkpointed by `processor`.
    async fn load_checkpoint(&self, processor: &WorkerId) -> EventStoreResult<Option<Timestamp>>;
}

/// Push-mode observer over a [`ChangeFeed`].
///
/// Resumes from the processor's checkpoint when one exists, otherwise from
/// the configured start position. The feed is checkpointed after each event
/// has been applied.
pub struct ChangeFeedObserver<E> {
    feed: Arc<dyn ChangeFeed<E>>,
    start: StartPosition,
}

impl<E> ChangeFeedObserver<E> {
    /// Creates an observer that starts at the tail of the feed.
    pub fn new(feed: Arc<dyn ChangeFeed<E>>) -> Self {
        Self {
            feed,
            start: StartPosition::Tail,
        }
    }

    /// Sets where to start when the processor has no checkpoint.
    #[must_use]
    pub fn starting_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventsObserver<E> for ChangeFeedObserver<E> {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Push
    }

    #[instrument(skip(self, sink, cancellation), fields(worker = %worker))]
    async fn run(
        &self,
        worker: &WorkerId,
        sink: Arc<dyn EventSink<E>>,
        cancellation: Cancellation,
    ) -> ProjectionResult<()> {
        let from = match self.feed.load_checkpoint(worker).await? {
            Some(checkpoint) => StartPosition::After(checkpoint),
            None => self.start,
        };
        let mut events = self.feed.open(worker, from).await?;
        info!(?from, "Change feed subscription opened");

        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else {
                        debug!("Change feed closed");
                        break;
                    };
                    let position = event.timestamp;
                    sink.deliver(event).await?;
                    self.feed.checkpoint(worker, position).await?;
                }
            }
        }
        Ok(())
    }
}

/// Pull-mode observer that scans the log in batches.
pub struct PollingObserver<E> {
    log: Arc<dyn EventLog<Event = E>>,
    start: StartPosition,
    config: PollingConfig,
}

impl<E> PollingObserver<E> {
    /// Creates an observer that starts at the tail of the log.
    pub fn new(log: Arc<dyn EventLog<Event = E>>, config: PollingConfig) -> Self {
        Self {
            log,
            start: StartPosition::Tail,
            config,
        }
    }

    /// Sets the start position.
    #[must_use]
    pub fn starting_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

#[async_trait]
impl<E: Send + Sync + 'static> EventsObserver<E> for PollingObserver<E> {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Pull
    }

    #[instrument(skip(self, sink, cancellation), fields(worker = %worker))]
    async fn run(
        &self,
        worker: &WorkerId,
        sink: Arc<dyn EventSink<E>>,
        cancellation: Cancellation,
    ) -> ProjectionResult<()> {
        let mut position = match self.start {
            StartPosition::Beginning => None,
            StartPosition::Tail => self.log.statistics().await?.latest_event_timestamp,
            StartPosition::After(timestamp) => Some(timestamp),
        };
        let batch_size = usize::from(self.config.batch_size);

        while !cancellation.is_cancelled() {
            let mut cursor = ReplayCursor::new(self.log.as_ref(), position, batch_size);
            while let Some(batch) = cursor.next_batch().await? {
                debug!(events = batch.len(), "Polled batch");
                for event in batch {
                    sink.deliver(event).await?;
                }
                if cancellation.is_cancelled() {
                    break;
                }
            }
            position = cursor.position();

            tokio::select! {
                () = cancellation.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval.as_duration()) => {}
            }
        }
        Ok(())
    }
}
