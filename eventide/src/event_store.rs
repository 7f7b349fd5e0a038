//! The event log contract.
//!
//! An [`EventLog`] stores immutable events per stream with optimistic
//! concurrency: an append succeeds only when the caller's expected version
//! equals the stream's current version, and then every appended event gets
//! the next consecutive version. Conflicting writers fail, they never block.
//!
//! Across streams the log is ordered by commit timestamp. Backends assign
//! timestamps that strictly increase in commit order, so an exclusive
//! timestamp is a complete replay checkpoint. [`ReplayCursor`] walks that
//! order in batches and can be restarted from any checkpoint.

use crate::cancellation::Cancellation;
use crate::errors::EventStoreResult;
use crate::event::{NewEvent, RecordedEvent};
use crate::types::{EventVersion, StreamKey, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Storage backend for events.
///
/// Every implementation must give identical semantics for version conflicts
/// and replay ordering; `eventide::testing::contract` (feature `testing`)
/// checks both.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// The domain event payload type.
    type Event: Send + Sync;

    /// Appends `events` to `stream` if its current version equals
    /// `expected_version`, returning the new version.
    ///
    /// All events are written atomically and receive consecutive versions.
    /// On a version mismatch nothing is written and
    /// `EventStoreError::ConcurrencyConflict` is returned. An empty `events`
    /// still checks the version.
    async fn append(
        &self,
        stream: &StreamKey,
        expected_version: EventVersion,
        events: Vec<NewEvent<Self::Event>>,
    ) -> EventStoreResult<EventVersion>;

    /// Reads a stream in ascending version order. Unknown streams are empty.
    async fn read_stream(
        &self,
        stream: &StreamKey,
    ) -> EventStoreResult<Vec<RecordedEvent<Self::Event>>>;

    /// The current version of a stream (0 when it has no events).
    async fn stream_version(&self, stream: &StreamKey) -> EventStoreResult<EventVersion>;

    /// Up to `limit` events across all streams, in commit order, whose
    /// timestamp is strictly after `after` (from the beginning when `None`).
    async fn read_all_after(
        &self,
        after: Option<Timestamp>,
        limit: usize,
    ) -> EventStoreResult<Vec<RecordedEvent<Self::Event>>>;

    /// Totals used to size rebuild progress reporting.
    async fn statistics(&self) -> EventStoreResult<EventLogStatistics>;
}

/// Summary of the log's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogStatistics {
    /// Number of events across all streams.
    pub total_events_count: u64,
    /// Number of non-empty streams.
    pub stream_count: u64,
    /// Commit timestamp of the newest event.
    pub latest_event_timestamp: Option<Timestamp>,
}

/// A lazy, restartable walk over the whole log in commit order.
///
/// Each call to [`ReplayCursor::next_batch`] fetches at most `batch_size`
/// events after the current position and advances the position to the last
/// event returned. Creating a new cursor from a saved position resumes
/// exactly after the last event that was handed out.
pub struct ReplayCursor<'a, E> {
    log: &'a dyn EventLog<Event = E>,
    position: Option<Timestamp>,
    batch_size: usize,
    exhausted: bool,
}

impl<'a, E> ReplayCursor<'a, E>
where
    E: Send + Sync,
{
    /// Starts after `from` (or at the beginning of the log).
    pub fn new(log: &'a dyn EventLog<Event = E>, from: Option<Timestamp>, batch_size: usize) -> Self {
        Self {
            log,
            position: from,
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }

    /// The timestamp of the last event handed out (or the starting point).
    pub const fn position(&self) -> Option<Timestamp> {
        self.position
    }

    /// Whether the cursor has reached the end of the log.
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetches the next batch, or `None` once the log is exhausted.
    ///
    /// A short batch marks the cursor as exhausted; callers that want to
    /// follow the log as it grows create a fresh cursor from
    /// [`ReplayCursor::position`].
    pub async fn next_batch(&mut self) -> EventStoreResult<Option<Vec<RecordedEvent<E>>>> {
        if self.exhausted {
            return Ok(None);
        }
        let batch = self.log.read_all_after(self.position, self.batch_size).await?;
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        match batch.last() {
            Some(last) => {
                self.position = Some(last.timestamp);
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }
}

/// Totals of a finished or interrupted replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Batches delivered.
    pub batches: u64,
    /// Events delivered.
    pub events: u64,
    /// Timestamp of the last delivered event.
    pub last_timestamp: Option<Timestamp>,
    /// Whether the replay stopped because cancellation was requested.
    pub cancelled: bool,
}

impl ReplayOutcome {
    /// Accounts for one delivered batch.
    pub fn record_batch(&mut self, events: usize, last_timestamp: Timestamp) {
        self.batches += 1;
        self.events += events as u64;
        self.last_timestamp = Some(last_timestamp);
    }
}

/// Replays every event after `from` in batches of `batch_size`.
///
/// `on_batch` is awaited before the next batch is fetched, so persisting a
/// checkpoint inside it is safe. Cancellation is observed between batches:
/// the batch in flight completes, no further batch starts.
pub async fn replay_all<E, F, Fut, Err>(
    log: &dyn EventLog<Event = E>,
    from: Option<Timestamp>,
    batch_size: usize,
    cancellation: &Cancellation,
    mut on_batch: F,
) -> Result<ReplayOutcome, Err>
where
    E: Send + Sync,
    F: FnMut(Vec<RecordedEvent<E>>) -> Fut,
    Fut: Future<Output = Result<(), Err>>,
    Err: From<crate::errors::EventStoreError>,
{
    let mut cursor = ReplayCursor::new(log, from, batch_size);
    let mut outcome = ReplayOutcome::default();
    loop {
        if cancellation.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        let Some(batch) = cursor.next_batch().await? else {
            break;
        };
        let count = batch.len();
        let last_timestamp = batch
            .last()
            .map_or_else(Timestamp::now, |event| event.timestamp);
        on_batch(batch).await?;
        outcome.record_batch(count, last_timestamp);
    }
    Ok(outcome)
}
