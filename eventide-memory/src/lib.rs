//! In-memory event log for eventide
//!
//! [`InMemoryEventLog`] implements the [`EventLog`] contract and, being able
//! to notify on commit, also the push-mode [`ChangeFeed`]. It is meant for
//! tests, demos and single-process deployments where persistence is not
//! required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use eventide::errors::{EventStoreError, EventStoreResult};
use eventide::event::{DomainEvent, NewEvent, RecordedEvent};
use eventide::event_store::{EventLog, EventLogStatistics};
use eventide::observer::{ChangeFeed, StartPosition};
use eventide::types::{EventId, EventVersion, StreamKey, Timestamp, WorkerId};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

struct LogState<E> {
    // Commit order, which is also strictly increasing timestamp order.
    events: Vec<RecordedEvent<E>>,
    // Positions in `events`, per stream, in version order.
    streams: HashMap<StreamKey, Vec<usize>>,
    event_ids: HashSet<EventId>,
    subscribers: Vec<mpsc::UnboundedSender<RecordedEvent<E>>>,
    checkpoints: HashMap<WorkerId, Timestamp>,
}

impl<E> Default for LogState<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            streams: HashMap::new(),
            event_ids: HashSet::new(),
            subscribers: Vec::new(),
            checkpoints: HashMap::new(),
        }
    }
}

impl<E: Clone> LogState<E> {
    fn stream_version(&self, stream: &StreamKey) -> EventVersion {
        self.streams
            .get(stream)
            .map_or_else(EventVersion::initial, |positions| {
                EventVersion::initial().advance(positions.len())
            })
    }

    fn after(&self, after: Option<Timestamp>) -> &[RecordedEvent<E>] {
        let start = after.map_or(0, |after| {
            self.events.partition_point(|event| event.timestamp <= after)
        });
        &self.events[start..]
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = Timestamp::now();
        match self.events.last() {
            Some(last) if last.timestamp >= now => last.timestamp.next_tick(),
            _ => now,
        }
    }
}

/// Thread-safe in-memory event log.
///
/// Clones share the same storage. Commit timestamps strictly increase in
/// commit order, so an exclusive timestamp is a complete replay checkpoint.
pub struct InMemoryEventLog<E> {
    state: Arc<Mutex<LogState<E>>>,
}

impl<E> Clone for InMemoryEventLog<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E> InMemoryEventLog<E> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
        }
    }

    fn lock(&self) -> EventStoreResult<MutexGuard<'_, LogState<E>>> {
        self.state
            .lock()
            .map_err(|e| EventStoreError::Internal(format!("Lock poisoned: {e}")))
    }
}

impl<E> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: DomainEvent> EventLog for InMemoryEventLog<E> {
    type Event = E;

    #[instrument(skip(self, events), fields(stream = %stream, expected = %expected_version, count = events.len()))]
    async fn append(
        &self,
        stream: &StreamKey,
        expected_version: EventVersion,
        events: Vec<NewEvent<E>>,
    ) -> EventStoreResult<EventVersion> {
        let mut state = self.lock()?;

        let current = state.stream_version(stream);
        if current != expected_version {
            debug!(current = %current, "Rejecting append with stale expected version");
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected: expected_version,
                current,
            });
        }

        let mut seen = HashSet::with_capacity(events.len());
        for event in &events {
            if state.event_ids.contains(&event.event_id) || !seen.insert(event.event_id) {
                return Err(EventStoreError::DuplicateEventId(event.event_id));
            }
        }

        let mut version = current;
        let mut recorded = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let timestamp = state.next_timestamp();
            let event = RecordedEvent {
                event_id: event.event_id,
                aggregate_id: stream.aggregate_id.clone(),
                partition_key: stream.partition_key.clone(),
                version,
                event_type: event.payload.event_type(),
                payload: event.payload,
                timestamp,
                metadata: event.metadata,
            };
            let position = state.events.len();
            state.event_ids.insert(event.event_id);
            state.streams.entry(stream.clone()).or_default().push(position);
            state.events.push(event.clone());
            recorded.push(event);
        }

        // Subscribers whose receiver is gone are dropped.
        state
            .subscribers
            .retain(|subscriber| recorded.iter().all(|event| subscriber.send(event.clone()).is_ok()));

        debug!(new_version = %version, "Appended events");
        Ok(version)
    }

    async fn read_stream(&self, stream: &StreamKey) -> EventStoreResult<Vec<RecordedEvent<E>>> {
        let state = self.lock()?;
        Ok(state.streams.get(stream).map_or_else(Vec::new, |positions| {
            positions
                .iter()
                .map(|&position| state.events[position].clone())
                .collect()
        }))
    }

    async fn stream_version(&self, stream: &StreamKey) -> EventStoreResult<EventVersion> {
        Ok(self.lock()?.stream_version(stream))
    }

    async fn read_all_after(
        &self,
        after: Option<Timestamp>,
        limit: usize,
    ) -> EventStoreResult<Vec<RecordedEvent<E>>> {
        let state = self.lock()?;
        Ok(state.after(after).iter().take(limit).cloned().collect())
    }

    async fn statistics(&self) -> EventStoreResult<EventLogStatistics> {
        let state = self.lock()?;
        Ok(EventLogStatistics {
            total_events_count: state.events.len() as u64,
            stream_count: state.streams.len() as u64,
            latest_event_timestamp: state.events.last().map(|event| event.timestamp),
        })
    }
}

#[async_trait]
impl<E: DomainEvent> ChangeFeed<E> for InMemoryEventLog<E> {
    #[instrument(skip(self), fields(processor = %processor))]
    async fn open(
        &self,
        processor: &WorkerId,
        from: StartPosition,
    ) -> EventStoreResult<mpsc::UnboundedReceiver<RecordedEvent<E>>> {
        let mut state = self.lock()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let backlog: &[RecordedEvent<E>] = match from {
            StartPosition::Beginning => state.after(None),
            StartPosition::Tail => &[],
            StartPosition::After(timestamp) => state.after(Some(timestamp)),
        };
        let backlog_len = backlog.len();
        for event in backlog {
            // The receiver is still in scope, so sending cannot fail.
            let _ = sender.send(event.clone());
        }

        // Registered under the same lock as the backlog read, so no commit
        // falls between the two.
        state.subscribers.push(sender);
        info!(backlog = backlog_len, "Change feed opened");
        Ok(receiver)
    }

    async fn checkpoint(&self, processor: &WorkerId, position: Timestamp) -> EventStoreResult<()> {
        let mut state = self.lock()?;
        let checkpoint = state
            .checkpoints
            .entry(processor.clone())
            .or_insert(position);
        *checkpoint = (*checkpoint).max(position);
        Ok(())
    }

    async fn load_checkpoint(&self, processor: &WorkerId) -> EventStoreResult<Option<Timestamp>> {
        Ok(self.lock()?.checkpoints.get(processor).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide::types::{AggregateId, EventType, PartitionKey};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Ping(u32);

    impl DomainEvent for Ping {
        fn event_type(&self) -> EventType {
            EventType::of("Ping")
        }
    }

    fn stream(id: &str) -> StreamKey {
        StreamKey::new(
            AggregateId::try_new(id).unwrap(),
            PartitionKey::try_new("p").unwrap(),
        )
    }

    fn pings(range: std::ops::Range<u32>) -> Vec<NewEvent<Ping>> {
        range.map(|n| NewEvent::new(Ping(n))).collect()
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_across_streams() {
        let log = InMemoryEventLog::new();
        for n in 0..50 {
            let key = stream(if n % 2 == 0 { "even" } else { "odd" });
            let version = log.stream_version(&key).await.unwrap();
            log.append(&key, version, pings(n..n + 1)).await.unwrap();
        }

        let events = log.read_all_after(None, 100).await.unwrap();
        assert_eq!(events.len(), 50);
        assert!(events.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected_atomically() {
        let log = InMemoryEventLog::new();
        let first = pings(0..1);
        let duplicate = NewEvent {
            event_id: first[0].event_id,
            payload: Ping(9),
            metadata: first[0].metadata.clone(),
        };
        log.append(&stream("a"), EventVersion::initial(), first)
            .await
            .unwrap();

        let result = log
            .append(
                &stream("b"),
                EventVersion::initial(),
                vec![NewEvent::new(Ping(1)), duplicate],
            )
            .await;

        assert!(matches!(result, Err(EventStoreError::DuplicateEventId(_))));
        assert!(log.read_stream(&stream("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_feed_sends_backlog_then_live_events() {
        let log = InMemoryEventLog::new();
        log.append(&stream("a"), EventVersion::initial(), pings(0..2))
            .await
            .unwrap();
        let processor = WorkerId::try_new("projector").unwrap();

        let mut feed = log.open(&processor, StartPosition::Beginning).await.unwrap();
        log.append(&stream("a"), EventVersion::initial().advance(2), pings(2..3))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(feed.recv().await.unwrap().payload);
        }
        assert_eq!(seen, vec![Ping(0), Ping(1), Ping(2)]);
    }

    #[tokio::test]
    async fn change_feed_from_tail_skips_history() {
        let log = InMemoryEventLog::new();
        log.append(&stream("a"), EventVersion::initial(), pings(0..2))
            .await
            .unwrap();
        let processor = WorkerId::try_new("projector").unwrap();

        let mut feed = log.open(&processor, StartPosition::Tail).await.unwrap();
        assert!(feed.try_recv().is_err());

        log.append(&stream("a"), EventVersion::initial().advance(2), pings(2..3))
            .await
            .unwrap();
        assert_eq!(feed.recv().await.unwrap().payload, Ping(2));
    }

    #[tokio::test]
    async fn checkpoints_only_move_forward() {
        let log = InMemoryEventLog::<Ping>::new();
        let processor = WorkerId::try_new("projector").unwrap();
        let earlier = Timestamp::now();
        let later = earlier.next_tick();

        log.checkpoint(&processor, later).await.unwrap();
        log.checkpoint(&processor, earlier).await.unwrap();

        assert_eq!(log.load_checkpoint(&processor).await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let log = InMemoryEventLog::new();
        let clone = log.clone();
        log.append(&stream("a"), EventVersion::initial(), pings(0..1))
            .await
            .unwrap();

        let statistics = clone.statistics().await.unwrap();
        assert_eq!(statistics.total_events_count, 1);
        assert_eq!(statistics.stream_count, 1);
    }
}
