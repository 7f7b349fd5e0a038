//! Behavioural contract every [`EventLog`] backend must satisfy.
//!
//! Each scenario takes a factory for the backend under test and returns a
//! [`ContractTestResult`]. Scenarios use fresh, uniquely named streams and
//! only reason about their own events, so they can run in parallel against
//! a shared database.
//!
//! ```rust,ignore
//! eventide::event_log_contract_tests! {
//!     suite = in_memory,
//!     make_log = InMemoryEventLog::<ContractEvent>::new,
//! }
//! ```

use crate::cancellation::Cancellation;
use crate::errors::EventStoreError;
use crate::event::{DomainEvent, NewEvent, RecordedEvent};
use crate::event_store::{replay_all, EventLog, ReplayOutcome};
use crate::types::{AggregateId, EventType, EventVersion, PartitionKey, StreamKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::ready;
use std::sync::Arc;
use uuid::Uuid;

/// A failed contract scenario.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn store_error(scenario: &'static str, operation: &'static str, error: &EventStoreError) -> Self {
        Self::assertion(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// The event type used by the contract scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    /// Which scenario wrote the event.
    pub label: String,
    /// Position in the scenario's own write order.
    pub sequence: u32,
}

impl ContractEvent {
    fn new(label: &str, sequence: u32) -> NewEvent<Self> {
        NewEvent::new(Self {
            label: label.to_string(),
            sequence,
        })
    }
}

impl DomainEvent for ContractEvent {
    fn event_type(&self) -> EventType {
        EventType::of("ContractEvent")
    }
}

fn contract_stream(scenario: &'static str, label: &str) -> Result<StreamKey, ContractTestFailure> {
    // Unique per run so scenarios can share a database.
    let raw = format!("contract-{scenario}-{label}-{}", Uuid::now_v7());
    let aggregate_id = AggregateId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid aggregate id `{raw}`: {error}"))
    })?;
    let partition_key = PartitionKey::try_new("contract").map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid partition key: {error}"))
    })?;
    Ok(StreamKey::new(aggregate_id, partition_key))
}

fn batch(label: &str, range: std::ops::Range<u32>) -> Vec<NewEvent<ContractEvent>> {
    range.map(|sequence| ContractEvent::new(label, sequence)).collect()
}

/// N appends with correct expected versions yield versions 1..=N.
pub async fn test_append_assigns_consecutive_versions<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "append_assigns_consecutive_versions";

    let log = make_log();
    let stream = contract_stream(SCENARIO, "single")?;

    let mut expected = EventVersion::initial();
    for sequence in 0..3 {
        expected = log
            .append(&stream, expected, batch(SCENARIO, sequence * 2..sequence * 2 + 2))
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;
    }

    if expected.value() != 6 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected version 6 after three appends of two, observed {expected}"),
        ));
    }

    let events = log
        .read_stream(&stream)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", &error))?;
    let versions: Vec<u64> = events.iter().map(|event| event.version.value()).collect();
    if versions != (1..=6).collect::<Vec<u64>>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions 1..=6 in order, observed {versions:?}"),
        ));
    }

    let sequences: Vec<u32> = events.iter().map(|event| event.payload.sequence).collect();
    if sequences != (0..6).collect::<Vec<u32>>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("events were not read back in append order: {sequences:?}"),
        ));
    }
    Ok(())
}

/// A stale expected version is rejected and writes nothing.
pub async fn test_stale_version_conflicts_without_writing<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "stale_version_conflicts_without_writing";

    let log = make_log();
    let stream = contract_stream(SCENARIO, "shared")?;

    let _ = log
        .append(&stream, EventVersion::initial(), batch(SCENARIO, 0..1))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;

    match log
        .append(&stream, EventVersion::initial(), batch(SCENARIO, 1..3))
        .await
    {
        Err(EventStoreError::ConcurrencyConflict {
            expected, current, ..
        }) => {
            if expected.value() != 0 || current.value() != 1 {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("conflict reported expected={expected} current={current}, wanted 0 and 1"),
                ));
            }
        }
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", &error)),
        Ok(version) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected a concurrency conflict but append succeeded at {version}"),
            ))
        }
    }

    let events = log
        .read_stream(&stream)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", &error))?;
    if events.len() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("conflicting append changed the stream: {} events", events.len()),
        ));
    }
    Ok(())
}

/// An empty append still checks the expected version.
pub async fn test_empty_append_checks_version<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "empty_append_checks_version";

    let log = make_log();
    let stream = contract_stream(SCENARIO, "empty")?;

    let version = log
        .append(&stream, EventVersion::initial(), Vec::new())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;
    if version != EventVersion::initial() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("empty append to a new stream returned {version}"),
        ));
    }

    match log
        .append(&stream, EventVersion::initial().next(), Vec::new())
        .await
    {
        Err(EventStoreError::ConcurrencyConflict { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(SCENARIO, "append", &error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "empty append with a wrong expected version succeeded",
        )),
    }
}

/// Streams with the same aggregate id in different partitions are distinct,
/// and unknown streams read as empty at version 0.
pub async fn test_stream_isolation<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "stream_isolation";

    let log = make_log();
    let left = contract_stream(SCENARIO, "left")?;
    let right = StreamKey::new(
        left.aggregate_id.clone(),
        PartitionKey::try_new("contract-other").map_err(|error| {
            ContractTestFailure::assertion(SCENARIO, format!("invalid partition key: {error}"))
        })?,
    );

    let _ = log
        .append(&left, EventVersion::initial(), batch(SCENARIO, 0..2))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;

    let right_version = log
        .stream_version(&right)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "stream_version", &error))?;
    let right_events = log
        .read_stream(&right)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", &error))?;
    if right_version != EventVersion::initial() || !right_events.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "other partition should be empty, observed version {right_version} with {} events",
                right_events.len()
            ),
        ));
    }

    let left_events = log
        .read_stream(&left)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", &error))?;
    if left_events.iter().any(|event| event.stream_key() != left) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "stream read returned events belonging to another stream",
        ));
    }
    Ok(())
}

/// Of several writers racing on one stream with the same expected version,
/// exactly one wins.
pub async fn test_racing_appends_have_one_winner<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent> + 'static,
{
    const SCENARIO: &str = "racing_appends_have_one_winner";
    const WRITERS: u32 = 8;

    let log = Arc::new(make_log());
    let stream = contract_stream(SCENARIO, "contended")?;

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let log = Arc::clone(&log);
            let stream = stream.clone();
            tokio::spawn(async move {
                log.append(&stream, EventVersion::initial(), batch(SCENARIO, writer..writer + 1))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for writer in writers {
        match writer.await {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(EventStoreError::ConcurrencyConflict { .. })) => {}
            Ok(Err(error)) => return Err(ContractTestFailure::store_error(SCENARIO, "append", &error)),
            Err(join_error) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("writer task failed: {join_error}"),
                ))
            }
        }
    }

    if winners != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one winning writer, observed {winners}"),
        ));
    }
    Ok(())
}

/// Replay walks the log in strictly increasing timestamp order, and a
/// cursor restarted from an event's timestamp resumes right after it.
pub async fn test_replay_order_and_resumption<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "replay_order_and_resumption";

    let log = make_log();
    let first = contract_stream(SCENARIO, "first")?;
    let second = contract_stream(SCENARIO, "second")?;
    let label = format!("{SCENARIO}-{}", Uuid::now_v7());

    let before = log
        .statistics()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "statistics", &error))?;

    let mut first_version = EventVersion::initial();
    let mut second_version = EventVersion::initial();
    for sequence in 0..6 {
        let (stream, version) = if sequence % 2 == 0 {
            (&first, &mut first_version)
        } else {
            (&second, &mut second_version)
        };
        *version = log
            .append(stream, *version, batch(&label, sequence..sequence + 1))
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;
    }

    let after = log
        .statistics()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "statistics", &error))?;
    if after.total_events_count < before.total_events_count + 6 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "statistics did not count the appended events: before={} after={}",
                before.total_events_count, after.total_events_count
            ),
        ));
    }

    let replayed = replay_from(&log, before.latest_event_timestamp, 2, SCENARIO).await?;
    let mut previous: Option<Timestamp> = None;
    for event in &replayed {
        if previous.is_some_and(|previous| event.timestamp <= previous) {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "replay timestamps are not strictly increasing",
            ));
        }
        previous = Some(event.timestamp);
    }

    let mine: Vec<&RecordedEvent<ContractEvent>> = replayed
        .iter()
        .filter(|event| event.payload.label == label)
        .collect();
    let order: Vec<u32> = mine.iter().map(|event| event.payload.sequence).collect();
    if order != (0..6).collect::<Vec<u32>>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replay did not follow commit order: {order:?}"),
        ));
    }

    let checkpoint = mine[2].timestamp;
    let resumed = replay_from(&log, Some(checkpoint), 2, SCENARIO).await?;
    let resumed_order: Vec<u32> = resumed
        .iter()
        .filter(|event| event.payload.label == label)
        .map(|event| event.payload.sequence)
        .collect();
    if resumed_order != vec![3, 4, 5] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("resuming after sequence 2 replayed {resumed_order:?}"),
        ));
    }
    Ok(())
}

/// `replay_all` delivers bounded batches whose totals add up, restarts
/// right after a saved timestamp, and stops after the batch during which
/// cancellation was requested.
pub async fn test_replay_all_batches_and_cancellation<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog<Event = ContractEvent>,
{
    const SCENARIO: &str = "replay_all_batches_and_cancellation";
    const BATCH_SIZE: usize = 2;

    let log = make_log();
    let stream = contract_stream(SCENARIO, "batched")?;
    let label = format!("{SCENARIO}-{}", Uuid::now_v7());

    let before = log
        .statistics()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "statistics", &error))?;
    let _ = log
        .append(&stream, EventVersion::initial(), batch(&label, 0..5))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", &error))?;

    let (outcome, delivered) =
        collect_replay(&log, before.latest_event_timestamp, BATCH_SIZE, SCENARIO).await?;
    if outcome.cancelled {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "an uncancelled replay reported cancellation",
        ));
    }
    if outcome.events != delivered.len() as u64 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "outcome counted {} events but {} were delivered",
                outcome.events,
                delivered.len()
            ),
        ));
    }
    if outcome.last_timestamp != delivered.last().map(|event| event.timestamp) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "outcome does not end at the last delivered event",
        ));
    }
    let mine: Vec<&RecordedEvent<ContractEvent>> = delivered
        .iter()
        .filter(|event| event.payload.label == label)
        .collect();
    let order: Vec<u32> = mine.iter().map(|event| event.payload.sequence).collect();
    if order != (0..5).collect::<Vec<u32>>() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("replay_all delivered {order:?}"),
        ));
    }

    let (_, resumed) = collect_replay(&log, Some(mine[1].timestamp), BATCH_SIZE, SCENARIO).await?;
    let resumed_order: Vec<u32> = resumed
        .iter()
        .filter(|event| event.payload.label == label)
        .map(|event| event.payload.sequence)
        .collect();
    if resumed_order != vec![2, 3, 4] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("restarting after sequence 1 replayed {resumed_order:?}"),
        ));
    }

    let cancellation = Cancellation::new();
    let mut delivered_before_stop = 0;
    let stopped = replay_all(
        &log,
        before.latest_event_timestamp,
        BATCH_SIZE,
        &cancellation,
        |batch| {
            delivered_before_stop += batch.len();
            cancellation.cancel();
            ready(Ok::<(), EventStoreError>(()))
        },
    )
    .await
    .map_err(|error| ContractTestFailure::store_error(SCENARIO, "replay_all", &error))?;
    if !stopped.cancelled || stopped.batches != 1 || delivered_before_stop > BATCH_SIZE {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "cancelling during the first batch gave cancelled={} after {} batches and {delivered_before_stop} events",
                stopped.cancelled, stopped.batches
            ),
        ));
    }
    Ok(())
}

async fn replay_from<L>(
    log: &L,
    from: Option<Timestamp>,
    batch_size: usize,
    scenario: &'static str,
) -> Result<Vec<RecordedEvent<ContractEvent>>, ContractTestFailure>
where
    L: EventLog<Event = ContractEvent>,
{
    collect_replay(log, from, batch_size, scenario)
        .await
        .map(|(_, events)| events)
}

/// Drains the log through `replay_all`, checking every batch against the
/// size limit.
async fn collect_replay<L>(
    log: &L,
    from: Option<Timestamp>,
    batch_size: usize,
    scenario: &'static str,
) -> Result<(ReplayOutcome, Vec<RecordedEvent<ContractEvent>>), ContractTestFailure>
where
    L: EventLog<Event = ContractEvent>,
{
    let mut events = Vec::new();
    let mut largest_batch = 0;
    let outcome = replay_all(log, from, batch_size, &Cancellation::new(), |batch| {
        largest_batch = largest_batch.max(batch.len());
        events.extend(batch);
        ready(Ok::<(), EventStoreError>(()))
    })
    .await
    .map_err(|error| ContractTestFailure::store_error(scenario, "replay_all", &error))?;
    if largest_batch > batch_size {
        return Err(ContractTestFailure::assertion(
            scenario,
            format!("batch of {largest_batch} exceeds the limit of {batch_size}"),
        ));
    }
    Ok((outcome, events))
}

/// Generates one `#[tokio::test]` per contract scenario.
///
/// Attributes written before `suite` are applied to every generated test,
/// e.g. `#[ignore = "requires PostgreSQL"]`.
#[macro_export]
macro_rules! event_log_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_log = $make_log:expr $(,)?) => {
        #[allow(non_snake_case, unused_imports)]
        mod $suite {
            use super::*;
            use $crate::testing::contract::{
                test_append_assigns_consecutive_versions, test_empty_append_checks_version,
                test_racing_appends_have_one_winner, test_replay_all_batches_and_cancellation,
                test_replay_order_and_resumption, test_stale_version_conflicts_without_writing,
                test_stream_isolation,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn append_assigns_consecutive_versions_contract() {
                test_append_assigns_consecutive_versions($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn stale_version_conflicts_without_writing_contract() {
                test_stale_version_conflicts_without_writing($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn empty_append_checks_version_contract() {
                test_empty_append_checks_version($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn stream_isolation_contract() {
                test_stream_isolation($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn racing_appends_have_one_winner_contract() {
                test_racing_appends_have_one_winner($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn replay_order_and_resumption_contract() {
                test_replay_order_and_resumption($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn replay_all_batches_and_cancellation_contract() {
                test_replay_all_batches_and_cancellation($make_log)
                    .await
                    .expect("event log contract failed");
            }
        }
    };
}

pub use event_log_contract_tests;
