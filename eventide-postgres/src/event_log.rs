//! `PostgreSQL` implementation of the [`EventLog`] contract.
//!
//! All events live in `eventide_events`. Appends take the row lock on the
//! single-row `eventide_clock` table for the length of their transaction,
//! which serializes writers: the version check cannot race, and each commit
//! stamps its events strictly after everything committed before it. A
//! replay that resumes after a timestamp therefore never skips a commit.

use std::collections::HashSet;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide::errors::{EventStoreError, EventStoreResult};
use eventide::event::{DomainEvent, NewEvent, RecordedEvent};
use eventide::event_store::{EventLog, EventLogStatistics};
use eventide::metadata::EventMetadata;
use eventide::types::{
    AggregateId, EventId, EventType, EventVersion, PartitionKey, StreamKey, Timestamp,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{unique_violation, PgTransaction};

const SELECT_EVENTS: &str = "SELECT event_id, partition_key, aggregate_id, version, event_type, \
     payload, metadata, recorded_at FROM eventide_events";

/// Database row representing an event
struct EventRow {
    event_id: Uuid,
    partition_key: String,
    aggregate_id: String,
    version: i64,
    event_type: String,
    payload: Value,
    metadata: Value,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<PgRow> for EventRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            partition_key: row.try_get("partition_key")?,
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl EventRow {
    #[allow(clippy::wrong_self_convention)]
    fn to_recorded_event<E: DomainEvent>(self) -> EventStoreResult<RecordedEvent<E>> {
        let corrupt = |field: &str, detail: String| {
            EventStoreError::DeserializationFailed(format!(
                "event {}: invalid {field}: {detail}",
                self.event_id
            ))
        };

        let event_id =
            EventId::try_new(self.event_id).map_err(|e| corrupt("event id", e.to_string()))?;
        let aggregate_id = AggregateId::try_new(self.aggregate_id.clone())
            .map_err(|e| corrupt("aggregate id", e.to_string()))?;
        let partition_key = PartitionKey::try_new(self.partition_key.clone())
            .map_err(|e| corrupt("partition key", e.to_string()))?;
        let version = u64::try_from(self.version)
            .map_err(|e| corrupt("version", e.to_string()))
            .and_then(|v| EventVersion::try_new(v).map_err(|e| corrupt("version", e.to_string())))?;
        let event_type = EventType::try_new(self.event_type.clone())
            .map_err(|e| corrupt("event type", e.to_string()))?;
        let payload: E = serde_json::from_value(self.payload.clone())
            .map_err(|e| corrupt("payload", e.to_string()))?;
        let metadata: EventMetadata = serde_json::from_value(self.metadata.clone())
            .map_err(|e| corrupt("metadata", e.to_string()))?;

        Ok(RecordedEvent {
            event_id,
            aggregate_id,
            partition_key,
            version,
            event_type,
            payload,
            timestamp: Timestamp::new(self.recorded_at),
            metadata,
        })
    }
}

/// Event log persisted in `PostgreSQL`.
///
/// Clones share the pool. Run [`crate::migrate`] once before use.
pub struct PostgresEventLog<E> {
    pool: PgPool,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresEventLog<E> {
    fn clone(&self) -> Self {
        Self::from_pool(self.pool.clone())
    }
}

impl<E> std::fmt::Debug for PostgresEventLog<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventLog").finish_non_exhaustive()
    }
}

impl<E> PostgresEventLog<E> {
    /// Uses an existing pool.
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            _event: PhantomData,
        }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn version_of(
        executor: impl sqlx::PgExecutor<'_>,
        stream: &StreamKey,
    ) -> EventStoreResult<EventVersion> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM eventide_events \
             WHERE partition_key = $1 AND aggregate_id = $2",
        )
        .bind(stream.partition_key.as_ref())
        .bind(stream.aggregate_id.as_ref())
        .fetch_one(executor)
        .await
        .map_err(|error| map_sqlx_error(&error, "stream_version"))?;
        let version: i64 = row
            .try_get("version")
            .map_err(|error| map_sqlx_error(&error, "stream_version"))?;
        u64::try_from(version)
            .ok()
            .and_then(|version| EventVersion::try_new(version).ok())
            .ok_or_else(|| EventStoreError::Internal(format!("negative version {version}")))
    }

    async fn conflict_after_race(
        &self,
        stream: &StreamKey,
        expected: EventVersion,
    ) -> EventStoreError {
        match Self::version_of(&self.pool, stream).await {
            Ok(current) => EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected,
                current,
            },
            Err(error) => error,
        }
    }
}

/// Stamps `count` events strictly after `last` and not before now.
fn commit_timestamps(last: Timestamp, count: usize) -> Vec<Timestamp> {
    let now = Timestamp::now().truncated_to_micros();
    let mut previous = last;
    (0..count)
        .map(|_| {
            previous = if now > previous {
                now
            } else {
                previous.next_tick()
            };
            previous
        })
        .collect()
}

async fn lock_clock(tx: &mut PgTransaction) -> EventStoreResult<Timestamp> {
    let row = sqlx::query("SELECT last_timestamp FROM eventide_clock WHERE id = 1 FOR UPDATE")
        .fetch_one(&mut **tx)
        .await
        .map_err(|error| map_sqlx_error(&error, "lock_clock"))?;
    let last: DateTime<Utc> = row
        .try_get("last_timestamp")
        .map_err(|error| map_sqlx_error(&error, "lock_clock"))?;
    Ok(Timestamp::new(last))
}

#[async_trait]
impl<E: DomainEvent> EventLog for PostgresEventLog<E> {
    type Event = E;

    #[instrument(name = "postgres.append", skip(self, events), fields(stream = %stream, expected = %expected_version, count = events.len()))]
    async fn append(
        &self,
        stream: &StreamKey,
        expected_version: EventVersion,
        events: Vec<NewEvent<E>>,
    ) -> EventStoreResult<EventVersion> {
        if events.is_empty() {
            let current = Self::version_of(&self.pool, stream).await?;
            return if current == expected_version {
                Ok(current)
            } else {
                Err(EventStoreError::ConcurrencyConflict {
                    stream: stream.clone(),
                    expected: expected_version,
                    current,
                })
            };
        }

        let mut ids = HashSet::with_capacity(events.len());
        let mut rows = Vec::with_capacity(events.len());
        for event in &events {
            if !ids.insert(event.event_id) {
                return Err(EventStoreError::DuplicateEventId(event.event_id));
            }
            let payload = serde_json::to_value(&event.payload)
                .map_err(|e| EventStoreError::SerializationFailed(e.to_string()))?;
            let metadata = serde_json::to_value(&event.metadata)
                .map_err(|e| EventStoreError::SerializationFailed(e.to_string()))?;
            rows.push((event.event_id, event.payload.event_type(), payload, metadata));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(&error, "begin"))?;
        let last = lock_clock(&mut tx).await?;

        let current = Self::version_of(&mut *tx, stream).await?;
        if current != expected_version {
            debug!(current = %current, "Rejecting append with stale expected version");
            return Err(EventStoreError::ConcurrencyConflict {
                stream: stream.clone(),
                expected: expected_version,
                current,
            });
        }

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT event_id FROM eventide_events WHERE event_id = ANY($1) LIMIT 1")
                .bind(ids.iter().map(|id| *id.as_ref()).collect::<Vec<Uuid>>())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(&error, "append"))?;
        if let Some(existing) = existing.and_then(|id| EventId::try_new(id).ok()) {
            return Err(EventStoreError::DuplicateEventId(existing));
        }

        let timestamps = commit_timestamps(last, rows.len());
        let mut version = current;
        for ((event_id, event_type, payload, metadata), timestamp) in rows.into_iter().zip(&timestamps) {
            version = version.next();
            let version_i64 = i64::try_from(version.value())
                .map_err(|_| EventStoreError::Internal(format!("version {version} overflows")))?;
            let inserted = sqlx::query(
                "INSERT INTO eventide_events \
                 (event_id, partition_key, aggregate_id, version, event_type, payload, metadata, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(*event_id.as_ref())
            .bind(stream.partition_key.as_ref())
            .bind(stream.aggregate_id.as_ref())
            .bind(version_i64)
            .bind(event_type.as_ref())
            .bind(Json(payload))
            .bind(Json(metadata))
            .bind(timestamp.into_datetime())
            .execute(&mut *tx)
            .await;
            if let Err(error) = inserted {
                if unique_violation(&error) {
                    drop(tx);
                    warn!("Append lost a race on the stream version");
                    return Err(self.conflict_after_race(stream, expected_version).await);
                }
                return Err(map_sqlx_error(&error, "append"));
            }
        }

        if let Some(latest) = timestamps.last() {
            sqlx::query("UPDATE eventide_clock SET last_timestamp = $1 WHERE id = 1")
                .bind(latest.into_datetime())
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(&error, "append"))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(&error, "commit"))?;
        debug!(new_version = %version, "Appended events");
        Ok(version)
    }

    #[instrument(name = "postgres.read_stream", skip(self), fields(stream = %stream))]
    async fn read_stream(&self, stream: &StreamKey) -> EventStoreResult<Vec<RecordedEvent<E>>> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENTS} WHERE partition_key = $1 AND aggregate_id = $2 ORDER BY version"
        ))
        .bind(stream.partition_key.as_ref())
        .bind(stream.aggregate_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, "read_stream"))?;
        decode_rows(rows)
    }

    async fn stream_version(&self, stream: &StreamKey) -> EventStoreResult<EventVersion> {
        Self::version_of(&self.pool, stream).await
    }

    #[instrument(name = "postgres.read_all_after", skip(self))]
    async fn read_all_after(
        &self,
        after: Option<Timestamp>,
        limit: usize,
    ) -> EventStoreResult<Vec<RecordedEvent<E>>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "{SELECT_EVENTS} WHERE $1::timestamptz IS NULL OR recorded_at > $1 \
             ORDER BY recorded_at LIMIT $2"
        ))
        .bind(after.map(Timestamp::into_datetime))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, "read_all_after"))?;
        decode_rows(rows)
    }

    async fn statistics(&self) -> EventStoreResult<EventLogStatistics> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COUNT(DISTINCT (partition_key, aggregate_id)) AS streams, \
             MAX(recorded_at) AS latest FROM eventide_events",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, "statistics"))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|error| map_sqlx_error(&error, "statistics"))?;
        let streams: i64 = row
            .try_get("streams")
            .map_err(|error| map_sqlx_error(&error, "statistics"))?;
        let latest: Option<DateTime<Utc>> = row
            .try_get("latest")
            .map_err(|error| map_sqlx_error(&error, "statistics"))?;
        Ok(EventLogStatistics {
            total_events_count: u64::try_from(total).unwrap_or_default(),
            stream_count: u64::try_from(streams).unwrap_or_default(),
            latest_event_timestamp: latest.map(Timestamp::new),
        })
    }
}

fn decode_rows<E: DomainEvent>(rows: Vec<PgRow>) -> EventStoreResult<Vec<RecordedEvent<E>>> {
    rows.into_iter()
        .map(|row| {
            EventRow::try_from(row)
                .map_err(|error| map_sqlx_error(&error, "decode"))?
                .to_recorded_event()
        })
        .collect()
}

fn map_sqlx_error(error: &sqlx::Error, operation: &'static str) -> EventStoreError {
    error!(error = %error, operation, "[postgres.database_error] database operation failed");
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            EventStoreError::ConnectionFailed(format!("{operation}: {error}"))
        }
        sqlx::Error::PoolClosed => EventStoreError::Unavailable(format!("{operation}: {error}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::DeserializationFailed(format!("{operation}: {error}"))
        }
        _ => EventStoreError::Internal(format!("{operation}: {error}")),
    }
}
