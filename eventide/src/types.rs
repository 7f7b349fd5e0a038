//! Core types for the `eventide` event sourcing engine.
//!
//! All identifiers use smart constructors so that an instance is valid by
//! construction, following the "parse, don't validate" principle.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identity of an aggregate instance.
///
/// Guaranteed to be non-empty and at most 255 characters after trimming.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

/// Partition key that scopes a stream (and the documents derived from it).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PartitionKey(String);

/// The tag identifying the kind of an event (`OrderPlaced`, `OrderItemAdded`, ...).
///
/// Projection builders are routed by this tag.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

impl EventType {
    /// Builds an event type tag from a static name.
    ///
    /// Intended for the string literals returned by `DomainEvent::event_type`.
    pub fn of(name: &'static str) -> Self {
        Self::try_new(name).expect("event type names declared in code must be non-empty")
    }
}

/// Name of a projection index (one index per document shape).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct IndexName(String);

impl IndexName {
    /// Builds an index name from a static name declared by a projection schema.
    pub fn of(name: &'static str) -> Self {
        Self::try_new(name).expect("index names declared in code must be non-empty")
    }
}

/// Identity of a worker that may hold rebuild leases or run live delivery.
///
/// Always supplied by the caller; nothing in the engine derives it from the
/// host environment.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct WorkerId(String);

/// A globally unique event identifier using `UUIDv7` format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// The version of a stream.
///
/// A stream with no events is at version 0; the first appended event gets
/// version 1 and every further event increments it by exactly one.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct EventVersion(u64);

impl EventVersion {
    /// The version of an empty stream (0).
    pub fn initial() -> Self {
        Self::try_new(0).expect("0 is always a valid version")
    }

    /// Returns the next version after this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next version should always be valid")
    }

    /// Returns the version reached after appending `count` events.
    #[must_use]
    pub fn advance(self, count: usize) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + count as u64).expect("advanced version should always be valid")
    }

    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.into()
    }
}

impl Default for EventVersion {
    fn default() -> Self {
        Self::initial()
    }
}

/// The identity of a stream: an aggregate id within a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    /// Aggregate the stream belongs to.
    pub aggregate_id: AggregateId,
    /// Partition the stream lives in.
    pub partition_key: PartitionKey,
}

impl StreamKey {
    /// Creates a stream key.
    pub const fn new(aggregate_id: AggregateId, partition_key: PartitionKey) -> Self {
        Self {
            aggregate_id,
            partition_key,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.aggregate_id)
    }
}

/// A UTC timestamp.
///
/// Event log backends assign commit timestamps that strictly increase, which
/// makes a timestamp usable as an exclusive replay checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// The smallest timestamp that orders strictly after `self`
    /// at the microsecond precision persisted by the storage backends.
    #[must_use]
    pub fn next_tick(self) -> Self {
        Self(self.0 + chrono::Duration::microseconds(1))
    }

    /// Time elapsed from `earlier` to `self`, saturating at zero.
    pub fn duration_since(&self, earlier: Self) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Truncates to microsecond precision.
    #[must_use]
    pub fn truncated_to_micros(self) -> Self {
        let micros = self.0.timestamp_micros();
        DateTime::from_timestamp_micros(micros).map_or(self, Self)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
