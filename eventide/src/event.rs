//! Event types.
//!
//! A [`NewEvent`] is what a writer hands to the event log; a
//! [`RecordedEvent`] is what the log hands back once the event is durable,
//! with its stream version and commit timestamp assigned.

use crate::metadata::EventMetadata;
use crate::types::{AggregateId, EventId, EventType, EventVersion, PartitionKey, StreamKey, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A domain event payload.
///
/// The event type tag routes the event to projection builders and is stored
/// next to the payload so that backends can filter without decoding it.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// The tag identifying this event's kind.
    fn event_type(&self) -> EventType;
}

/// An event waiting to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent<E> {
    /// Identifier assigned by the writer
    pub event_id: EventId,
    /// The domain payload
    pub payload: E,
    /// Actor identity, correlation and causation
    pub metadata: EventMetadata,
}

impl<E> NewEvent<E> {
    /// Wraps a payload with a fresh id and anonymous metadata.
    pub fn new(payload: E) -> Self {
        Self::with_metadata(payload, EventMetadata::default())
    }

    /// Wraps a payload with the given metadata.
    pub fn with_metadata(payload: E, metadata: EventMetadata) -> Self {
        Self {
            event_id: EventId::new(),
            payload,
            metadata,
        }
    }
}

/// An immutable, durably recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent<E> {
    /// Unique event identifier
    pub event_id: EventId,
    /// Aggregate whose stream holds the event
    pub aggregate_id: AggregateId,
    /// Partition of the stream
    pub partition_key: PartitionKey,
    /// Position within the stream, starting at 1
    pub version: EventVersion,
    /// Event type tag
    pub event_type: EventType,
    /// Domain payload
    pub payload: E,
    /// Commit timestamp (UTC), strictly increasing across the log
    pub timestamp: Timestamp,
    /// Actor identity, correlation and causation
    pub metadata: EventMetadata,
}

impl<E> RecordedEvent<E> {
    /// The stream this event belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.aggregate_id.clone(), self.partition_key.clone())
    }

    /// Where this event sits in the log.
    pub fn position(&self) -> EventPosition {
        EventPosition {
            event_id: self.event_id,
            stream: self.stream_key(),
            version: self.version,
            timestamp: self.timestamp,
        }
    }
}

/// The coordinates of a recorded event, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    /// Event identifier
    pub event_id: EventId,
    /// Stream holding the event
    pub stream: StreamKey,
    /// Version within the stream
    pub version: EventVersion,
    /// Commit timestamp
    pub timestamp: Timestamp,
}
