//! Error types for eventide.
//!
//! Each layer has its own error type so callers can tell apart failures they
//! can recover from (a concurrency conflict is resolved by reloading and
//! retrying) from failures they must surface.
//!
//! # Error Categories
//!
//! - **EventStoreError**: event log failures, including optimistic
//!   concurrency conflicts
//! - **ProjectionError**: failures while routing events to projection
//!   builders, live or during replay
//! - **CqrsError** (in [`crate::cqrs`]): document store, index state, and
//!   query failures
//!
//! Errors from a lower layer are wrapped, never replaced by default or empty
//! results.

use crate::cqrs::CqrsError;
use crate::types::{EventId, EventVersion, IndexName, StreamKey};
use thiserror::Error;

/// Errors that can occur when interacting with the event log.
///
/// # Common Scenarios
///
/// - **ConcurrencyConflict**: another writer appended to the stream since it
///   was read; reload and retry
/// - **StreamNotFound**: the stream has no events
/// - **ConnectionFailed** / **Unavailable**: backend trouble, retry later
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The stream's current version did not match the expected version.
    /// Nothing was written.
    #[error(
        "Concurrency conflict on stream '{stream}': expected version {expected}, but current is {current}"
    )]
    ConcurrencyConflict {
        /// The stream that was written to
        stream: StreamKey,
        /// The version the caller expected
        expected: EventVersion,
        /// The stream's actual version
        current: EventVersion,
    },

    /// The requested stream has no events.
    #[error("Stream '{0}' not found")]
    StreamNotFound(StreamKey),

    /// An event with the given ID already exists.
    #[error("Duplicate event ID: {0}")]
    DuplicateEventId(EventId),

    /// Serialization of an event failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization of an event failed.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// The connection to the backend failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The event log is temporarily unavailable.
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventStoreError {
    /// Whether this error is an optimistic concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Errors raised by the projections engine, its builders, and observers.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// An error occurred in the event log.
    #[error("Event log error: {0}")]
    EventStore(#[from] EventStoreError),

    /// An error occurred in the document store or index state.
    #[error("Projection store error: {0}")]
    Store(#[from] CqrsError),

    /// A builder failed to apply an event.
    #[error("Builder '{builder}' failed to apply event {event_id}: {reason}")]
    BuilderFailed {
        /// Name of the failing builder
        builder: String,
        /// The event being applied
        event_id: EventId,
        /// The reason for the failure
        reason: String,
    },

    /// An update targeted a document that does not exist, under the
    /// `Fail` missing-document policy.
    #[error("Builder '{builder}' tried to update missing document '{id}' in index '{index}'")]
    MissingDocument {
        /// Name of the builder
        builder: String,
        /// The index written to
        index: IndexName,
        /// The missing document id
        id: String,
    },

    /// A builder with the same name is already registered.
    #[error("A projection builder named '{0}' is already registered")]
    DuplicateBuilder(String),

    /// No registered builder maintains the requested index.
    #[error("No projection builder maintains index '{0}'")]
    UnknownIndex(IndexName),

    /// Live delivery was started without an events observer.
    #[error("No events observer configured")]
    NoObserver,

    /// Live delivery is already running.
    #[error("Live event delivery is already running for worker '{0}'")]
    AlreadyRunning(String),

    /// A projection document could not be converted.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProjectionError {
    /// Creates a builder failure for the given event.
    pub fn builder_failed(
        builder: impl Into<String>,
        event_id: EventId,
        reason: impl Into<String>,
    ) -> Self {
        Self::BuilderFailed {
            builder: builder.into(),
            event_id,
            reason: reason.into(),
        }
    }
}

/// Result type for event log operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result type for projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateId, PartitionKey};

    fn stream() -> StreamKey {
        StreamKey::new(
            AggregateId::try_new("order-7").unwrap(),
            PartitionKey::try_new("eu").unwrap(),
        )
    }

    #[test]
    fn conflict_message_names_stream_and_versions() {
        let error = EventStoreError::ConcurrencyConflict {
            stream: stream(),
            expected: EventVersion::initial(),
            current: EventVersion::initial().next(),
        };
        assert!(error.is_conflict());
        assert_eq!(
            error.to_string(),
            "Concurrency conflict on stream 'eu/order-7': expected version 0, but current is 1"
        );
    }

    #[test]
    fn event_store_errors_convert_into_projection_errors() {
        let error: ProjectionError = EventStoreError::StreamNotFound(stream()).into();
        assert!(matches!(
            error,
            ProjectionError::EventStore(EventStoreError::StreamNotFound(_))
        ));
    }

    #[test]
    fn store_errors_keep_their_kind() {
        let index = IndexName::of("orders");
        let error: ProjectionError = CqrsError::IndexNotReady {
            index: index.clone(),
        }
        .into();
        assert!(matches!(
            error,
            ProjectionError::Store(CqrsError::IndexNotReady { index: ref i }) if *i == index
        ));
    }
}
