//! `eventide` - event sourcing with projections and lease-based rebuilds
//!
//! Aggregates are folded from per-stream event histories kept in an
//! [`EventLog`] that uses optimistic concurrency. Read models are maintained
//! by [`ProjectionBuilder`]s that the [`ProjectionsEngine`] feeds, live
//! through an [`EventsObserver`] and historically through replay. A
//! [`cqrs::RebuildCoordinator`] regenerates read models from scratch under
//! exclusive, expiring leases, checkpointing after every batch.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod cancellation;
pub mod config;
pub mod cqrs;
pub mod errors;
pub mod event;
pub mod event_store;
pub mod metadata;
pub mod observer;
pub mod projection;
pub mod projection_engine;
pub mod repository;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use aggregate::{Aggregate, AggregateRoot};
pub use cancellation::Cancellation;
pub use config::{
    ConflictRetryConfig, MissingDocumentPolicy, PollingConfig, ProjectionEngineConfig,
    RebuildConfig,
};
pub use errors::{EventStoreError, EventStoreResult, ProjectionError, ProjectionResult};
pub use event::{DomainEvent, EventPosition, NewEvent, RecordedEvent};
pub use event_store::{replay_all, EventLog, EventLogStatistics, ReplayCursor, ReplayOutcome};
pub use metadata::{ActorIdentity, EventMetadata};
pub use observer::{
    ChangeFeed, ChangeFeedObserver, DeliveryMode, EventSink, EventsObserver, PollingObserver,
    StartPosition,
};
pub use projection::{DocumentWriter, MissingTarget, ProjectionBuilder, UpdateOutcome, WriteReport};
pub use projection_engine::{
    DeadLetter, DeadLetterRetryReport, EngineHandle, EngineStats, IndexFilter, ProjectionsEngine,
    ReplayProgress,
};
pub use repository::Repository;
pub use types::{
    AggregateId, EventId, EventType, EventVersion, IndexName, PartitionKey, StreamKey, Timestamp,
    WorkerId,
};
