//! Projection builders and the document operations they perform.
//!
//! A [`ProjectionBuilder`] maps events to documents of one
//! [`ProjectionSchema`]. It never talks to the document store directly; it
//! gets a [`DocumentWriter`] scoped to the event being applied, which makes
//! every write idempotent per source stream version and applies the
//! configured [`MissingDocumentPolicy`].

use crate::config::MissingDocumentPolicy;
use crate::cqrs::{
    CqrsError, DocumentStore, ProjectionDocument, ProjectionSchema, StoredDocument,
};
use crate::errors::{ProjectionError, ProjectionResult};
use crate::event::{DomainEvent, EventPosition, RecordedEvent};
use crate::types::{EventType, IndexName, PartitionKey, Timestamp};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Event-to-document mapping for one projection.
///
/// Builders are registered with the projections engine and receive exactly
/// the events whose type they declare, both live and during replay.
#[async_trait]
pub trait ProjectionBuilder<E: DomainEvent>: Send + Sync + 'static {
    /// The document shape this builder maintains.
    type Document: ProjectionSchema;

    /// Unique builder name, used in logs and dead letters.
    fn name(&self) -> &str;

    /// Event types this builder consumes.
    fn handled_event_types(&self) -> Vec<EventType>;

    /// Applies one event.
    async fn apply(
        &self,
        event: &RecordedEvent<E>,
        documents: &DocumentWriter<'_, Self::Document>,
    ) -> ProjectionResult<()>;
}

/// Result of a write through a [`DocumentWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The document was written.
    Applied,
    /// The document already reflects this event; nothing was written.
    AlreadyApplied,
    /// The target document does not exist; the event was parked for retry.
    DeadLettered,
    /// The target document does not exist; the update was skipped.
    Dropped,
}

/// A document that an update targeted but could not find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTarget {
    /// Document id.
    pub id: String,
    /// Partition key.
    pub partition_key: PartitionKey,
}

/// What a [`DocumentWriter`] could not do while applying one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Targets parked under the `DeadLetter` policy.
    pub missing: Vec<MissingTarget>,
    /// Updates skipped under the `Drop` policy.
    pub dropped: usize,
}

/// Read-modify-write cycles a writer attempts before surfacing a
/// `WriteConflict`.
const MAX_WRITE_ATTEMPTS: u32 = 8;

/// What a read-modify-write cycle decided after reading the document.
enum Write {
    Store(StoredDocument),
    Done(UpdateOutcome),
}

/// Document operations available to a builder while it applies one event.
///
/// Each stored document remembers the highest version it has seen from each
/// source stream; writes for an event at or below that version are skipped,
/// so applying the same event twice yields the same document. Writes are
/// conditional on the revision that was read and are retried from a fresh
/// read when another writer got there first.
pub struct DocumentWriter<'a, T> {
    store: &'a dyn DocumentStore,
    index: IndexName,
    builder: &'a str,
    position: EventPosition,
    policy: MissingDocumentPolicy,
    report: Mutex<WriteReport>,
    _document: PhantomData<fn() -> T>,
}

impl<'a, T: ProjectionSchema> DocumentWriter<'a, T> {
    /// Creates a writer for the event at `position`.
    pub fn new(
        store: &'a dyn DocumentStore,
        builder: &'a str,
        position: EventPosition,
        policy: MissingDocumentPolicy,
    ) -> Self {
        Self {
            store,
            index: T::index_name(),
            builder,
            position,
            policy,
            report: Mutex::new(WriteReport::default()),
            _document: PhantomData,
        }
    }

    /// The event being applied.
    pub const fn position(&self) -> &EventPosition {
        &self.position
    }

    /// Reads a document.
    pub async fn get_document(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> ProjectionResult<Option<ProjectionDocument<T>>> {
        Ok(self
            .store
            .get(&self.index, id, partition_key)
            .await?
            .map(|stored| stored.to_typed())
            .transpose()?)
    }

    /// Creates or replaces a document.
    ///
    /// Skipped when the existing document already reflects this event or a
    /// later one from the same stream.
    pub async fn upsert_document(
        &self,
        document: ProjectionDocument<T>,
    ) -> ProjectionResult<UpdateOutcome> {
        self.read_modify_write(&document.id, &document.partition_key, |existing| {
            let mut stored = StoredDocument::from_typed(&document, BTreeMap::new())?;
            if let Some(existing) = existing {
                if existing.has_applied(&self.position) {
                    return Ok(Write::Done(UpdateOutcome::AlreadyApplied));
                }
                stored = stored.replacing(&existing);
            }
            stored.mark_applied(&self.position);
            Ok(Write::Store(stored))
        })
        .await
    }

    /// Mutates an existing document and stamps it with `timestamp`.
    ///
    /// When the document does not exist the configured
    /// [`MissingDocumentPolicy`] decides: park the event, skip the update,
    /// or fail. The mutator runs again on a fresh copy if another writer
    /// changed the document in the meantime.
    pub async fn update_document<F>(
        &self,
        id: &str,
        partition_key: &PartitionKey,
        timestamp: Timestamp,
        mut mutator: F,
    ) -> ProjectionResult<UpdateOutcome>
    where
        F: FnMut(&mut T) + Send,
    {
        self.read_modify_write(id, partition_key, |current| {
            let Some(stored) = current else {
                return self.on_missing(id, partition_key).map(Write::Done);
            };
            if stored.has_applied(&self.position) {
                return Ok(Write::Done(UpdateOutcome::AlreadyApplied));
            }
            let mut document: ProjectionDocument<T> = stored.to_typed()?;
            mutator(&mut document.body);
            document.updated_at = timestamp;
            let mut updated =
                StoredDocument::from_typed(&document, BTreeMap::new())?.replacing(&stored);
            updated.mark_applied(&self.position);
            Ok(Write::Store(updated))
        })
        .await
    }

    /// Sets a document's last-updated timestamp without touching its body.
    pub async fn set_document_updated_at(
        &self,
        id: &str,
        partition_key: &PartitionKey,
        timestamp: Timestamp,
    ) -> ProjectionResult<UpdateOutcome> {
        self.read_modify_write(id, partition_key, |current| {
            let Some(mut stored) = current else {
                return self.on_missing(id, partition_key).map(Write::Done);
            };
            if stored.has_applied(&self.position) {
                return Ok(Write::Done(UpdateOutcome::AlreadyApplied));
            }
            stored.updated_at = timestamp;
            stored.mark_applied(&self.position);
            Ok(Write::Store(stored))
        })
        .await
    }

    /// Deletes a document in response to a domain-level deletion event.
    pub async fn delete_document(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> ProjectionResult<bool> {
        Ok(self.store.delete(&self.index, id, partition_key).await?)
    }

    /// Missing targets and dropped updates seen while applying this event.
    pub fn into_report(self) -> WriteReport {
        self.report
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn report(&self) -> std::sync::MutexGuard<'_, WriteReport> {
        self.report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Reads the document, lets `change` decide what to write, and stores
    /// the result conditionally on the revision that was read. A write that
    /// loses to a concurrent writer is recomputed from a fresh read.
    async fn read_modify_write<F>(
        &self,
        id: &str,
        partition_key: &PartitionKey,
        mut change: F,
    ) -> ProjectionResult<UpdateOutcome>
    where
        F: FnMut(Option<StoredDocument>) -> ProjectionResult<Write> + Send,
    {
        let mut attempt = 1;
        loop {
            let current = self.store.get(&self.index, id, partition_key).await?;
            let document = match change(current)? {
                Write::Store(document) => document,
                Write::Done(outcome) => return Ok(outcome),
            };
            match self.store.upsert(&self.index, document).await {
                Ok(_) => return Ok(UpdateOutcome::Applied),
                Err(CqrsError::WriteConflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(
                        builder = self.builder,
                        index = %self.index,
                        document_id = id,
                        attempt,
                        "Document changed concurrently; re-reading"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn on_missing(&self, id: &str, partition_key: &PartitionKey) -> ProjectionResult<UpdateOutcome> {
        match self.policy {
            MissingDocumentPolicy::DeadLetter => {
                self.report().missing.push(MissingTarget {
                    id: id.to_string(),
                    partition_key: partition_key.clone(),
                });
                Ok(UpdateOutcome::DeadLettered)
            }
            MissingDocumentPolicy::Drop => {
                self.report().dropped += 1;
                warn!(
                    builder = self.builder,
                    index = %self.index,
                    document_id = id,
                    event_id = %self.position.event_id,
                    "Update targets a missing document; dropping it"
                );
                Ok(UpdateOutcome::Dropped)
            }
            MissingDocumentPolicy::Fail => Err(ProjectionError::MissingDocument {
                builder: self.builder.to_string(),
                index: self.index.clone(),
                id: id.to_string(),
            }),
        }
    }
}

/// Type-erased builder as stored in the engine's registry.
#[async_trait]
pub(crate) trait RegisteredBuilder<E: DomainEvent>: Send + Sync {
    fn name(&self) -> &str;

    fn index_name(&self) -> IndexName;

    fn handled_event_types(&self) -> Vec<EventType>;

    /// Applies `event`, reporting missing targets and dropped updates.
    async fn apply(
        &self,
        event: &RecordedEvent<E>,
        store: &dyn DocumentStore,
        policy: MissingDocumentPolicy,
    ) -> ProjectionResult<WriteReport>;
}

pub(crate) struct BuilderHandle<B> {
    builder: B,
}

impl<B> BuilderHandle<B> {
    pub(crate) const fn new(builder: B) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl<E, B> RegisteredBuilder<E> for BuilderHandle<B>
where
    E: DomainEvent,
    B: ProjectionBuilder<E>,
{
    fn name(&self) -> &str {
        self.builder.name()
    }

    fn index_name(&self) -> IndexName {
        B::Document::index_name()
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        self.builder.handled_event_types()
    }

    async fn apply(
        &self,
        event: &RecordedEvent<E>,
        store: &dyn DocumentStore,
        policy: MissingDocumentPolicy,
    ) -> ProjectionResult<WriteReport> {
        let writer =
            DocumentWriter::<B::Document>::new(store, self.builder.name(), event.position(), policy);
        self.builder.apply(event, &writer).await?;
        Ok(writer.into_report())
    }
}
