//! Projection document storage.

use super::query::Filter;
use super::schema::{IndexDefinition, StoredDocument};
use super::CqrsResult;
use crate::types::{IndexName, PartitionKey};
use async_trait::async_trait;

/// Persists projection documents, grouped by index.
///
/// An index must be created with [`DocumentStore::ensure_index`] before any
/// other operation touches it; implementations fail with
/// `CqrsError::InvalidSchema` otherwise. Documents are addressed by
/// `(index, partition key, id)`.
///
/// Writes are conditional on [`StoredDocument::revision`]: an upsert whose
/// revision no longer matches the stored copy fails with
/// `CqrsError::WriteConflict` and changes nothing.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the index, or replaces its definition if it already exists.
    /// Existing documents are kept.
    async fn ensure_index(&self, definition: &IndexDefinition) -> CqrsResult<()>;

    /// The stored definition of an index, if it has been ensured.
    async fn index_definition(&self, index: &IndexName) -> CqrsResult<Option<IndexDefinition>>;

    /// Fetches one document.
    async fn get(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<Option<StoredDocument>>;

    /// Inserts or replaces one document, returning its new revision.
    ///
    /// A document with revision 0 is only inserted when no document exists
    /// under its key; any other revision must equal the stored one.
    async fn upsert(&self, index: &IndexName, document: StoredDocument) -> CqrsResult<u64>;

    /// Deletes one document, returning whether it existed.
    async fn delete(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<bool>;

    /// Documents of an index, optionally restricted to one partition, that
    /// match every filter.
    async fn query(
        &self,
        index: &IndexName,
        partition_key: Option<&PartitionKey>,
        filters: &[Filter],
    ) -> CqrsResult<Vec<StoredDocument>>;

    /// Removes every document of an index, keeping its definition. Returns
    /// how many documents were removed.
    async fn clear_index(&self, index: &IndexName) -> CqrsResult<usize>;

    /// Number of documents in an index.
    async fn count(&self, index: &IndexName) -> CqrsResult<usize>;
}
