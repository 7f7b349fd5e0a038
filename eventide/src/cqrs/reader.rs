//! Typed, readiness-checked access to projection documents.

use super::document_store::DocumentStore;
use super::index_state::IndexStateStore;
use super::query::Filter;
use super::schema::{IndexDefinition, ProjectionDocument, ProjectionSchema};
use super::{CqrsError, CqrsResult};
use crate::types::{IndexName, PartitionKey};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::instrument;

/// Reads documents of one projection.
///
/// Every read first checks that the index has been ensured (otherwise
/// `InvalidSchema`) and that it is fully built (otherwise `IndexNotReady`),
/// so callers never see a half-rebuilt index as if it were complete.
pub struct ProjectionReader<T> {
    documents: Arc<dyn DocumentStore>,
    index_state: Arc<dyn IndexStateStore>,
    _document: PhantomData<fn() -> T>,
}

impl<T> Clone for ProjectionReader<T> {
    fn clone(&self) -> Self {
        Self {
            documents: Arc::clone(&self.documents),
            index_state: Arc::clone(&self.index_state),
            _document: PhantomData,
        }
    }
}

impl<T: ProjectionSchema> ProjectionReader<T> {
    /// Creates a reader.
    pub fn new(documents: Arc<dyn DocumentStore>, index_state: Arc<dyn IndexStateStore>) -> Self {
        Self {
            documents,
            index_state,
            _document: PhantomData,
        }
    }

    /// The index this reader serves.
    pub fn index_name(&self) -> IndexName {
        T::index_name()
    }

    /// Fetches a document, failing with `DocumentNotFound` when absent.
    pub async fn get(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<ProjectionDocument<T>> {
        self.find(id, partition_key)
            .await?
            .ok_or_else(|| CqrsError::DocumentNotFound {
                index: T::index_name(),
                id: id.to_string(),
            })
    }

    /// Fetches a document if it exists.
    pub async fn find(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<Option<ProjectionDocument<T>>> {
        let index = T::index_name();
        self.ensure_ready(&index).await?;
        self.documents
            .get(&index, id, partition_key)
            .await?
            .map(|stored| stored.to_typed())
            .transpose()
    }

    /// Documents matching every filter, optionally within one partition.
    ///
    /// Filters may only reference fields the schema declares filterable.
    #[instrument(skip(self, filters), fields(index = %T::index_name(), filters = filters.len()))]
    pub async fn query(
        &self,
        partition_key: Option<&PartitionKey>,
        filters: &[Filter],
    ) -> CqrsResult<Vec<ProjectionDocument<T>>> {
        let index = T::index_name();
        let definition = self.ensure_ready(&index).await?;
        for property in filters.iter().flat_map(Filter::properties) {
            if !definition.is_filterable(property) {
                return Err(CqrsError::query(format!(
                    "field '{property}' is not declared filterable on index '{index}'"
                )));
            }
        }
        self.documents
            .query(&index, partition_key, filters)
            .await?
            .iter()
            .map(super::schema::StoredDocument::to_typed)
            .collect()
    }

    /// Like [`ProjectionReader::query`], reading filters from their wire form.
    pub async fn query_wire(
        &self,
        partition_key: Option<&PartitionKey>,
        wire_filters: &[&str],
    ) -> CqrsResult<Vec<ProjectionDocument<T>>> {
        let filters = wire_filters
            .iter()
            .map(|wire| Filter::from_wire(wire))
            .collect::<Result<Vec<_>, _>>()?;
        self.query(partition_key, &filters).await
    }

    async fn ensure_ready(&self, index: &IndexName) -> CqrsResult<IndexDefinition> {
        let definition = self
            .documents
            .index_definition(index)
            .await?
            .ok_or_else(|| {
                CqrsError::invalid_schema(
                    index.clone(),
                    "index has not been ensured; call ensure_index before use",
                )
            })?;
        let status = self
            .index_state
            .index_status(index)
            .await?
            .ok_or_else(|| CqrsError::UnknownIndex(index.clone()))?;
        if !status.is_ready() {
            return Err(CqrsError::IndexNotReady {
                index: index.clone(),
            });
        }
        Ok(definition)
    }
}
