//! The read side: projection documents, index state, queries and rebuilds.
//!
//! - [`DocumentStore`] persists projection documents per index.
//! - [`IndexStateStore`] persists the [`ProjectionIndexState`] control
//!   record and hands out exclusive rebuild leases.
//! - [`ProjectionReader`] queries documents, refusing to serve an index
//!   that is missing or still being rebuilt.
//! - [`RebuildCoordinator`] finds indexes that need rebuilding, leases them,
//!   and replays the event log into them in checkpointed batches.
//!
//! [`InMemoryProjectionStore`] implements both stores for tests and
//! single-process use.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = Arc::new(InMemoryProjectionStore::new());
//! let engine = ProjectionsEngine::new(log.clone(), store.clone(), store.clone(), Default::default());
//! engine.add_projection_builder(OrderSummaryBuilder).await?;
//!
//! let coordinator = RebuildCoordinator::new(engine.clone(), worker_id, RebuildConfig::default());
//! coordinator.run_pass(&Cancellation::new()).await?;
//!
//! let reader = ProjectionReader::<OrderSummary>::new(store.clone(), store);
//! let open = reader.query(None, &[Filter::eq("status", "open")]).await?;
//! ```

mod document_store;
mod index_state;
mod memory;
mod query;
mod reader;
mod rebuild;
mod schema;

pub use document_store::DocumentStore;
pub use index_state::{
    IndexLease, IndexStateStore, IndexStatus, ProjectionIndexState, RebuildCheckpoint,
};
pub use memory::InMemoryProjectionStore;
pub use query::{Filter, FilterError, FilterLogic, FilterOperator, FilterValue, NestedFilter};
pub use reader::ProjectionReader;
pub use rebuild::{IndexRebuildOutcome, RebuildCoordinator, RebuildPassReport};
pub use schema::{
    FieldKind, FieldSpec, IndexDefinition, ProjectionDocument, ProjectionSchema, StoredDocument,
};

use crate::errors::EventStoreError;
use crate::types::{IndexName, WorkerId};

/// Result type for read-side operations.
pub type CqrsResult<T> = Result<T, CqrsError>;

/// Errors that can occur on the read side.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CqrsError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Query could not be executed.
    #[error("Query error: {0}")]
    Query(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A filter could not be read or written.
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// The index is missing required structure.
    #[error("Invalid schema for index '{index}': {detail}")]
    InvalidSchema {
        /// The index
        index: IndexName,
        /// What is missing
        detail: String,
    },

    /// The index is being rebuilt and would return partial data.
    #[error("Index '{index}' is not ready: a rebuild is pending or in progress")]
    IndexNotReady {
        /// The index
        index: IndexName,
    },

    /// A document that was expected to exist is absent.
    #[error("Document '{id}' not found in index '{index}'")]
    DocumentNotFound {
        /// The index
        index: IndexName,
        /// The document id
        id: String,
    },

    /// A conditional document write lost to a concurrent writer.
    #[error("Document '{id}' in index '{index}' changed since it was read")]
    WriteConflict {
        /// The index
        index: IndexName,
        /// The document id
        id: String,
    },

    /// The index has never been registered.
    #[error("Unknown index '{0}'")]
    UnknownIndex(IndexName),

    /// The caller's rebuild lease was taken over or released.
    #[error("Worker '{worker}' no longer holds the rebuild lease for index '{index}'")]
    LeaseLost {
        /// The index
        index: IndexName,
        /// The former holder
        worker: WorkerId,
    },

    /// The event log failed.
    #[error("Event log error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Rebuilding one index failed.
    #[error("Rebuild of index '{index}' failed: {reason}")]
    RebuildWorkerFailure {
        /// The index
        index: IndexName,
        /// The failure
        reason: String,
    },
}

impl CqrsError {
    /// Creates a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a schema error
    pub fn invalid_schema(index: IndexName, detail: impl Into<String>) -> Self {
        Self::InvalidSchema {
            index,
            detail: detail.into(),
        }
    }
}
