//! In-memory projection store for tests and single-process deployments.

use super::document_store::DocumentStore;
use super::index_state::{
    IndexLease, IndexStateStore, IndexStatus, ProjectionIndexState, RebuildCheckpoint,
};
use super::query::Filter;
use super::schema::{IndexDefinition, StoredDocument};
use super::{CqrsError, CqrsResult};
use crate::types::{IndexName, PartitionKey, Timestamp, WorkerId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

type DocumentKey = (PartitionKey, String);

#[derive(Debug)]
struct StoredIndex {
    definition: IndexDefinition,
    documents: BTreeMap<DocumentKey, StoredDocument>,
}

/// Documents and the index control record behind one lock.
///
/// Clones share the same storage, so several engines and coordinators in
/// one process can race against a single store the way separate processes
/// would against a database.
#[derive(Debug, Clone)]
pub struct InMemoryProjectionStore {
    indexes: Arc<RwLock<HashMap<IndexName, StoredIndex>>>,
    control: Arc<RwLock<ProjectionIndexState>>,
}

impl InMemoryProjectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_connection_id("in-memory")
    }

    /// Creates an empty store whose control record carries `connection_id`.
    pub fn with_connection_id(connection_id: impl Into<String>) -> Self {
        Self {
            indexes: Arc::new(RwLock::new(HashMap::new())),
            control: Arc::new(RwLock::new(ProjectionIndexState::new(connection_id))),
        }
    }

    fn not_ensured(index: &IndexName) -> CqrsError {
        CqrsError::invalid_schema(
            index.clone(),
            "index has not been ensured; call ensure_index before use",
        )
    }

    fn update_control<F>(&self, lease: &IndexLease, change: F) -> CqrsResult<IndexStatus>
    where
        F: FnOnce(&mut IndexStatus),
    {
        self.control
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?
            .with_held_status(lease, change)
    }
}

impl Default for InMemoryProjectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryProjectionStore {
    async fn ensure_index(&self, definition: &IndexDefinition) -> CqrsResult<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        indexes
            .entry(definition.name.clone())
            .and_modify(|index| index.definition = definition.clone())
            .or_insert_with(|| StoredIndex {
                definition: definition.clone(),
                documents: BTreeMap::new(),
            });
        debug!(index = %definition.name, fields = definition.fields.len(), "Ensured index");
        Ok(())
    }

    async fn index_definition(&self, index: &IndexName) -> CqrsResult<Option<IndexDefinition>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        Ok(indexes.get(index).map(|stored| stored.definition.clone()))
    }

    async fn get(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<Option<StoredDocument>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes.get(index).ok_or_else(|| Self::not_ensured(index))?;
        Ok(stored
            .documents
            .get(&(partition_key.clone(), id.to_string()))
            .cloned())
    }

    async fn upsert(&self, index: &IndexName, mut document: StoredDocument) -> CqrsResult<u64> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Self::not_ensured(index))?;
        let key = (document.partition_key.clone(), document.id.clone());
        let current = stored.documents.get(&key).map_or(0, |existing| existing.revision);
        if current != document.revision {
            debug!(
                index = %index,
                document_id = %document.id,
                expected = document.revision,
                current,
                "Rejected stale document write"
            );
            return Err(CqrsError::WriteConflict {
                index: index.clone(),
                id: document.id,
            });
        }
        document.revision = current + 1;
        let revision = document.revision;
        stored.documents.insert(key, document);
        Ok(revision)
    }

    async fn delete(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<bool> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Self::not_ensured(index))?;
        Ok(stored
            .documents
            .remove(&(partition_key.clone(), id.to_string()))
            .is_some())
    }

    async fn query(
        &self,
        index: &IndexName,
        partition_key: Option<&PartitionKey>,
        filters: &[Filter],
    ) -> CqrsResult<Vec<StoredDocument>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes.get(index).ok_or_else(|| Self::not_ensured(index))?;
        Ok(stored
            .documents
            .values()
            .filter(|document| partition_key.map_or(true, |key| document.partition_key == *key))
            .filter(|document| filters.iter().all(|filter| filter.matches(&document.body)))
            .cloned()
            .collect())
    }

    async fn clear_index(&self, index: &IndexName) -> CqrsResult<usize> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Self::not_ensured(index))?;
        let removed = stored.documents.len();
        stored.documents.clear();
        Ok(removed)
    }

    async fn count(&self, index: &IndexName) -> CqrsResult<usize> {
        let indexes = self
            .indexes
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let stored = indexes.get(index).ok_or_else(|| Self::not_ensured(index))?;
        Ok(stored.documents.len())
    }
}

#[async_trait]
impl IndexStateStore for InMemoryProjectionStore {
    async fn register_index(&self, index: &IndexName) -> CqrsResult<IndexStatus> {
        let mut control = self
            .control
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        Ok(control
            .register(index, Timestamp::now().truncated_to_micros())
            .clone())
    }

    async fn index_status(&self, index: &IndexName) -> CqrsResult<Option<IndexStatus>> {
        let control = self
            .control
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        Ok(control.status(index).cloned())
    }

    async fn index_state(&self) -> CqrsResult<ProjectionIndexState> {
        let control = self
            .control
            .read()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        Ok(control.clone())
    }

    async fn acquire_and_lock_projection_that_requires_rebuild(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> CqrsResult<Option<IndexLease>> {
        let mut control = self
            .control
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let lease = control.acquire_next(worker, Timestamp::now().truncated_to_micros(), lease_timeout);
        if let Some(lease) = &lease {
            if let Some(previous) = &lease.reclaimed_from {
                warn!(index = %lease.index_name, %worker, %previous, "Reclaimed stale rebuild lease");
            } else {
                info!(index = %lease.index_name, %worker, "Acquired rebuild lease");
            }
        }
        Ok(lease)
    }

    async fn save_progress(
        &self,
        lease: &IndexLease,
        checkpoint: &RebuildCheckpoint,
    ) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_control(lease, |status| status.record_progress(checkpoint, now))
    }

    async fn complete_rebuild(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_control(lease, |status| status.complete(lease, now))
    }

    async fn release_lease(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_control(lease, |status| status.release(now))
    }

    async fn record_failure(&self, lease: &IndexLease, reason: &str) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_control(lease, |status| status.record_failure(reason, now))
    }

    async fn request_rebuild(&self, index: &IndexName) -> CqrsResult<IndexStatus> {
        let mut control = self
            .control
            .write()
            .map_err(|e| CqrsError::storage(format!("Lock poisoned: {e}")))?;
        let status = control
            .status_mut(index)
            .ok_or_else(|| CqrsError::UnknownIndex(index.clone()))?;
        status.request_rebuild(Timestamp::now().truncated_to_micros());
        info!(%index, locked = status.is_locked(), "Rebuild requested");
        Ok(status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cqrs::schema::{FieldKind, FieldSpec};
    use serde_json::json;

    fn definition() -> IndexDefinition {
        IndexDefinition {
            name: IndexName::of("orders"),
            fields: vec![FieldSpec::new("status", FieldKind::String).filterable()],
        }
    }

    fn document(id: &str, partition: &str, status: &str) -> StoredDocument {
        StoredDocument {
            id: id.to_string(),
            partition_key: PartitionKey::try_new(partition).unwrap(),
            updated_at: Timestamp::now(),
            applied_versions: BTreeMap::new(),
            revision: 0,
            body: json!({ "status": status }),
        }
    }

    #[tokio::test]
    async fn operations_on_unknown_index_report_invalid_schema() {
        let store = InMemoryProjectionStore::new();
        let result = store.upsert(&IndexName::of("orders"), document("1", "p", "open")).await;
        assert!(matches!(result, Err(CqrsError::InvalidSchema { .. })));
    }

    #[tokio::test]
    async fn documents_are_keyed_by_partition_and_id() {
        let store = InMemoryProjectionStore::new();
        let index = IndexName::of("orders");
        store.ensure_index(&definition()).await.unwrap();
        store.upsert(&index, document("1", "p", "open")).await.unwrap();
        store.upsert(&index, document("1", "q", "closed")).await.unwrap();
        let p = PartitionKey::try_new("p").unwrap();
        let current = store.get(&index, "1", &p).await.unwrap().unwrap();
        let shipped = StoredDocument {
            body: json!({ "status": "shipped" }),
            ..current
        };
        assert_eq!(store.upsert(&index, shipped).await.unwrap(), 2);

        assert_eq!(store.count(&index).await.unwrap(), 2);
        let fetched = store.get(&index, "1", &p).await.unwrap().unwrap();
        assert_eq!(fetched.body["status"], "shipped");
        assert_eq!(fetched.revision, 2);

        assert!(store.delete(&index, "1", &p).await.unwrap());
        assert!(!store.delete(&index, "1", &p).await.unwrap());
        assert_eq!(store.count(&index).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_applies_partition_and_filters() {
        let store = InMemoryProjectionStore::new();
        let index = IndexName::of("orders");
        store.ensure_index(&definition()).await.unwrap();
        store.upsert(&index, document("1", "p", "open")).await.unwrap();
        store.upsert(&index, document("2", "p", "closed")).await.unwrap();
        store.upsert(&index, document("3", "q", "open")).await.unwrap();

        let open = store
            .query(&index, None, &[Filter::eq("status", "open")])
            .await
            .unwrap();
        assert_eq!(open.len(), 2);

        let p = PartitionKey::try_new("p").unwrap();
        let open_in_p = store
            .query(&index, Some(&p), &[Filter::eq("status", "open")])
            .await
            .unwrap();
        assert_eq!(open_in_p.len(), 1);
        assert_eq!(open_in_p[0].id, "1");
    }

    #[tokio::test]
    async fn a_write_based_on_a_stale_revision_is_rejected() {
        let store = InMemoryProjectionStore::new();
        let index = IndexName::of("orders");
        let p = PartitionKey::try_new("p").unwrap();
        store.ensure_index(&definition()).await.unwrap();
        store.upsert(&index, document("1", "p", "open")).await.unwrap();

        let first_read = store.get(&index, "1", &p).await.unwrap().unwrap();
        let second_read = first_read.clone();
        store
            .upsert(&index, StoredDocument { body: json!({ "status": "shipped" }), ..first_read })
            .await
            .unwrap();
        let stale = store
            .upsert(&index, StoredDocument { body: json!({ "status": "cancelled" }), ..second_read })
            .await;
        assert!(matches!(stale, Err(CqrsError::WriteConflict { ref id, .. }) if id == "1"));

        let duplicate_insert = store.upsert(&index, document("1", "p", "open")).await;
        assert!(matches!(duplicate_insert, Err(CqrsError::WriteConflict { .. })));

        let fetched = store.get(&index, "1", &p).await.unwrap().unwrap();
        assert_eq!(fetched.body["status"], "shipped");
    }

    #[tokio::test]
    async fn clearing_an_index_keeps_its_definition_and_other_indexes() {
        let store = InMemoryProjectionStore::new();
        let orders = IndexName::of("orders");
        let archive = IndexDefinition {
            name: IndexName::of("archive"),
            ..definition()
        };
        store.ensure_index(&definition()).await.unwrap();
        store.ensure_index(&archive).await.unwrap();
        store.upsert(&orders, document("1", "p", "open")).await.unwrap();
        store.upsert(&orders, document("2", "q", "open")).await.unwrap();
        store.upsert(&archive.name, document("1", "p", "open")).await.unwrap();

        assert_eq!(store.clear_index(&orders).await.unwrap(), 2);
        assert_eq!(store.count(&orders).await.unwrap(), 0);
        assert_eq!(store.count(&archive.name).await.unwrap(), 1);
        assert!(store.index_definition(&orders).await.unwrap().is_some());
        store.upsert(&orders, document("1", "p", "open")).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_index_keeps_existing_documents() {
        let store = InMemoryProjectionStore::new();
        let index = IndexName::of("orders");
        store.ensure_index(&definition()).await.unwrap();
        store.upsert(&index, document("1", "p", "open")).await.unwrap();
        store.ensure_index(&definition()).await.unwrap();
        assert_eq!(store.count(&index).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let store = InMemoryProjectionStore::new();
        let index = IndexName::of("orders");
        let first = store.register_index(&index).await.unwrap();
        let lease = store
            .acquire_and_lock_projection_that_requires_rebuild(
                &WorkerId::try_new("w").unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap()
            .unwrap();
        let again = store.register_index(&index).await.unwrap();
        assert!(first.requires_rebuild);
        assert_eq!(again.locked_by, Some(lease.worker_id));
    }

    #[tokio::test]
    async fn only_one_of_many_racing_workers_acquires() {
        let store = InMemoryProjectionStore::new();
        store.register_index(&IndexName::of("orders")).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire_and_lock_projection_that_requires_rebuild(
                        &WorkerId::try_new(format!("worker-{n}")).unwrap(),
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn request_rebuild_of_unknown_index_fails() {
        let store = InMemoryProjectionStore::new();
        let result = store.request_rebuild(&IndexName::of("nope")).await;
        assert!(matches!(result, Err(CqrsError::UnknownIndex(_))));
    }
}
