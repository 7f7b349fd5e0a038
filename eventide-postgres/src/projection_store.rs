//! Projection documents and index state in `PostgreSQL`.
//!
//! Documents are stored whole as JSONB in `eventide_documents`; filters are
//! evaluated after fetching by index and partition. A `revision` column
//! mirrors each document's revision so writes can be made conditional. Each index's status is
//! one row of `eventide_index_state`, and every state transition runs in a
//! transaction holding that row's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventide::cqrs::{
    CqrsError, CqrsResult, DocumentStore, Filter, IndexDefinition, IndexLease, IndexStateStore,
    IndexStatus, ProjectionIndexState, RebuildCheckpoint, StoredDocument,
};
use eventide::types::{IndexName, PartitionKey, Timestamp, WorkerId};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument, warn};

use crate::PgTransaction;

/// Document store and index state store sharing one pool.
///
/// Index definitions are cached after the first read, so the existence
/// check that precedes every document operation costs no round trip.
#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    connection_id: String,
    definitions: Arc<RwLock<HashMap<IndexName, IndexDefinition>>>,
}

impl PostgresProjectionStore {
    /// Uses an existing pool. Run [`crate::migrate`] once before use.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            connection_id: "postgres".to_string(),
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sets the id reported in [`ProjectionIndexState::connection_id`].
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    async fn load_definition(&self, index: &IndexName) -> CqrsResult<Option<IndexDefinition>> {
        let cached = self.definitions.read().get(index).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let definition: Option<Value> = sqlx::query_scalar(
            "SELECT definition FROM eventide_index_definitions WHERE index_name = $1",
        )
        .bind(index.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "index_definition"))?;
        let Some(definition) = definition else {
            return Ok(None);
        };
        let definition: IndexDefinition = serde_json::from_value(definition)
            .map_err(|e| CqrsError::serialization(e.to_string()))?;
        self.definitions
            .write()
            .insert(index.clone(), definition.clone());
        Ok(Some(definition))
    }

    async fn require_index(&self, index: &IndexName) -> CqrsResult<()> {
        match self.load_definition(index).await? {
            Some(_) => Ok(()),
            None => Err(CqrsError::invalid_schema(
                index.clone(),
                "index has not been ensured; call ensure_index before use",
            )),
        }
    }

    async fn begin(&self) -> CqrsResult<PgTransaction> {
        self.pool
            .begin()
            .await
            .map_err(|error| storage_error(&error, "begin"))
    }

    /// Applies `change` to the status of the index `lease` holds, after
    /// checking under the row lock that the lease is still current.
    async fn update_held<F>(
        &self,
        lease: &IndexLease,
        operation: &'static str,
        change: F,
    ) -> CqrsResult<IndexStatus>
    where
        F: FnOnce(&mut IndexStatus) + Send,
    {
        let mut tx = self.begin().await?;
        let mut status = lock_status(&mut tx, &lease.index_name, operation)
            .await?
            .ok_or_else(|| CqrsError::UnknownIndex(lease.index_name.clone()))?;
        if !status.is_held_by(lease) {
            return Err(CqrsError::LeaseLost {
                index: lease.index_name.clone(),
                worker: lease.worker_id.clone(),
            });
        }
        change(&mut status);
        write_status(&mut tx, &status, operation).await?;
        tx.commit()
            .await
            .map_err(|error| storage_error(&error, operation))?;
        Ok(status)
    }
}

fn storage_error(error: &sqlx::Error, operation: &'static str) -> CqrsError {
    error!(error = %error, operation, "[postgres.database_error] projection store operation failed");
    CqrsError::storage(format!("{operation}: {error}"))
}

fn decode_status(value: Value) -> CqrsResult<IndexStatus> {
    serde_json::from_value(value).map_err(|e| CqrsError::serialization(e.to_string()))
}

fn decode_document(value: Value) -> CqrsResult<StoredDocument> {
    serde_json::from_value(value).map_err(|e| CqrsError::serialization(e.to_string()))
}

async fn lock_status(
    tx: &mut PgTransaction,
    index: &IndexName,
    operation: &'static str,
) -> CqrsResult<Option<IndexStatus>> {
    let status: Option<Value> = sqlx::query_scalar(
        "SELECT status FROM eventide_index_state WHERE index_name = $1 FOR UPDATE",
    )
    .bind(index.as_ref())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|error| storage_error(&error, operation))?;
    status.map(decode_status).transpose()
}

async fn write_status(
    tx: &mut PgTransaction,
    status: &IndexStatus,
    operation: &'static str,
) -> CqrsResult<()> {
    let json = serde_json::to_value(status).map_err(|e| CqrsError::serialization(e.to_string()))?;
    sqlx::query(
        "UPDATE eventide_index_state SET requires_rebuild = $2, status = $3 WHERE index_name = $1",
    )
    .bind(status.index_name.as_ref())
    .bind(status.requires_rebuild)
    .bind(Json(json))
    .execute(&mut **tx)
    .await
    .map_err(|error| storage_error(&error, operation))?;
    Ok(())
}

#[async_trait]
impl DocumentStore for PostgresProjectionStore {
    #[instrument(name = "postgres.ensure_index", skip(self, definition), fields(index = %definition.name))]
    async fn ensure_index(&self, definition: &IndexDefinition) -> CqrsResult<()> {
        let json =
            serde_json::to_value(definition).map_err(|e| CqrsError::serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO eventide_index_definitions (index_name, definition) VALUES ($1, $2) \
             ON CONFLICT (index_name) DO UPDATE SET definition = EXCLUDED.definition",
        )
        .bind(definition.name.as_ref())
        .bind(Json(json))
        .execute(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "ensure_index"))?;
        self.definitions
            .write()
            .insert(definition.name.clone(), definition.clone());
        debug!(fields = definition.fields.len(), "Ensured index");
        Ok(())
    }

    async fn index_definition(&self, index: &IndexName) -> CqrsResult<Option<IndexDefinition>> {
        self.load_definition(index).await
    }

    async fn get(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<Option<StoredDocument>> {
        self.require_index(index).await?;
        let document: Option<Value> = sqlx::query_scalar(
            "SELECT document FROM eventide_documents \
             WHERE index_name = $1 AND partition_key = $2 AND id = $3",
        )
        .bind(index.as_ref())
        .bind(partition_key.as_ref())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "get"))?;
        document.map(decode_document).transpose()
    }

    async fn upsert(&self, index: &IndexName, mut document: StoredDocument) -> CqrsResult<u64> {
        self.require_index(index).await?;
        let expected = i64::try_from(document.revision)
            .map_err(|_| CqrsError::storage("upsert: document revision out of range"))?;
        document.revision += 1;
        let json =
            serde_json::to_value(&document).map_err(|e| CqrsError::serialization(e.to_string()))?;
        let statement = if expected == 0 {
            sqlx::query(
                "INSERT INTO eventide_documents (index_name, partition_key, id, document, revision) \
                 VALUES ($1, $2, $3, $4, $5 + 1) \
                 ON CONFLICT (index_name, partition_key, id) DO NOTHING",
            )
        } else {
            sqlx::query(
                "UPDATE eventide_documents SET document = $4, revision = $5 + 1 \
                 WHERE index_name = $1 AND partition_key = $2 AND id = $3 AND revision = $5",
            )
        };
        let result = statement
            .bind(index.as_ref())
            .bind(document.partition_key.as_ref())
            .bind(&document.id)
            .bind(Json(json))
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(|error| storage_error(&error, "upsert"))?;
        if result.rows_affected() == 0 {
            debug!(index = %index, document_id = %document.id, expected, "Rejected stale document write");
            return Err(CqrsError::WriteConflict {
                index: index.clone(),
                id: document.id,
            });
        }
        Ok(document.revision)
    }

    async fn delete(
        &self,
        index: &IndexName,
        id: &str,
        partition_key: &PartitionKey,
    ) -> CqrsResult<bool> {
        self.require_index(index).await?;
        let result = sqlx::query(
            "DELETE FROM eventide_documents WHERE index_name = $1 AND partition_key = $2 AND id = $3",
        )
        .bind(index.as_ref())
        .bind(partition_key.as_ref())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "delete"))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "postgres.query", skip(self, filters), fields(index = %index, filters = filters.len()))]
    async fn query(
        &self,
        index: &IndexName,
        partition_key: Option<&PartitionKey>,
        filters: &[Filter],
    ) -> CqrsResult<Vec<StoredDocument>> {
        self.require_index(index).await?;
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT document FROM eventide_documents \
             WHERE index_name = $1 AND ($2::text IS NULL OR partition_key = $2) \
             ORDER BY partition_key, id",
        )
        .bind(index.as_ref())
        .bind(partition_key.map(AsRef::<str>::as_ref))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "query"))?;

        let mut matching = Vec::new();
        for row in rows {
            let document = decode_document(row)?;
            if filters.iter().all(|filter| filter.matches(&document.body)) {
                matching.push(document);
            }
        }
        Ok(matching)
    }

    #[instrument(name = "postgres.clear_index", skip(self), fields(index = %index))]
    async fn clear_index(&self, index: &IndexName) -> CqrsResult<usize> {
        self.require_index(index).await?;
        let result = sqlx::query("DELETE FROM eventide_documents WHERE index_name = $1")
            .bind(index.as_ref())
            .execute(&self.pool)
            .await
            .map_err(|error| storage_error(&error, "clear_index"))?;
        let removed = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        info!(removed, "Cleared index documents");
        Ok(removed)
    }

    async fn count(&self, index: &IndexName) -> CqrsResult<usize> {
        self.require_index(index).await?;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM eventide_documents WHERE index_name = $1")
                .bind(index.as_ref())
                .fetch_one(&self.pool)
                .await
                .map_err(|error| storage_error(&error, "count"))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl IndexStateStore for PostgresProjectionStore {
    #[instrument(name = "postgres.register_index", skip(self), fields(index = %index))]
    async fn register_index(&self, index: &IndexName) -> CqrsResult<IndexStatus> {
        let fresh = IndexStatus::new(index.clone(), Timestamp::now().truncated_to_micros());
        let json =
            serde_json::to_value(&fresh).map_err(|e| CqrsError::serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO eventide_index_state (index_name, requires_rebuild, status) \
             VALUES ($1, $2, $3) ON CONFLICT (index_name) DO NOTHING",
        )
        .bind(index.as_ref())
        .bind(fresh.requires_rebuild)
        .bind(Json(json))
        .execute(&self.pool)
        .await
        .map_err(|error| storage_error(&error, "register_index"))?;
        self.index_status(index)
            .await?
            .ok_or_else(|| CqrsError::UnknownIndex(index.clone()))
    }

    async fn index_status(&self, index: &IndexName) -> CqrsResult<Option<IndexStatus>> {
        let status: Option<Value> =
            sqlx::query_scalar("SELECT status FROM eventide_index_state WHERE index_name = $1")
                .bind(index.as_ref())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| storage_error(&error, "index_status"))?;
        status.map(decode_status).transpose()
    }

    async fn index_state(&self) -> CqrsResult<ProjectionIndexState> {
        let rows = sqlx::query("SELECT status FROM eventide_index_state ORDER BY index_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| storage_error(&error, "index_state"))?;
        let mut state = ProjectionIndexState::new(self.connection_id.clone());
        for row in rows {
            let status: Value = row
                .try_get("status")
                .map_err(|error| storage_error(&error, "index_state"))?;
            state.statuses.push(decode_status(status)?);
        }
        Ok(state)
    }

    #[instrument(name = "postgres.acquire", skip(self), fields(worker = %worker))]
    async fn acquire_and_lock_projection_that_requires_rebuild(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> CqrsResult<Option<IndexLease>> {
        let mut tx = self.begin().await?;
        // Rows another acquirer is deciding on are skipped rather than
        // waited for; they are picked up by a later round.
        let candidates: Vec<Value> = sqlx::query_scalar(
            "SELECT status FROM eventide_index_state WHERE requires_rebuild \
             ORDER BY index_name FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|error| storage_error(&error, "acquire"))?;

        let now = Timestamp::now().truncated_to_micros();
        let mut lease = None;
        for candidate in candidates {
            let mut status = decode_status(candidate)?;
            if status.is_acquirable(now, lease_timeout) {
                let acquired = status.acquire(worker, now);
                write_status(&mut tx, &status, "acquire").await?;
                lease = Some(acquired);
                break;
            }
        }
        tx.commit()
            .await
            .map_err(|error| storage_error(&error, "acquire"))?;

        if let Some(lease) = &lease {
            if let Some(previous) = &lease.reclaimed_from {
                warn!(index = %lease.index_name, %previous, "Reclaimed stale rebuild lease");
            } else {
                info!(index = %lease.index_name, "Acquired rebuild lease");
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
        self.update_held(lease, "save_progress", |status| {
            status.record_progress(checkpoint, now);
        })
        .await
    }

    async fn complete_rebuild(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_held(lease, "complete_rebuild", |status| status.complete(lease, now))
            .await
    }

    async fn release_lease(&self, lease: &IndexLease) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_held(lease, "release_lease", |status| status.release(now))
            .await
    }

    async fn record_failure(&self, lease: &IndexLease, reason: &str) -> CqrsResult<IndexStatus> {
        let now = Timestamp::now().truncated_to_micros();
        self.update_held(lease, "record_failure", |status| {
            status.record_failure(reason, now);
        })
        .await
    }

    #[instrument(name = "postgres.request_rebuild", skip(self), fields(index = %index))]
    async fn request_rebuild(&self, index: &IndexName) -> CqrsResult<IndexStatus> {
        let mut tx = self.begin().await?;
        let mut status = lock_status(&mut tx, index, "request_rebuild")
            .await?
            .ok_or_else(|| CqrsError::UnknownIndex(index.clone()))?;
        status.request_rebuild(Timestamp::now().truncated_to_micros());
        write_status(&mut tx, &status, "request_rebuild").await?;
        tx.commit()
            .await
            .map_err(|error| storage_error(&error, "request_rebuild"))?;
        info!(locked = status.is_locked(), "Rebuild requested");
        Ok(status)
    }
}
