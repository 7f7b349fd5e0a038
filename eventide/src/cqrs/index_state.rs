//! Rebuild progress and leases for projection indexes.
//!
//! Every maintained index has an [`IndexStatus`] inside the
//! [`ProjectionIndexState`] control record. The status doubles as the lease:
//! a rebuild worker owns an index while `locked_by` names it, and
//! [`IndexStateStore::acquire_and_lock_projection_that_requires_rebuild`] is
//! the only way to take that ownership.
//!
//! ```text
//! Idle --acquire--> LeaseAcquired --replay--> Rebuilding --+--> Completed
//!                                                          +--> Abandoned (cancelled)
//! ```

use super::{CqrsError, CqrsResult};
use crate::types::{IndexName, Timestamp, WorkerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rebuild bookkeeping for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    /// The index.
    pub index_name: IndexName,
    /// Whether the index must be rebuilt from the event log.
    pub requires_rebuild: bool,
    /// When the most recent rebuild was requested.
    pub rebuild_requested_at: Option<Timestamp>,
    /// Worker currently holding the lease.
    pub locked_by: Option<WorkerId>,
    /// When the current lease was acquired.
    pub locked_at: Option<Timestamp>,
    /// Events in the log when the rebuild started.
    pub total_events_to_process: u64,
    /// Events replayed so far.
    pub events_processed: u64,
    /// Timestamp of the last applied event: the resume checkpoint.
    pub last_processed_event_timestamp: Option<Timestamp>,
    /// Liveness heartbeat, written on every progress save.
    pub health_check_at: Option<Timestamp>,
    /// When the last rebuild completed; `None` while one is pending.
    pub completed_at: Option<Timestamp>,
    /// Error reported by the last failed rebuild attempt.
    pub last_error: Option<String>,
}

impl IndexStatus {
    /// Status of a newly registered index: it has never been built.
    pub const fn new(index_name: IndexName, now: Timestamp) -> Self {
        Self {
            index_name,
            requires_rebuild: true,
            rebuild_requested_at: Some(now),
            locked_by: None,
            locked_at: None,
            total_events_to_process: 0,
            events_processed: 0,
            last_processed_event_timestamp: None,
            health_check_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Whether a worker holds the lease.
    pub const fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Whether queries may read this index.
    pub const fn is_ready(&self) -> bool {
        !self.requires_rebuild && self.completed_at.is_some()
    }

    /// Whether the lease holder has not saved progress within `timeout`.
    pub fn is_heartbeat_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        if !self.is_locked() {
            return false;
        }
        self.health_check_at
            .or(self.locked_at)
            .map_or(true, |heartbeat| now.duration_since(heartbeat) > timeout)
    }

    /// Whether a worker may take the lease now.
    pub fn is_acquirable(&self, now: Timestamp, lease_timeout: Duration) -> bool {
        self.requires_rebuild && (!self.is_locked() || self.is_heartbeat_stale(now, lease_timeout))
    }

    /// Share of the snapshot already replayed, in percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn completion_percentage(&self) -> Option<f64> {
        if self.total_events_to_process == 0 {
            return None;
        }
        let done = self.events_processed.min(self.total_events_to_process);
        Some(done as f64 / self.total_events_to_process as f64 * 100.0)
    }

    /// Whether `lease` still owns this index.
    pub fn is_held_by(&self, lease: &IndexLease) -> bool {
        self.locked_by.as_ref() == Some(&lease.worker_id) && self.locked_at == Some(lease.acquired_at)
    }

    /// Takes the lease for `worker`.
    pub fn acquire(&mut self, worker: &WorkerId, now: Timestamp) -> IndexLease {
        let reclaimed_from = self.locked_by.take();
        self.locked_by = Some(worker.clone());
        self.locked_at = Some(now);
        self.health_check_at = Some(now);
        IndexLease {
            index_name: self.index_name.clone(),
            worker_id: worker.clone(),
            acquired_at: now,
            status: self.clone(),
            reclaimed_from,
        }
    }

    /// Stores a checkpoint and refreshes the heartbeat.
    pub fn record_progress(&mut self, checkpoint: &RebuildCheckpoint, now: Timestamp) {
        self.total_events_to_process = checkpoint.total_events_to_process;
        self.events_processed = checkpoint.events_processed;
        self.last_processed_event_timestamp = checkpoint.last_processed_event_timestamp;
        self.health_check_at = Some(now);
    }

    /// Finishes the rebuild held by `lease` and drops the lease.
    ///
    /// A rebuild requested after the lease was taken keeps the index
    /// flagged, with progress reset, so it is rebuilt again.
    pub fn complete(&mut self, lease: &IndexLease, now: Timestamp) {
        self.unlock();
        self.health_check_at = Some(now);
        self.last_error = None;
        if self
            .rebuild_requested_at
            .is_some_and(|requested| requested > lease.acquired_at)
        {
            self.reset_progress();
        } else {
            self.requires_rebuild = false;
            self.completed_at = Some(now);
        }
    }

    /// Drops the lease and keeps the checkpoint, so any worker can resume.
    pub fn release(&mut self, now: Timestamp) {
        self.unlock();
        self.health_check_at = Some(now);
    }

    /// Records a failed attempt; the lease stays held until it goes stale.
    pub fn record_failure(&mut self, reason: impl Into<String>, now: Timestamp) {
        self.last_error = Some(reason.into());
        self.health_check_at = Some(now);
    }

    /// Flags the index for rebuild.
    ///
    /// An idle index starts over from the beginning of the log. A locked
    /// index finishes its current rebuild first and is then rebuilt again.
    pub fn request_rebuild(&mut self, now: Timestamp) {
        self.requires_rebuild = true;
        self.rebuild_requested_at = Some(now);
        if !self.is_locked() {
            self.reset_progress();
        }
    }

    fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    fn reset_progress(&mut self) {
        self.total_events_to_process = 0;
        self.events_processed = 0;
        self.last_processed_event_timestamp = None;
        self.completed_at = None;
        self.last_error = None;
    }
}

/// The control record: one status per maintained index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionIndexState {
    /// Identifies the store (connection or partition) the statuses belong to.
    pub connection_id: String,
    /// Statuses ordered by index name.
    pub statuses: Vec<IndexStatus>,
}

impl ProjectionIndexState {
    /// An empty control record.
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            statuses: Vec::new(),
        }
    }

    /// Looks up a status.
    pub fn status(&self, index: &IndexName) -> Option<&IndexStatus> {
        self.statuses.iter().find(|status| status.index_name == *index)
    }

    /// Looks up a status for modification.
    pub fn status_mut(&mut self, index: &IndexName) -> Option<&mut IndexStatus> {
        self.statuses
            .iter_mut()
            .find(|status| status.index_name == *index)
    }

    /// Adds a status for `index` unless one exists, returning it.
    pub fn register(&mut self, index: &IndexName, now: Timestamp) -> &IndexStatus {
        let position = match self
            .statuses
            .iter()
            .position(|status| status.index_name == *index)
        {
            Some(position) => position,
            None => {
                self.statuses.push(IndexStatus::new(index.clone(), now));
                self.statuses
                    .sort_by(|a, b| a.index_name.cmp(&b.index_name));
                self.statuses
                    .iter()
                    .position(|status| status.index_name == *index)
                    .unwrap_or_default()
            }
        };
        &self.statuses[position]
    }

    /// Locks the first acquirable index (by name) for `worker`.
    pub fn acquire_next(
        &mut self,
        worker: &WorkerId,
        now: Timestamp,
        lease_timeout: Duration,
    ) -> Option<IndexLease> {
        self.statuses
            .iter_mut()
            .find(|status| status.is_acquirable(now, lease_timeout))
            .map(|status| status.acquire(worker, now))
    }

    /// Applies `change` to the status owned by `lease`.
    pub fn with_held_status<F>(&mut self, lease: &IndexLease, change: F) -> CqrsResult<IndexStatus>
    where
        F: FnOnce(&mut IndexStatus),
    {
        let status = self
            .status_mut(&lease.index_name)
            .ok_or_else(|| CqrsError::UnknownIndex(lease.index_name.clone()))?;
        if !status.is_held_by(lease) {
            return Err(CqrsError::LeaseLost {
                index: lease.index_name.clone(),
                worker: lease.worker_id.clone(),
            });
        }
        change(status);
        Ok(status.clone())
    }
}

/// Ownership of one index's rebuild, as returned by an acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLease {
    /// The leased index.
    pub index_name: IndexName,
    /// The holder.
    pub worker_id: WorkerId,
    /// When the lease was taken; fences writes from earlier holders.
    pub acquired_at: Timestamp,
    /// The status right after acquisition, including the resume checkpoint.
    pub status: IndexStatus,
    /// Previous holder whose stale lease was taken over.
    pub reclaimed_from: Option<WorkerId>,
}

/// Progress persisted after every replay batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildCheckpoint {
    /// Snapshot of the log size at rebuild start.
    pub total_events_to_process: u64,
    /// Events replayed so far.
    pub events_processed: u64,
    /// Timestamp of the last applied event.
    pub last_processed_event_timestamp: Option<Timestamp>,
}

/// Persistence of the [`ProjectionIndexState`] control record.
///
/// Implementations must make acquisition atomic with respect to other
/// acquirers, in this process or any other sharing the store, and must
/// reject progress, completion, release and failure writes from a caller
/// that no longer holds the lease with `CqrsError::LeaseLost`.
#[async_trait]
pub trait IndexStateStore: Send + Sync {
    /// Registers an index, flagging it for rebuild if it is new.
    /// Registering a known index returns its current status unchanged.
    async fn register_index(&self, index: &IndexName) -> CqrsResult<IndexStatus>;

    /// Status of one index.
    async fn index_status(&self, index: &IndexName) -> CqrsResult<Option<IndexStatus>>;

    /// The whole control record.
    async fn index_state(&self) -> CqrsResult<ProjectionIndexState>;

    /// Atomically selects one index that requires rebuild and is not locked
    /// (or whose lease is older than `lease_timeout`), locks it for `worker`,
    /// and returns the lease. `None` when nothing needs rebuilding.
    async fn acquire_and_lock_projection_that_requires_rebuild(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> CqrsResult<Option<IndexLease>>;

    /// Persists a checkpoint and refreshes the heartbeat.
    async fn save_progress(
        &self,
        lease: &IndexLease,
        checkpoint: &RebuildCheckpoint,
    ) -> CqrsResult<IndexStatus>;

    /// Marks the rebuild complete and drops the lease.
    async fn complete_rebuild(&self, lease: &IndexLease) -> CqrsResult<IndexStatus>;

    /// Drops the lease, keeping the checkpoint.
    async fn release_lease(&self, lease: &IndexLease) -> CqrsResult<IndexStatus>;

    /// Records a failed attempt without dropping the lease.
    async fn record_failure(&self, lease: &IndexLease, reason: &str) -> CqrsResult<IndexStatus>;

    /// Flags an index for rebuild.
    async fn request_rebuild(&self, index: &IndexName) -> CqrsResult<IndexStatus>;
}
