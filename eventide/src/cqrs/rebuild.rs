//! Lease-based, checkpointed projection rebuilds.
//!
//! A pass is an explicit loop: acquire up to `max_parallel_tasks` leases one
//! at a time, rebuild the acquired indexes concurrently, wait for all of
//! them, and repeat until an acquisition round comes back empty. A failing
//! index is logged and skipped; it never aborts its siblings or the pass.
//!
//! A rebuild without a checkpoint empties the index before replaying, so
//! documents are regenerated by the current builder code rather than kept
//! by the per-stream version guard. A rebuild resumed from a checkpoint
//! keeps what the earlier worker wrote.

use super::index_state::{IndexLease, IndexStateStore, RebuildCheckpoint};
use super::{CqrsError, CqrsResult};
use crate::cancellation::Cancellation;
use crate::config::RebuildConfig;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::event::DomainEvent;
use crate::event_store::EventLog;
use crate::projection_engine::{IndexFilter, ProjectionsEngine};
use crate::types::{IndexName, WorkerId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// How one index rebuild ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRebuildOutcome {
    /// Every event was replayed and the index is ready.
    Completed {
        /// Events applied by this worker.
        events_processed: u64,
    },
    /// Cancelled between batches; the lease was released and the checkpoint
    /// kept.
    Abandoned {
        /// Events applied by this worker before cancellation.
        events_processed: u64,
    },
    /// The rebuild failed. The lease stays held until it expires.
    Failed {
        /// The failure.
        reason: String,
    },
}

/// Totals of one [`RebuildCoordinator::run_pass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildPassReport {
    /// Acquisition rounds that launched at least one rebuild.
    pub rounds: usize,
    /// Indexes rebuilt to completion.
    pub completed: Vec<IndexName>,
    /// Indexes whose rebuild was cancelled.
    pub abandoned: Vec<IndexName>,
    /// Indexes whose rebuild failed, with the reason.
    pub failed: Vec<(IndexName, String)>,
}

impl RebuildPassReport {
    /// Whether the pass found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.rounds == 0
    }
}

/// Rebuilds indexes flagged as requiring it.
///
/// Any number of coordinators, in one process or many, may share an
/// [`IndexStateStore`]; the store's atomic acquire-and-lock guarantees that
/// each index is rebuilt by one worker at a time.
pub struct RebuildCoordinator<E: DomainEvent> {
    engine: ProjectionsEngine<E>,
    worker_id: WorkerId,
    config: RebuildConfig,
}

impl<E: DomainEvent> Clone for RebuildCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            worker_id: self.worker_id.clone(),
            config: self.config,
        }
    }
}

impl<E: DomainEvent> RebuildCoordinator<E> {
    /// Creates a coordinator that rebuilds the engine's indexes as `worker_id`.
    pub fn new(engine: ProjectionsEngine<E>, worker_id: WorkerId, config: RebuildConfig) -> Self {
        Self {
            engine,
            worker_id,
            config,
        }
    }

    /// This coordinator's lease identity.
    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn index_state(&self) -> &Arc<dyn IndexStateStore> {
        self.engine.index_state()
    }

    fn event_log(&self) -> &Arc<dyn EventLog<Event = E>> {
        self.engine.event_log()
    }

    /// Rebuilds until no index needs it.
    ///
    /// Store errors during acquisition end the pass with an error; failures
    /// inside one index's rebuild are reported in the result. An index that
    /// failed earlier in the same pass is not attempted again by it.
    #[instrument(skip(self, cancellation), fields(worker = %self.worker_id))]
    pub async fn run_pass(&self, cancellation: &Cancellation) -> CqrsResult<RebuildPassReport> {
        let mut report = RebuildPassReport::default();
        let mut failed_this_pass = HashSet::new();

        while !cancellation.is_cancelled() {
            let leases = self.acquire_round(&failed_this_pass).await?;
            if leases.is_empty() {
                break;
            }
            report.rounds += 1;
            debug!(round = report.rounds, leases = leases.len(), "Launching rebuild workers");

            let mut workers = JoinSet::new();
            for lease in leases {
                let coordinator = self.clone();
                let cancellation = cancellation.clone();
                workers.spawn(async move {
                    let index = lease.index_name.clone();
                    let outcome = coordinator.rebuild_index(&lease, &cancellation).await;
                    (index, outcome)
                });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((index, IndexRebuildOutcome::Completed { .. })) => {
                        report.completed.push(index);
                    }
                    Ok((index, IndexRebuildOutcome::Abandoned { .. })) => {
                        report.abandoned.push(index);
                    }
                    Ok((index, IndexRebuildOutcome::Failed { reason })) => {
                        failed_this_pass.insert(index.clone());
                        report.failed.push((index, reason));
                    }
                    Err(join_error) => {
                        error!(error = %join_error, "Rebuild worker task panicked");
                    }
                }
            }
        }

        if !report.is_empty() {
            info!(
                rounds = report.rounds,
                completed = report.completed.len(),
                abandoned = report.abandoned.len(),
                failed = report.failed.len(),
                "Rebuild pass finished"
            );
        }
        Ok(report)
    }

    /// Runs a pass every `scheduling_interval` until `shutdown` fires.
    ///
    /// A pass that errors is logged and the loop carries on.
    pub async fn run(&self, shutdown: Cancellation) {
        info!(worker = %self.worker_id, "Rebuild coordinator started");
        while !shutdown.is_cancelled() {
            if let Err(error) = self.run_pass(&shutdown).await {
                error!(worker = %self.worker_id, error = %error, "Rebuild pass failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.scheduling_interval.as_duration()) => {}
            }
        }
        info!(worker = %self.worker_id, "Rebuild coordinator stopped");
    }

    /// Acquires leases one at a time, up to the parallelism bound.
    ///
    /// Leases on indexes that already failed in this pass are renewed and
    /// set aside, so the failure is recorded against a fresh heartbeat and
    /// the pass can finish.
    async fn acquire_round(&self, failed_this_pass: &HashSet<IndexName>) -> CqrsResult<Vec<IndexLease>> {
        let limit = usize::from(self.config.max_parallel_tasks);
        let lease_timeout = self.config.lease_timeout.as_duration();
        let mut leases = Vec::with_capacity(limit);

        while leases.len() < limit {
            let Some(lease) = self
                .index_state()
                .acquire_and_lock_projection_that_requires_rebuild(&self.worker_id, lease_timeout)
                .await?
            else {
                break;
            };
            if failed_this_pass.contains(&lease.index_name) {
                let reason = lease
                    .status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "rebuild failed earlier in this pass".to_string());
                self.index_state().record_failure(&lease, &reason).await?;
                continue;
            }
            leases.push(lease);
        }
        Ok(leases)
    }

    /// Rebuilds one leased index, converting any failure into
    /// [`IndexRebuildOutcome::Failed`].
    #[instrument(skip(self, lease, cancellation), fields(worker = %self.worker_id, index = %lease.index_name))]
    pub async fn rebuild_index(
        &self,
        lease: &IndexLease,
        cancellation: &Cancellation,
    ) -> IndexRebuildOutcome {
        match self.replay_into(lease, cancellation).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let failure = CqrsError::RebuildWorkerFailure {
                    index: lease.index_name.clone(),
                    reason: error.to_string(),
                };
                error!(error = %failure, "Rebuild worker failed; lease stays held until it expires");
                if let Err(record_error) = self
                    .index_state()
                    .record_failure(lease, &error.to_string())
                    .await
                {
                    warn!(error = %record_error, "Could not record rebuild failure");
                }
                IndexRebuildOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        }
    }

    async fn replay_into(
        &self,
        lease: &IndexLease,
        cancellation: &Cancellation,
    ) -> ProjectionResult<IndexRebuildOutcome> {
        if lease.status.last_processed_event_timestamp.is_none() {
            let removed = self
                .engine
                .document_store()
                .clear_index(&lease.index_name)
                .await?;
            info!(removed, "Cleared documents before replaying from the start");
        }

        let statistics = self.event_log().statistics().await?;
        let mut checkpoint = RebuildCheckpoint {
            total_events_to_process: statistics.total_events_count,
            events_processed: lease.status.events_processed,
            last_processed_event_timestamp: lease.status.last_processed_event_timestamp,
        };
        self.index_state().save_progress(lease, &checkpoint).await?;
        info!(
            total_events = checkpoint.total_events_to_process,
            resume_after = ?checkpoint.last_processed_event_timestamp,
            "Rebuild started"
        );

        let index_state = Arc::clone(self.index_state());
        let from = checkpoint.last_processed_event_timestamp;
        let replay = self
            .engine
            .replay_events(
                &self.worker_id,
                &IndexFilter::only(lease.index_name.clone()),
                from,
                usize::from(self.config.batch_size),
                |progress| {
                    checkpoint.events_processed += progress.events_in_batch as u64;
                    checkpoint.last_processed_event_timestamp = Some(progress.last_event.timestamp);
                    let snapshot = checkpoint;
                    let index_state = Arc::clone(&index_state);
                    let lease = lease.clone();
                    async move {
                        index_state
                            .save_progress(&lease, &snapshot)
                            .await
                            .map(|_| ())
                            .map_err(ProjectionError::from)
                    }
                },
                cancellation,
            )
            .await?;

        if replay.cancelled {
            self.index_state().release_lease(lease).await?;
            info!(events_processed = replay.events, "Rebuild abandoned on cancellation");
            return Ok(IndexRebuildOutcome::Abandoned {
                events_processed: replay.events,
            });
        }

        let status = self.index_state().complete_rebuild(lease).await?;
        info!(
            events_processed = replay.events,
            rearmed = status.requires_rebuild,
            "Rebuild completed"
        );
        Ok(IndexRebuildOutcome::Completed {
            events_processed: replay.events,
        })
    }
}
