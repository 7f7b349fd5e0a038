//! Configuration with type-safe validation.
//!
//! Bounded numeric knobs are `nutype` newtypes, so an out-of-range value can
//! never reach the engine. Every configuration struct has a `Default` with
//! production values and `with_*` setters for overrides.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of index rebuilds one coordinator runs at the same time.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    default = 4,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxParallelTasks(usize);

/// Number of events fetched and applied per replay batch.
///
/// A checkpoint is persisted after every batch.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 250,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct ReplayBatchSize(usize);

/// How long a rebuild lease stays valid without a heartbeat, in milliseconds.
///
/// Validated between 50ms and 24 hours.
#[nutype(
    validate(greater_or_equal = 50, less_or_equal = 86_400_000),
    default = 600_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LeaseTimeoutMs(u64);

impl LeaseTimeoutMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Interval between polls or scheduling passes, in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    default = 1_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct PollIntervalMs(u64);

impl PollIntervalMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Maximum number of attempts for a conflict-retried command.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Base delay between retry attempts in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    default = 50,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Maximum delay between retry attempts in milliseconds.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 300_000),
    default = 2_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Capacity of the dead-letter queue kept by the projections engine.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    default = 1_024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct DeadLetterCapacity(usize);

/// Applications of a dead-lettered event, counting the delivery that parked
/// it, before it is discarded.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxDeadLetterAttempts(u32);

/// What `update_document` does when the target document does not exist.
///
/// A "child" event (an item added to order X) can arrive before the
/// "parent" event that creates X has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDocumentPolicy {
    /// Park the event and re-apply it after later events from the same
    /// builder, until the document shows up or the attempts run out.
    #[default]
    DeadLetter,
    /// Log a warning and skip the update.
    Drop,
    /// Fail the event for this builder.
    Fail,
}

/// Settings for the rebuild coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Upper bound on concurrent index rebuilds per coordinator.
    pub max_parallel_tasks: MaxParallelTasks,
    /// Events per replay batch.
    pub batch_size: ReplayBatchSize,
    /// Heartbeat age after which another worker may reclaim a lease.
    pub lease_timeout: LeaseTimeoutMs,
    /// Pause between scheduling passes in `RebuildCoordinator::run`.
    pub scheduling_interval: PollIntervalMs,
}

impl RebuildConfig {
    /// Sets the parallelism bound.
    #[must_use]
    pub const fn with_max_parallel_tasks(mut self, max_parallel_tasks: MaxParallelTasks) -> Self {
        self.max_parallel_tasks = max_parallel_tasks;
        self
    }

    /// Sets the replay batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: ReplayBatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the lease timeout.
    #[must_use]
    pub const fn with_lease_timeout(mut self, lease_timeout: LeaseTimeoutMs) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Sets the pause between scheduling passes.
    #[must_use]
    pub const fn with_scheduling_interval(mut self, interval: PollIntervalMs) -> Self {
        self.scheduling_interval = interval;
        self
    }
}

/// Settings for the projections engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionEngineConfig {
    /// Policy for updates that target a missing document.
    pub missing_document_policy: MissingDocumentPolicy,
    /// Flag a builder's index for rebuild when live delivery to it fails.
    pub rearm_on_live_failure: bool,
    /// Bound on parked events.
    pub dead_letter_capacity: DeadLetterCapacity,
    /// Attempts before a parked event is discarded.
    pub max_dead_letter_attempts: MaxDeadLetterAttempts,
}

impl Default for ProjectionEngineConfig {
    fn default() -> Self {
        Self {
            missing_document_policy: MissingDocumentPolicy::default(),
            rearm_on_live_failure: true,
            dead_letter_capacity: DeadLetterCapacity::default(),
            max_dead_letter_attempts: MaxDeadLetterAttempts::default(),
        }
    }
}

impl ProjectionEngineConfig {
    /// Sets the missing-document policy.
    #[must_use]
    pub const fn with_missing_document_policy(mut self, policy: MissingDocumentPolicy) -> Self {
        self.missing_document_policy = policy;
        self
    }

    /// Enables or disables re-arming an index after a live failure.
    #[must_use]
    pub const fn with_rearm_on_live_failure(mut self, rearm: bool) -> Self {
        self.rearm_on_live_failure = rearm;
        self
    }

    /// Sets the dead-letter retry bound.
    #[must_use]
    pub const fn with_max_dead_letter_attempts(mut self, attempts: MaxDeadLetterAttempts) -> Self {
        self.max_dead_letter_attempts = attempts;
        self
    }

    /// Sets the dead-letter queue capacity.
    #[must_use]
    pub const fn with_dead_letter_capacity(mut self, capacity: DeadLetterCapacity) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }
}

/// Settings for the pull-mode observer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Pause after a poll that found no new events.
    pub poll_interval: PollIntervalMs,
    /// Events fetched per poll.
    pub batch_size: ReplayBatchSize,
}

impl PollingConfig {
    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: PollIntervalMs) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: ReplayBatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Exponential backoff for commands retried after a concurrency conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry.
    pub base_delay: RetryBaseDelayMs,
    /// Cap on the delay between attempts.
    pub max_delay: RetryMaxDelayMs,
}

impl ConflictRetryConfig {
    /// The un-jittered delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_duration();
        let factor = 2u32.saturating_pow(attempt);
        base.saturating_mul(factor).min(self.max_delay.as_duration())
    }

    /// Total attempts as a plain number.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.into()
    }
}
