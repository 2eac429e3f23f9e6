//! Job metadata, enqueue options, and retry policies.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job id from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique job id using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delay policy applied between retries of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed(Duration),
    /// Doubling delay starting at `base`, capped at `cap`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on the delay.
        cap: Duration,
    },
}

impl BackoffPolicy {
    /// Delay before the next delivery, given how many attempts have run.
    ///
    /// `attempts` is 1-based: the value after the first failed delivery is 1.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, cap } => {
                let exp = attempts.saturating_sub(1).min(16);
                let delay = base.saturating_mul(2u32.saturating_pow(exp));
                delay.min(*cap)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

/// Options controlling how a job is enqueued.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher priorities are delivered first.
    pub priority: u8,
    /// Stable key ensuring at most one in-flight job per logical operation.
    pub dedup_key: Option<String>,
    /// Delivery attempts before the job is marked failed-terminal.
    ///
    /// Zero is treated as one.
    pub max_attempts: u32,
    /// Retry delay policy.
    pub backoff: BackoffPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            dedup_key: None,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EnqueueOptions {
    /// Options with the given attempt cap and defaults elsewhere.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dedup key.
    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// A job as seen by a consumer.
#[derive(Debug, Clone)]
pub struct Job<P> {
    /// Unique job id.
    pub id: JobId,
    /// The typed payload.
    pub payload: P,
    /// Priority it was enqueued with.
    pub priority: u8,
    /// Delivery attempts so far, including the current one.
    pub attempts: u32,
    /// Attempt cap.
    pub max_attempts: u32,
    /// Dedup key, if one was supplied.
    pub dedup_key: Option<String>,
    /// When the job was first enqueued.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a job, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready for delivery.
    Waiting,
    /// Leased by a consumer.
    Active,
    /// Failed and waiting out its retry backoff.
    RetryWaiting,
    /// Finished successfully.
    Completed,
    /// Failed terminally.
    Failed,
}

impl JobState {
    /// Whether the job can still run.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active | Self::RetryWaiting)
    }

    /// Whether the job has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs ready for delivery.
    pub waiting: usize,
    /// Jobs currently leased.
    pub active: usize,
    /// Jobs waiting out a retry backoff.
    pub retry_waiting: usize,
    /// Retained completed jobs.
    pub completed: usize,
    /// Retained terminally failed jobs.
    pub failed: usize,
}
