//! The typed queue implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{BackoffPolicy, EnqueueOptions, Job, JobId, JobState, QueueStats};

/// Configuration for a single queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, used in logs and errors.
    pub name: String,
    /// Maximum number of pending (waiting, active, retry-waiting) jobs.
    pub max_size: usize,
    /// How long a lease lasts before the job becomes visible again.
    pub lease_timeout: Duration,
    /// How long completed/failed jobs are retained.
    pub retention_max_age: Duration,
    /// How many completed/failed jobs are retained.
    pub retention_max_count: usize,
    /// How often blocked consumers re-check timers.
    pub poll_interval: Duration,
}

impl QueueConfig {
    /// Configuration with defaults for the given queue name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 10_000,
            lease_timeout: Duration::from_secs(60),
            retention_max_age: Duration::from_secs(24 * 60 * 60),
            retention_max_count: 1_000,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set the lease timeout.
    #[must_use]
    pub const fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Set the pending-job capacity.
    #[must_use]
    pub const fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// What happened to a job that was reported failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// The job was re-queued and will be delivered again after the delay.
    Retrying {
        /// Backoff delay before the next delivery.
        delay: Duration,
    },
    /// The attempt cap was exhausted (or the error was terminal); the job is
    /// now failed-terminal.
    Exhausted,
}

#[derive(Debug)]
enum EntryState {
    Waiting,
    Active { lease_deadline: Instant },
    RetryWaiting { ready_at: Instant },
    Completed { at: Instant },
    Failed { at: Instant },
}

impl EntryState {
    const fn job_state(&self) -> JobState {
        match self {
            Self::Waiting => JobState::Waiting,
            Self::Active { .. } => JobState::Active,
            Self::RetryWaiting { .. } => JobState::RetryWaiting,
            Self::Completed { .. } => JobState::Completed,
            Self::Failed { .. } => JobState::Failed,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active { .. } => "active",
            Self::RetryWaiting { .. } => "retry_waiting",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

struct Entry<P> {
    job: Job<P>,
    backoff: BackoffPolicy,
    state: EntryState,
    epoch: u64,
    error: Option<String>,
}

struct ReadyRef {
    priority: u8,
    seq: u64,
    epoch: u64,
    id: JobId,
}

impl PartialEq for ReadyRef {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyRef {}

impl PartialOrd for ReadyRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct State<P> {
    entries: HashMap<JobId, Entry<P>>,
    ready: BinaryHeap<ReadyRef>,
    dedup: HashMap<String, JobId>,
    finished: VecDeque<JobId>,
    pending: usize,
    seq: u64,
}

impl<P> Default for State<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            ready: BinaryHeap::new(),
            dedup: HashMap::new(),
            finished: VecDeque::new(),
            pending: 0,
            seq: 0,
        }
    }
}

/// A prioritized, at-least-once queue for one payload type.
pub struct Queue<P> {
    config: QueueConfig,
    state: Mutex<State<P>>,
    notify: Notify,
}

impl<P> Queue<P> {
    /// Create a new queue with the given configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl<P: Clone> Queue<P> {
    /// Submit a job.
    ///
    /// If `opts.dedup_key` matches a job that is still waiting, leased, or
    /// waiting out a retry, the submission coalesces into that job and its
    /// id is returned instead of creating a duplicate.
    pub async fn enqueue(&self, payload: P, opts: EnqueueOptions) -> QueueResult<JobId> {
        let mut state = self.state.lock().await;

        if let Some(key) = &opts.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                if let Some(entry) = state.entries.get(existing) {
                    if entry.state.job_state().is_pending() {
                        debug!(
                            queue = %self.config.name,
                            job_id = %existing,
                            dedup_key = %key,
                            "coalesced into in-flight job"
                        );
                        return Ok(existing.clone());
                    }
                }
            }
        }

        if state.pending >= self.config.max_size {
            return Err(QueueError::QueueFull {
                queue: self.config.name.clone(),
            });
        }

        let job = Job {
            id: JobId::generate(),
            payload,
            priority: opts.priority,
            attempts: 0,
            max_attempts: opts.effective_max_attempts(),
            dedup_key: opts.dedup_key.clone(),
            created_at: Utc::now(),
        };
        let id = job.id.clone();

        if let Some(key) = opts.dedup_key {
            state.dedup.insert(key, id.clone());
        }

        let seq = state.seq;
        state.seq += 1;
        state.ready.push(ReadyRef {
            priority: opts.priority,
            seq,
            epoch: 0,
            id: id.clone(),
        });
        state.entries.insert(
            id.clone(),
            Entry {
                job,
                backoff: opts.backoff,
                state: EntryState::Waiting,
                epoch: 0,
                error: None,
            },
        );
        state.pending += 1;
        drop(state);

        self.notify.notify_one();
        debug!(queue = %self.config.name, job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Lease the next ready job without blocking.
    pub async fn try_next(&self) -> Option<Job<P>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.tick_locked(&mut state, now);
        self.lease_locked(&mut state, now)
    }

    /// Lease the next job, waiting until one is ready or `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Job<P>> {
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.tick_locked(&mut state, now);
                if let Some(job) = self.lease_locked(&mut state, now) {
                    return Some(job);
                }
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => return None,

                _ = tokio::time::timeout(self.config.poll_interval, self.notify.notified()) => {}
            }
        }
    }

    /// Mark a leased job as successfully completed.
    pub async fn ack(&self, id: &JobId) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        if !matches!(entry.state, EntryState::Active { .. }) {
            return Err(QueueError::InvalidJobState {
                job: id.to_string(),
                expected: "active",
                actual: entry.state.name(),
            });
        }

        entry.state = EntryState::Completed { at: now };
        entry.error = None;
        Self::finish_locked(&mut state, id);
        self.purge_locked(&mut state, now);
        Ok(())
    }

    /// Report a leased job as failed.
    ///
    /// Retriable failures re-queue the job after its backoff delay until the
    /// attempt cap; terminal failures (and exhausted retriable ones) mark it
    /// failed-terminal. The disposition tells the caller which happened.
    pub async fn fail(
        &self,
        id: &JobId,
        error: &str,
        retriable: bool,
    ) -> QueueResult<FailDisposition> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        if !matches!(entry.state, EntryState::Active { .. }) {
            return Err(QueueError::InvalidJobState {
                job: id.to_string(),
                expected: "active",
                actual: entry.state.name(),
            });
        }

        entry.error = Some(error.to_owned());

        if retriable && entry.job.attempts < entry.job.max_attempts {
            let delay = entry.backoff.delay(entry.job.attempts);
            entry.state = EntryState::RetryWaiting {
                ready_at: now + delay,
            };
            debug!(
                queue = %self.config.name,
                job_id = %id,
                attempts = entry.job.attempts,
                delay_ms = delay.as_millis() as u64,
                "job failed, retry scheduled"
            );
            Ok(FailDisposition::Retrying { delay })
        } else {
            entry.state = EntryState::Failed { at: now };
            warn!(
                queue = %self.config.name,
                job_id = %id,
                attempts = entry.job.attempts,
                error = %error,
                "job failed terminally"
            );
            Self::finish_locked(&mut state, id);
            self.purge_locked(&mut state, now);
            Ok(FailDisposition::Exhausted)
        }
    }

    /// Current lifecycle state of a job, if it is still known.
    pub async fn job_state(&self, id: &JobId) -> Option<JobState> {
        let state = self.state.lock().await;
        state.entries.get(id).map(|e| e.state.job_state())
    }

    /// Last recorded error for a job, if any.
    pub async fn job_error(&self, id: &JobId) -> Option<String> {
        let state = self.state.lock().await;
        state.entries.get(id).and_then(|e| e.error.clone())
    }

    /// Per-queue counters.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            match entry.state.job_state() {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::RetryWaiting => stats.retry_waiting += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn lease_locked(&self, state: &mut State<P>, now: Instant) -> Option<Job<P>> {
        while let Some(top) = state.ready.pop() {
            let Some(entry) = state.entries.get_mut(&top.id) else {
                continue;
            };
            // Stale heap entries from an earlier epoch are skipped.
            if top.epoch != entry.epoch || !matches!(entry.state, EntryState::Waiting) {
                continue;
            }

            entry.state = EntryState::Active {
                lease_deadline: now + self.config.lease_timeout,
            };
            entry.job.attempts += 1;
            debug!(queue = %self.config.name, job_id = %entry.job.id, "job leased");
            return Some(entry.job.clone());
        }
        None
    }

    /// Promote due retries and reclaim expired leases.
    fn tick_locked(&self, state: &mut State<P>, now: Instant) {
        let mut requeue = Vec::new();
        let mut expire = Vec::new();

        for (id, entry) in &state.entries {
            match entry.state {
                EntryState::RetryWaiting { ready_at } if ready_at <= now => {
                    requeue.push(id.clone());
                }
                EntryState::Active { lease_deadline } if lease_deadline <= now => {
                    expire.push(id.clone());
                }
                _ => {}
            }
        }

        for id in requeue {
            self.requeue_locked(state, &id);
        }

        for id in expire {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.job.attempts >= entry.job.max_attempts {
                warn!(
                    queue = %self.config.name,
                    job_id = %id,
                    "lease expired with attempts exhausted, failing job"
                );
                entry.state = EntryState::Failed { at: now };
                entry.error = Some("lease expired".to_owned());
                Self::finish_locked(state, &id);
            } else {
                warn!(queue = %self.config.name, job_id = %id, "lease expired, re-queueing");
                self.requeue_locked(state, &id);
            }
        }

        self.purge_locked(state, now);
    }

    fn requeue_locked(&self, state: &mut State<P>, id: &JobId) {
        let seq = state.seq;
        let Some(entry) = state.entries.get_mut(id) else {
            return;
        };
        entry.state = EntryState::Waiting;
        entry.epoch += 1;
        let reference = ReadyRef {
            priority: entry.job.priority,
            seq,
            epoch: entry.epoch,
            id: id.clone(),
        };
        state.seq += 1;
        state.ready.push(reference);
    }

    /// Bookkeeping when a job reaches a terminal state. The entry must
    /// already be marked completed or failed.
    fn finish_locked(state: &mut State<P>, id: &JobId) {
        state.pending = state.pending.saturating_sub(1);
        state.finished.push_back(id.clone());

        let key = state
            .entries
            .get(id)
            .and_then(|e| e.job.dedup_key.clone());
        if let Some(key) = key {
            if state.dedup.get(&key).is_some_and(|mapped| mapped == id) {
                state.dedup.remove(&key);
            }
        }
    }

    /// Drop retained terminal jobs past the age or count window.
    fn purge_locked(&self, state: &mut State<P>, now: Instant) {
        while state.finished.len() > self.config.retention_max_count {
            if let Some(id) = state.finished.pop_front() {
                state.entries.remove(&id);
            }
        }

        loop {
            let Some(id) = state.finished.front() else {
                break;
            };
            let expired = state.entries.get(id).is_none_or(|entry| {
                let finished_at = match entry.state {
                    EntryState::Completed { at } | EntryState::Failed { at } => at,
                    // Not terminal: stale queue position, drop it.
                    _ => return true,
                };
                now.duration_since(finished_at) > self.config.retention_max_age
            });
            if !expired {
                break;
            }
            if let Some(id) = state.finished.pop_front() {
                state.entries.remove(&id);
            }
        }
    }
}

impl<P> std::fmt::Debug for Queue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}
