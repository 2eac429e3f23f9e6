//! Meridian job queue
//!
//! A prioritized, at-least-once work queue with typed payloads. Each queue
//! instance carries exactly one payload type, so the worker boundary is an
//! exhaustive match over a known job shape rather than a stringly-typed
//! dispatch.
//!
//! Guarantees and non-guarantees:
//!
//! - **At-least-once**: a leased job whose consumer disappears becomes
//!   visible again after the lease timeout. Handlers must be idempotent.
//! - **Priority-then-FIFO**: higher priority first; equal priorities in
//!   submission order. Concurrent consumers give no completion ordering.
//! - **Dedup keys**: enqueuing with a dedup key that matches a job still
//!   waiting, delayed, or active coalesces into the existing job.
//! - **Retry with backoff**: failed jobs are re-queued after a fixed or
//!   exponential delay until the attempt cap, then marked failed-terminal.
//! - Completed and failed jobs are retained for a bounded age/count window
//!   for audit, then purged.

mod error;
mod job;
mod queue;
mod worker;

pub use error::{QueueError, QueueResult};
pub use job::{BackoffPolicy, EnqueueOptions, Job, JobId, JobState, QueueStats};
pub use queue::{FailDisposition, Queue, QueueConfig};
pub use worker::{ConsumerConfig, ConsumerPool, HandlerError, JobHandler};
