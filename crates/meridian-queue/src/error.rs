//! Error types for the job queue.

/// Result type alias using [`QueueError`].
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur when interacting with a queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has reached its configured capacity.
    ///
    /// This is a fast, retriable rejection: the caller decides whether to
    /// retry, shed, or surface the error.
    #[error("queue {queue} is full")]
    QueueFull {
        /// Name of the full queue.
        queue: String,
    },

    /// No job with the given id exists.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The job is not in the state the operation requires.
    #[error("job {job} is {actual}, expected {expected}")]
    InvalidJobState {
        /// Job id.
        job: String,
        /// State the operation requires.
        expected: &'static str,
        /// State the job is actually in.
        actual: &'static str,
    },
}

impl QueueError {
    /// Whether the caller may retry the operation later.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
