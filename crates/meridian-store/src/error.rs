//! Error types for the store crate.

/// Result type alias using [`StoreError`].
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when reading or mutating records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record of the given kind with the given id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind, e.g. "deployment".
        kind: &'static str,
        /// Record id.
        id: String,
    },

    /// A status change that the record's state machine forbids.
    #[error("invalid status transition: cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: &'static str,
        /// Attempted target status.
        to: &'static str,
    },

    /// A record failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend failure.
    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
