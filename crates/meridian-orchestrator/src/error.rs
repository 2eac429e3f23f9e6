//! Error types for the orchestrator.

use meridian_proto::ServerId;

/// Result type alias using [`OrchestratorError`].
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that can occur while orchestrating deployments.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] meridian_store::StoreError),

    /// Queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] meridian_queue::QueueError),

    /// No agent connected for the target server.
    #[error("agent not connected")]
    AgentNotConnected {
        /// Server the command was addressed to.
        server: ServerId,
    },

    /// A strategy operation was invoked against the wrong strategy kind.
    #[error("strategy mismatch for {service}: expected {expected}, found {actual}")]
    StrategyMismatch {
        /// Service whose strategy was addressed.
        service: String,
        /// Kind the operation requires.
        expected: &'static str,
        /// Kind actually configured.
        actual: &'static str,
    },

    /// No strategy configured for the service.
    #[error("no strategy configured for service {0}")]
    StrategyNotFound(String),

    /// A build step failed.
    #[error("build failed: {0}")]
    Build(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a build error.
    #[must_use]
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
