//! Deployment records and their status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meridian_proto::{DeploymentId, ServerId, ServiceId};

use crate::error::{StoreError, StoreResult};

/// Status of a deployment.
///
/// A strict forward machine: `pending -> building -> deploying -> running`,
/// with `failed` and `cancelled` reachable from any non-terminal status.
/// Image-based deploys skip `building`. Terminal statuses are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, waiting for a worker.
    Pending,
    /// Build worker is producing an image.
    Building,
    /// Deploy command dispatched, waiting for the agent.
    Deploying,
    /// Rollout succeeded.
    Running,
    /// Build or rollout failed.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
}

impl DeploymentStatus {
    /// The status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Cancelled)
    }

    /// Whether the machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            Self::Building => matches!(self, Self::Pending),
            Self::Deploying => matches!(self, Self::Pending | Self::Building),
            Self::Running => matches!(self, Self::Deploying),
            Self::Pending => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What initiated a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Operator action.
    Manual,
    /// Repository push webhook.
    Webhook,
    /// API call.
    Api,
    /// Rollback of an earlier deployment.
    Rollback,
}

/// A deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment id.
    pub id: DeploymentId,
    /// Service being deployed.
    pub service_id: ServiceId,
    /// Target host.
    pub server_id: ServerId,
    /// Current status.
    pub status: DeploymentStatus,
    /// Git revision for source-based deploys.
    pub git_ref: Option<String>,
    /// Image reference, set by the build worker (or at creation for
    /// image-based deploys).
    pub image_ref: Option<String>,
    /// Build output, one line per entry, appended while the build runs.
    pub build_logs: Vec<String>,
    /// Rollout output reported by the agent.
    pub deploy_logs: Vec<String>,
    /// Error message for failed deployments, truncated if oversized.
    pub error_message: Option<String>,
    /// When the build started.
    pub build_started_at: Option<DateTime<Utc>>,
    /// When the build finished.
    pub build_finished_at: Option<DateTime<Utc>>,
    /// When the deploy command was dispatched.
    pub deploy_started_at: Option<DateTime<Utc>>,
    /// When the agent reported a terminal rollout outcome.
    pub deploy_finished_at: Option<DateTime<Utc>>,
    /// What initiated this deployment.
    pub trigger: TriggerType,
    /// For rollbacks, the deployment being rolled back from.
    pub rollback_from: Option<DeploymentId>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new pending deployment.
    #[must_use]
    pub fn new(service_id: ServiceId, server_id: ServerId, trigger: TriggerType) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            service_id,
            server_id,
            status: DeploymentStatus::Pending,
            git_ref: None,
            image_ref: None,
            build_logs: Vec::new(),
            deploy_logs: Vec::new(),
            error_message: None,
            build_started_at: None,
            build_finished_at: None,
            deploy_started_at: None,
            deploy_finished_at: None,
            trigger,
            rollback_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the git revision.
    #[must_use]
    pub fn with_git_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    /// Set the image reference.
    #[must_use]
    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    /// Mark as a rollback of the given deployment.
    #[must_use]
    pub fn with_rollback_from(mut self, source: DeploymentId) -> Self {
        self.rollback_from = Some(source);
        self
    }

    /// Apply a status transition, stamping phase timestamps.
    ///
    /// Rejects transitions the state machine forbids, which also covers any
    /// attempt to mutate a terminal deployment.
    pub fn apply_status(
        &mut self,
        status: DeploymentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if !self.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: self.status.as_str(),
                to: status.as_str(),
            });
        }

        // Leaving a phase stamps its end; entering one stamps its start.
        if self.status == DeploymentStatus::Building && self.build_finished_at.is_none() {
            self.build_finished_at = Some(now);
        }
        if self.status == DeploymentStatus::Deploying && self.deploy_finished_at.is_none() {
            self.deploy_finished_at = Some(now);
        }
        match status {
            DeploymentStatus::Building => self.build_started_at = Some(now),
            DeploymentStatus::Deploying => self.deploy_started_at = Some(now),
            _ => {}
        }

        self.status = status;
        if let Some(error) = error {
            self.error_message = Some(truncate_error(error, 20));
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Truncate an error message to its last `max_lines` lines, keeping the most
/// recent output where the cause usually is. Oversized single lines are also
/// capped.
#[must_use]
pub fn truncate_error(message: &str, max_lines: usize) -> String {
    const MAX_CHARS: usize = 4_000;

    let lines: Vec<&str> = message.lines().collect();
    let start = lines.len().saturating_sub(max_lines.max(1));
    let mut truncated = lines[start..].join("\n");

    if truncated.len() > MAX_CHARS {
        let cut = truncated.len() - MAX_CHARS;
        let boundary = (cut..truncated.len())
            .find(|i| truncated.is_char_boundary(*i))
            .unwrap_or(truncated.len());
        truncated = truncated.split_off(boundary);
    }
    truncated
}
