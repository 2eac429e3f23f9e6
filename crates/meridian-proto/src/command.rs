//! Commands sent from the orchestration core to agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::ServiceSpec;
use crate::types::{CommandId, DeploymentId, ServiceId};

/// A command envelope addressed to one agent.
///
/// The envelope id is unique per command so agents can deduplicate a command
/// delivered more than once. The payload shape is determined by the tagged
/// [`AgentCommand`] inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Unique command id, echoed back in agent acknowledgements.
    pub id: CommandId,
    /// The command and its payload.
    #[serde(flatten)]
    pub command: AgentCommand,
    /// When the command was issued.
    pub timestamp: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Wrap a command in a new envelope with a fresh id and timestamp.
    #[must_use]
    pub fn new(command: AgentCommand) -> Self {
        Self {
            id: CommandId::generate(),
            command,
            timestamp: Utc::now(),
        }
    }

    /// The command type as a wire-level string.
    #[must_use]
    pub const fn command_type(&self) -> &'static str {
        self.command.type_str()
    }
}

/// The commands an agent understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Run a deployment on the host.
    Deploy(DeployPayload),
    /// Change a service's replica count.
    Scale(ScalePayload),
    /// Route all traffic to a new active deployment (blue-green).
    TrafficSwitch(TrafficSwitchPayload),
    /// Split traffic between stable and canary deployments.
    TrafficSplit(TrafficSplitPayload),
}

impl AgentCommand {
    /// The wire-level type tag for this command.
    #[must_use]
    pub const fn type_str(&self) -> &'static str {
        match self {
            Self::Deploy(_) => "deploy",
            Self::Scale(_) => "scale",
            Self::TrafficSwitch(_) => "traffic_switch",
            Self::TrafficSplit(_) => "traffic_split",
        }
    }
}

/// Git revision details for source-based deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    /// Repository clone URL.
    pub repo_url: String,
    /// Branch name.
    pub branch: String,
    /// Commit SHA being deployed.
    pub commit_sha: String,
}

/// Registry image details for image-based deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSource {
    /// Image name without tag.
    pub image: String,
    /// Image tag.
    pub tag: String,
}

/// Payload for a `deploy` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPayload {
    /// Deployment being rolled out.
    pub deployment_id: DeploymentId,
    /// Full service description.
    pub service: ServiceSpec,
    /// Git details, for git-sourced services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    /// Image details, for registry-sourced services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSource>,
}

/// Payload for a `scale` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalePayload {
    /// Service being scaled.
    pub service_id: ServiceId,
    /// New replica count.
    pub replicas: u32,
}

/// Payload for a `traffic_switch` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSwitchPayload {
    /// Service whose traffic is switching.
    pub service_id: ServiceId,
    /// Deployment that should now receive all traffic.
    pub active_deployment_id: DeploymentId,
    /// Always `blue_green`; present so agents can route without extra lookups.
    pub strategy: String,
}

/// Payload for a `traffic_split` command.
///
/// A `canary_deployment_id` of `None` with weight 0 tears the split down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplitPayload {
    /// Service whose traffic is splitting.
    pub service_id: ServiceId,
    /// Canary deployment, or `None` when the split is removed.
    pub canary_deployment_id: Option<DeploymentId>,
    /// Percentage of traffic routed to the canary, 0-100.
    pub weight: u8,
}
