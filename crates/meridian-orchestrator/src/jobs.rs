//! Job payloads for the three queues.
//!
//! Each queue carries exactly one of these types, so worker boundaries are
//! exhaustive matches over known shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use meridian_proto::{DeploymentId, DockerSource, GitSource, ServerId, ServiceId, ServiceSpec};
use meridian_store::{ChannelKind, Severity, TriggerType};

/// Payload for the build queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobData {
    /// Deployment whose image is being built.
    pub deployment_id: DeploymentId,
    /// Target host for the chained deploy.
    pub server_id: ServerId,
    /// Service being built.
    pub service: ServiceSpec,
    /// Source revision to build.
    pub git: GitSource,
    /// Build arguments passed to the image build.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// What initiated the deployment.
    pub trigger: TriggerType,
}

impl BuildJobData {
    /// Dedup key guaranteeing one build job per deployment.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("build-{}", self.deployment_id)
    }
}

/// Payload for the deploy queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJobData {
    /// Deployment being dispatched.
    pub deployment_id: DeploymentId,
    /// Target host.
    pub server_id: ServerId,
    /// Service being deployed.
    pub service: ServiceSpec,
    /// Git details for source-based deploys.
    pub git: Option<GitSource>,
    /// Image details for registry-based deploys.
    pub docker: Option<DockerSource>,
    /// What initiated the deployment.
    pub trigger: TriggerType,
}

impl DeployJobData {
    /// Dedup key guaranteeing one deploy job per deployment.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("deploy-{}", self.deployment_id)
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// A deployment entered the pipeline.
    DeploymentStarted,
    /// A deployment finished successfully.
    DeploymentSucceeded,
    /// A deployment failed.
    DeploymentFailed,
    /// An alert rule fired.
    AlertFired,
    /// An uptime monitor crossed its failure threshold.
    UptimeDown,
}

impl NotificationType {
    /// The wire-level name for this notification type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentStarted => "deployment_started",
            Self::DeploymentSucceeded => "deployment_succeeded",
            Self::DeploymentFailed => "deployment_failed",
            Self::AlertFired => "alert_fired",
            Self::UptimeDown => "uptime_down",
        }
    }
}

/// Payload for the notification queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyJobData {
    /// What the notification is about.
    pub notification: NotificationType,
    /// Human-readable message.
    pub message: String,
    /// Severity, used for chat embed colors and email subjects.
    pub severity: Severity,
    /// Channels to fan out to.
    pub channels: Vec<ChannelKind>,
    /// Deployment context, if any.
    pub deployment_id: Option<DeploymentId>,
    /// Service context, if any.
    pub service_id: Option<ServiceId>,
    /// Server context, if any.
    pub server_id: Option<ServerId>,
    /// Email recipients; falls back to the configured defaults when empty.
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl NotifyJobData {
    /// A notification with the given type, message, and channels.
    #[must_use]
    pub fn new(
        notification: NotificationType,
        message: impl Into<String>,
        severity: Severity,
        channels: Vec<ChannelKind>,
    ) -> Self {
        Self {
            notification,
            message: message.into(),
            severity,
            channels,
            deployment_id: None,
            service_id: None,
            server_id: None,
            recipients: Vec::new(),
        }
    }

    /// Attach deployment context.
    #[must_use]
    pub fn for_deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }

    /// Attach service context.
    #[must_use]
    pub fn for_service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keys_are_per_deployment() {
        let id = DeploymentId::new("dep-1");
        let data = DeployJobData {
            deployment_id: id,
            server_id: ServerId::new("srv-1"),
            service: test_service(),
            git: None,
            docker: None,
            trigger: TriggerType::Manual,
        };
        assert_eq!(data.dedup_key(), "deploy-dep-1");
    }

    fn test_service() -> ServiceSpec {
        ServiceSpec {
            id: ServiceId::new("svc-1"),
            name: "api".to_owned(),
            kind: "web".to_owned(),
            source_type: meridian_proto::SourceType::DockerImage,
            docker_image: Some("registry/app".to_owned()),
            dockerfile_path: "Dockerfile".to_owned(),
            port: 8080,
            replicas: 1,
            health_check: meridian_proto::HealthCheckSpec::default(),
            env_vars: BTreeMap::new(),
            resources: meridian_proto::ResourceSpec::default(),
        }
    }

    #[test]
    fn notify_payload_roundtrip() {
        let data = NotifyJobData::new(
            NotificationType::DeploymentFailed,
            "build failed",
            Severity::Critical,
            vec![ChannelKind::Chat, ChannelKind::Email],
        )
        .for_deployment(DeploymentId::new("dep-1"));

        let json = serde_json::to_string(&data).unwrap();
        let parsed: NotifyJobData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.notification, NotificationType::DeploymentFailed);
        assert_eq!(parsed.channels.len(), 2);
        assert!(parsed.recipients.is_empty());
    }
}
