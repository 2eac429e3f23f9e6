//! Status messages sent from agents back to the orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CommandId, DeploymentId, ServerId};

/// How a dispatched deployment ended on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    /// Container is running and passing its health check.
    Succeeded,
    /// Rollout failed on the host.
    Failed,
}

/// Asynchronous report closing the loop on a `deploy` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStatusReport {
    /// Deployment the report is about.
    pub deployment_id: DeploymentId,
    /// Terminal outcome of the rollout.
    pub outcome: DeployOutcome,
    /// Error message when the rollout failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tail of the container/runtime log, if the agent captured one.
    #[serde(default)]
    pub log_tail: Vec<String>,
    /// When the agent observed the outcome.
    pub timestamp: DateTime<Utc>,
}

/// Messages an agent sends over its status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Agent connected and identified itself.
    Registered {
        /// Host the agent manages.
        server_id: ServerId,
        /// Agent software version.
        version: String,
    },
    /// Periodic liveness signal.
    Heartbeat {
        /// Host the agent manages.
        server_id: ServerId,
        /// Agent uptime in seconds.
        uptime_secs: u64,
    },
    /// Acknowledgement of a received command.
    Ack {
        /// Id of the acknowledged command.
        command_id: CommandId,
    },
    /// Deployment rollout finished (successfully or not).
    DeployStatus(DeployStatusReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_status_roundtrip() {
        let event = AgentEvent::DeployStatus(DeployStatusReport {
            deployment_id: DeploymentId::new("dep-1"),
            outcome: DeployOutcome::Failed,
            error: Some("container exited with code 1".to_owned()),
            log_tail: vec!["starting".to_owned(), "panic".to_owned()],
            timestamp: Utc::now(),
        });

        let json = serde_json::to_string(&event).unwrap();
        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            AgentEvent::DeployStatus(report) => {
                assert_eq!(report.outcome, DeployOutcome::Failed);
                assert_eq!(report.log_tail.len(), 2);
            }
            other => panic!("expected deploy status, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_wire_shape() {
        let event = AgentEvent::Heartbeat {
            server_id: ServerId::new("srv-1"),
            uptime_secs: 120,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["payload"]["server_id"], "srv-1");
    }
}
