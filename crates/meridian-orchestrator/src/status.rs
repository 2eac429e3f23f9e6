//! Agent status ingestion.
//!
//! The agent reports rollout outcomes asynchronously; this is the input seam
//! that turns those reports into deployment state transitions and
//! notifications.

use std::sync::Arc;

use tracing::{debug, info, warn};

use meridian_proto::{AgentEvent, DeployOutcome, DeployStatusReport};
use meridian_queue::{EnqueueOptions, Queue};
use meridian_store::{
    truncate_error, ChannelKind, DeploymentStatus, DeploymentStore, Severity,
};

use crate::agent::ChannelAgentGateway;
use crate::error::OrchestratorResult;
use crate::jobs::{NotificationType, NotifyJobData};

/// Applies agent status messages to deployment state.
pub struct StatusIngest {
    store: Arc<dyn DeploymentStore>,
    notify_queue: Arc<Queue<NotifyJobData>>,
    gateway: Arc<ChannelAgentGateway>,
}

impl StatusIngest {
    /// Create a status ingester.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        notify_queue: Arc<Queue<NotifyJobData>>,
        gateway: Arc<ChannelAgentGateway>,
    ) -> Self {
        Self {
            store,
            notify_queue,
            gateway,
        }
    }

    /// Handle one event from an agent's status channel.
    pub async fn handle_event(&self, event: AgentEvent) -> OrchestratorResult<()> {
        match event {
            AgentEvent::Registered { server_id, version } => {
                info!(server_id = %server_id, version = %version, "agent registered");
                Ok(())
            }
            AgentEvent::Heartbeat { server_id, .. } => {
                self.gateway.record_heartbeat(&server_id);
                Ok(())
            }
            AgentEvent::Ack { command_id } => {
                debug!(command_id = %command_id, "command acknowledged");
                Ok(())
            }
            AgentEvent::DeployStatus(report) => self.apply_report(report).await,
        }
    }

    /// Apply a rollout outcome report.
    ///
    /// Only deployments still in `deploying` transition; reports for unknown
    /// or already-terminal deployments are ignored (terminal states are
    /// immutable).
    pub async fn apply_report(&self, report: DeployStatusReport) -> OrchestratorResult<()> {
        let Some(deployment) = self.store.get(&report.deployment_id).await? else {
            warn!(deployment_id = %report.deployment_id, "status report for unknown deployment");
            return Ok(());
        };

        if deployment.status != DeploymentStatus::Deploying {
            debug!(
                deployment_id = %report.deployment_id,
                status = %deployment.status,
                "ignoring status report for non-deploying deployment"
            );
            return Ok(());
        }

        if !report.log_tail.is_empty() {
            self.store
                .append_deploy_logs(&report.deployment_id, &report.log_tail)
                .await?;
        }

        match report.outcome {
            DeployOutcome::Succeeded => {
                self.store
                    .update_status(&report.deployment_id, DeploymentStatus::Running, None)
                    .await?;
                info!(deployment_id = %report.deployment_id, "deployment running");
                self.notify(
                    &report,
                    NotificationType::DeploymentSucceeded,
                    Severity::Info,
                    format!("Deployment {} is running", report.deployment_id),
                )
                .await;
            }
            DeployOutcome::Failed => {
                let error = report.error.as_deref().unwrap_or("rollout failed");
                let truncated = truncate_error(error, 20);
                self.store
                    .update_status(
                        &report.deployment_id,
                        DeploymentStatus::Failed,
                        Some(&truncated),
                    )
                    .await?;
                warn!(deployment_id = %report.deployment_id, error = %truncated, "deployment failed on host");
                self.notify(
                    &report,
                    NotificationType::DeploymentFailed,
                    Severity::Critical,
                    format!("Deployment {} failed: {truncated}", report.deployment_id),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn notify(
        &self,
        report: &DeployStatusReport,
        notification: NotificationType,
        severity: Severity,
        message: String,
    ) {
        let payload = NotifyJobData::new(
            notification,
            message,
            severity,
            vec![ChannelKind::Chat, ChannelKind::Webhook],
        )
        .for_deployment(report.deployment_id.clone());

        if let Err(e) = self
            .notify_queue
            .enqueue(payload, EnqueueOptions::default())
            .await
        {
            warn!(deployment_id = %report.deployment_id, error = %e, "failed to enqueue notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use meridian_proto::{DeploymentId, ServerId, ServiceId};
    use meridian_queue::QueueConfig;
    use meridian_store::{Deployment, MemoryStore, TriggerType};

    struct Fixture {
        store: Arc<MemoryStore>,
        notify_queue: Arc<Queue<NotifyJobData>>,
        ingest: StatusIngest,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notify_queue = Arc::new(Queue::new(QueueConfig::new("notify")));
        let ingest = StatusIngest::new(
            Arc::clone(&store) as Arc<dyn DeploymentStore>,
            Arc::clone(&notify_queue),
            Arc::new(ChannelAgentGateway::new()),
        );
        Fixture {
            store,
            notify_queue,
            ingest,
        }
    }

    async fn deploying_deployment(fixture: &Fixture) -> DeploymentId {
        let deployment = Deployment::new(
            ServiceId::new("svc-1"),
            ServerId::new("srv-1"),
            TriggerType::Manual,
        );
        let id = deployment.id.clone();
        fixture.store.insert(&deployment).await.unwrap();
        fixture
            .store
            .update_status(&id, DeploymentStatus::Deploying, None)
            .await
            .unwrap();
        id
    }

    fn report(id: &DeploymentId, outcome: DeployOutcome, error: Option<&str>) -> DeployStatusReport {
        DeployStatusReport {
            deployment_id: id.clone(),
            outcome,
            error: error.map(ToOwned::to_owned),
            log_tail: vec!["container started".to_owned()],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn success_report_transitions_to_running() {
        let fixture = fixture();
        let id = deploying_deployment(&fixture).await;

        fixture
            .ingest
            .apply_report(report(&id, DeployOutcome::Succeeded, None))
            .await
            .unwrap();

        let deployment = fixture.store.get(&id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert!(deployment.deploy_finished_at.is_some());
        assert_eq!(deployment.deploy_logs, vec!["container started"]);

        let notify = fixture.notify_queue.try_next().await.expect("notification");
        assert_eq!(
            notify.payload.notification,
            NotificationType::DeploymentSucceeded
        );
    }

    #[tokio::test]
    async fn failure_report_preserves_error() {
        let fixture = fixture();
        let id = deploying_deployment(&fixture).await;

        fixture
            .ingest
            .apply_report(report(
                &id,
                DeployOutcome::Failed,
                Some("container exited with code 137"),
            ))
            .await
            .unwrap();

        let deployment = fixture.store.get(&id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment
            .error_message
            .as_deref()
            .unwrap()
            .contains("code 137"));

        let notify = fixture.notify_queue.try_next().await.expect("notification");
        assert_eq!(
            notify.payload.notification,
            NotificationType::DeploymentFailed
        );
    }

    #[tokio::test]
    async fn report_for_non_deploying_deployment_is_ignored() {
        let fixture = fixture();
        let deployment = Deployment::new(
            ServiceId::new("svc-1"),
            ServerId::new("srv-1"),
            TriggerType::Manual,
        );
        let id = deployment.id.clone();
        fixture.store.insert(&deployment).await.unwrap();

        fixture
            .ingest
            .apply_report(report(&id, DeployOutcome::Succeeded, None))
            .await
            .unwrap();

        let deployment = fixture.store.get(&id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);
        assert!(fixture.notify_queue.try_next().await.is_none());
    }

    #[tokio::test]
    async fn report_for_unknown_deployment_is_ignored() {
        let fixture = fixture();
        fixture
            .ingest
            .apply_report(report(
                &DeploymentId::new("missing"),
                DeployOutcome::Failed,
                None,
            ))
            .await
            .unwrap();
        assert!(fixture.notify_queue.try_next().await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_event_updates_gateway() {
        let fixture = fixture();
        let server = ServerId::new("srv-1");

        fixture
            .ingest
            .handle_event(AgentEvent::Heartbeat {
                server_id: server.clone(),
                uptime_secs: 10,
            })
            .await
            .unwrap();
        assert!(fixture.ingest.gateway.last_heartbeat(&server).is_some());
    }
}
