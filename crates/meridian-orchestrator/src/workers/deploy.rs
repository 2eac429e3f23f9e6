//! Deployment worker: resolve the agent and dispatch the deploy command.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use meridian_proto::{AgentCommand, DeployPayload};
use meridian_queue::{EnqueueOptions, HandlerError, Job, JobHandler, Queue};
use meridian_store::{ChannelKind, DeploymentStatus, DeploymentStore, Severity};

use crate::agent::AgentGateway;
use crate::jobs::{DeployJobData, NotificationType, NotifyJobData};

/// Handles deploy jobs.
///
/// A job is *dispatched*, not completed: the agent reports the rollout
/// outcome asynchronously on its status channel.
pub struct DeployWorker {
    store: Arc<dyn DeploymentStore>,
    gateway: Arc<dyn AgentGateway>,
    notify_queue: Arc<Queue<NotifyJobData>>,
}

impl DeployWorker {
    /// Create a deploy worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        gateway: Arc<dyn AgentGateway>,
        notify_queue: Arc<Queue<NotifyJobData>>,
    ) -> Self {
        Self {
            store,
            gateway,
            notify_queue,
        }
    }

    async fn fail_deployment(&self, data: &DeployJobData, message: &str) {
        if let Err(e) = self
            .store
            .update_status(&data.deployment_id, DeploymentStatus::Failed, Some(message))
            .await
        {
            error!(deployment_id = %data.deployment_id, error = %e, "failed to mark deployment failed");
        }

        let payload = NotifyJobData::new(
            NotificationType::DeploymentFailed,
            format!("Deployment {} failed: {message}", data.deployment_id),
            Severity::Critical,
            vec![ChannelKind::Chat, ChannelKind::Webhook],
        )
        .for_deployment(data.deployment_id.clone())
        .for_service(data.service.id.clone());

        if let Err(e) = self
            .notify_queue
            .enqueue(payload, EnqueueOptions::default())
            .await
        {
            warn!(deployment_id = %data.deployment_id, error = %e, "failed to enqueue notification");
        }
    }
}

#[async_trait]
impl JobHandler<DeployJobData> for DeployWorker {
    async fn handle(&self, job: &Job<DeployJobData>) -> Result<(), HandlerError> {
        let data = &job.payload;

        let deployment = self
            .store
            .get(&data.deployment_id)
            .await
            .map_err(|e| HandlerError::retriable(e.to_string()))?
            .ok_or_else(|| {
                HandlerError::terminal(format!("deployment {} not found", data.deployment_id))
            })?;

        // Re-delivery after dispatch (or after the agent already reported an
        // outcome) is a no-op.
        if deployment.status.is_terminal() || deployment.status == DeploymentStatus::Deploying {
            info!(
                deployment_id = %data.deployment_id,
                status = %deployment.status,
                "skipping dispatch, deployment already past dispatch"
            );
            return Ok(());
        }

        // The agent's absence rarely self-resolves within this job's small
        // retry budget, so it is a terminal failure for the deployment.
        if !self.gateway.is_connected(&data.server_id) {
            warn!(
                deployment_id = %data.deployment_id,
                server_id = %data.server_id,
                "agent not connected"
            );
            self.fail_deployment(data, "agent not connected").await;
            return Err(HandlerError::terminal("agent not connected"));
        }

        self.store
            .update_status(&data.deployment_id, DeploymentStatus::Deploying, None)
            .await
            .map_err(|e| HandlerError::retriable(e.to_string()))?;

        let payload = DeployPayload {
            deployment_id: data.deployment_id.clone(),
            service: data.service.clone(),
            git: data.git.clone(),
            docker: data.docker.clone(),
        };

        if let Err(e) = self
            .gateway
            .send(&data.server_id, AgentCommand::Deploy(payload))
            .await
        {
            // Disconnected between the check and the send.
            self.fail_deployment(data, "agent not connected").await;
            return Err(HandlerError::terminal(e.to_string()));
        }

        info!(
            deployment_id = %data.deployment_id,
            server_id = %data.server_id,
            "deploy command dispatched"
        );
        Ok(())
    }
}
