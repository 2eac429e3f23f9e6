//! Notification worker: fan out to channels, isolating per-channel failures.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use meridian_queue::{HandlerError, Job, JobHandler};
use meridian_store::{ChannelKind, Deployment, DeploymentStore, Severity};

use crate::config::NotificationConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::jobs::{NotificationType, NotifyJobData};

/// Everything a channel needs to render and deliver one notification.
///
/// Enrichment (the deployment record) is fetched once per job and shared
/// across channel senders.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    /// What the notification is about.
    pub notification: NotificationType,
    /// Message text.
    pub message: String,
    /// Severity.
    pub severity: Severity,
    /// Enriched deployment record, when the job referenced one.
    pub deployment: Option<Deployment>,
    /// Service context.
    pub service_id: Option<String>,
    /// Server context.
    pub server_id: Option<String>,
    /// Email recipients.
    pub recipients: Vec<String>,
    /// When the notification was sent.
    pub timestamp: DateTime<Utc>,
}

/// One delivery channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Which channel this sender serves.
    fn kind(&self) -> ChannelKind;

    /// Deliver the notification.
    async fn deliver(&self, context: &NotificationContext) -> OrchestratorResult<()>;
}

const fn severity_color(severity: Severity) -> u32 {
    match severity {
        Severity::Info => 0x3498db,
        Severity::Warning => 0xf39c12,
        Severity::Critical => 0xe74c3c,
    }
}

/// Chat webhook with a severity-colored embed layout.
pub struct ChatWebhookChannel {
    client: reqwest::Client,
    url: Option<String>,
}

impl ChatWebhookChannel {
    /// Create the channel from configuration.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &NotificationConfig) -> Self {
        Self {
            client,
            url: config.chat_webhook_url.clone(),
        }
    }
}

#[async_trait]
impl NotificationChannel for ChatWebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn deliver(&self, context: &NotificationContext) -> OrchestratorResult<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| OrchestratorError::config("chat webhook URL not configured"))?;

        let mut fields = Vec::new();
        if let Some(deployment) = &context.deployment {
            fields.push(serde_json::json!({
                "name": "deployment",
                "value": deployment.id.as_str(),
            }));
            fields.push(serde_json::json!({
                "name": "status",
                "value": deployment.status.as_str(),
            }));
        }
        if let Some(service_id) = &context.service_id {
            fields.push(serde_json::json!({ "name": "service", "value": service_id }));
        }

        let body = serde_json::json!({
            "embeds": [{
                "title": context.notification.as_str(),
                "description": context.message,
                "color": severity_color(context.severity),
                "fields": fields,
                "timestamp": context.timestamp.to_rfc3339(),
            }]
        });

        let response = self.client.post(url).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Generic webhook POST.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookChannel {
    /// Create the channel from configuration.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &NotificationConfig) -> Self {
        Self {
            client,
            url: config.webhook_url.clone(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn deliver(&self, context: &NotificationContext) -> OrchestratorResult<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| OrchestratorError::config("webhook URL not configured"))?;

        let body = serde_json::json!({
            "type": context.notification.as_str(),
            "message": context.message,
            "timestamp": context.timestamp.to_rfc3339(),
            "deployment": context.deployment.as_ref().map(|d| serde_json::json!({
                "id": d.id.as_str(),
                "status": d.status.as_str(),
                "error": d.error_message,
            })),
            "service": context.service_id,
            "server": context.server_id,
        });

        let response = self.client.post(url).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Email delivered through a configurable HTTP relay.
pub struct EmailChannel {
    client: reqwest::Client,
    endpoint: Option<String>,
    from: String,
    default_recipients: Vec<String>,
}

impl EmailChannel {
    /// Create the channel from configuration.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &NotificationConfig) -> Self {
        Self {
            client,
            endpoint: config.email_endpoint.clone(),
            from: config.email_from.clone(),
            default_recipients: config.default_recipients.clone(),
        }
    }

    fn render_html(context: &NotificationContext) -> String {
        let mut html = format!(
            "<h2>{}</h2><p>{}</p>",
            context.notification.as_str(),
            context.message
        );
        if let Some(deployment) = &context.deployment {
            html.push_str(&format!(
                "<p>Deployment <code>{}</code> is <strong>{}</strong>.</p>",
                deployment.id, deployment.status
            ));
            if let Some(error) = &deployment.error_message {
                html.push_str(&format!("<pre>{error}</pre>"));
            }
        }
        html
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn deliver(&self, context: &NotificationContext) -> OrchestratorResult<()> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| OrchestratorError::config("email endpoint not configured"))?;

        let recipients = if context.recipients.is_empty() {
            self.default_recipients.clone()
        } else {
            context.recipients.clone()
        };
        if recipients.is_empty() {
            return Err(OrchestratorError::config("no email recipients"));
        }

        let subject = format!(
            "[{}] {}",
            context.severity.as_str().to_uppercase(),
            context.notification.as_str()
        );
        let body = serde_json::json!({
            "from": self.from,
            "to": recipients,
            "subject": subject,
            "html": Self::render_html(context),
        });

        let response = self.client.post(endpoint).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Handles notification jobs.
///
/// Channels are attempted independently; one channel failing never
/// short-circuits the others. The job fails only when *every* requested
/// channel failed; partial success is success.
pub struct NotifyWorker {
    store: Arc<dyn DeploymentStore>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotifyWorker {
    /// Create a notify worker with the given channel senders.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self { store, channels }
    }

    /// All production channels over one shared HTTP client.
    #[must_use]
    pub fn default_channels(config: &NotificationConfig) -> Vec<Arc<dyn NotificationChannel>> {
        let client = reqwest::Client::new();
        vec![
            Arc::new(ChatWebhookChannel::new(client.clone(), config)),
            Arc::new(WebhookChannel::new(client.clone(), config)),
            Arc::new(EmailChannel::new(client, config)),
        ]
    }

    async fn build_context(&self, data: &NotifyJobData) -> NotificationContext {
        let deployment = match &data.deployment_id {
            Some(id) => match self.store.get(id).await {
                Ok(deployment) => deployment,
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "enrichment lookup failed");
                    None
                }
            },
            None => None,
        };

        NotificationContext {
            notification: data.notification,
            message: data.message.clone(),
            severity: data.severity,
            deployment,
            service_id: data.service_id.as_ref().map(|s| s.as_str().to_owned()),
            server_id: data.server_id.as_ref().map(|s| s.as_str().to_owned()),
            recipients: data.recipients.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl JobHandler<NotifyJobData> for NotifyWorker {
    async fn handle(&self, job: &Job<NotifyJobData>) -> Result<(), HandlerError> {
        let data = &job.payload;
        if data.channels.is_empty() {
            debug!("notification requested no channels");
            return Ok(());
        }

        let context = self.build_context(data).await;

        let mut delivered = 0usize;
        let mut failures = Vec::new();

        for kind in &data.channels {
            let Some(channel) = self.channels.iter().find(|c| c.kind() == *kind) else {
                warn!(channel = %kind, "no sender for requested channel");
                failures.push(format!("{kind}: no sender configured"));
                continue;
            };

            match channel.deliver(&context).await {
                Ok(()) => {
                    debug!(channel = %kind, "notification delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(channel = %kind, error = %e, "channel delivery failed");
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        if delivered == 0 {
            return Err(HandlerError::retriable(format!(
                "all channels failed: {}",
                failures.join("; ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meridian_queue::JobId;
    use meridian_store::MemoryStore;

    struct FakeChannel {
        kind: ChannelKind,
        fail: bool,
        sent: AtomicUsize,
    }

    impl FakeChannel {
        fn new(kind: ChannelKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                sent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for FakeChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(&self, _context: &NotificationContext) -> OrchestratorResult<()> {
            if self.fail {
                return Err(OrchestratorError::internal("send failed"));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(channels: Vec<ChannelKind>) -> Job<NotifyJobData> {
        Job {
            id: JobId::generate(),
            payload: NotifyJobData::new(
                NotificationType::DeploymentFailed,
                "it broke",
                Severity::Critical,
                channels,
            ),
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            dedup_key: None,
            created_at: Utc::now(),
        }
    }

    fn worker_with(channels: Vec<Arc<FakeChannel>>) -> NotifyWorker {
        let store = Arc::new(MemoryStore::new());
        NotifyWorker::new(
            store,
            channels
                .into_iter()
                .map(|c| c as Arc<dyn NotificationChannel>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn partial_success_is_success() {
        let chat = FakeChannel::new(ChannelKind::Chat, true);
        let webhook = FakeChannel::new(ChannelKind::Webhook, false);
        let worker = worker_with(vec![Arc::clone(&chat), Arc::clone(&webhook)]);

        worker
            .handle(&job(vec![ChannelKind::Chat, ChannelKind::Webhook]))
            .await
            .unwrap();
        assert_eq!(webhook.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_channels_failing_fails_the_job() {
        let chat = FakeChannel::new(ChannelKind::Chat, true);
        let worker = worker_with(vec![chat]);

        let err = worker.handle(&job(vec![ChannelKind::Chat])).await.unwrap_err();
        assert!(err.retriable);
        assert!(err.message.contains("all channels failed"));
    }

    #[tokio::test]
    async fn channel_failure_does_not_short_circuit_others() {
        let chat = FakeChannel::new(ChannelKind::Chat, true);
        let webhook = FakeChannel::new(ChannelKind::Webhook, false);
        let email = FakeChannel::new(ChannelKind::Email, false);
        let worker = worker_with(vec![
            Arc::clone(&chat),
            Arc::clone(&webhook),
            Arc::clone(&email),
        ]);

        worker
            .handle(&job(vec![
                ChannelKind::Chat,
                ChannelKind::Webhook,
                ChannelKind::Email,
            ]))
            .await
            .unwrap();
        assert_eq!(webhook.sent.load(Ordering::SeqCst), 1);
        assert_eq!(email.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconfigured_channel_counts_as_failure() {
        let webhook = FakeChannel::new(ChannelKind::Webhook, false);
        let worker = worker_with(vec![webhook]);

        // Only chat requested, but no chat sender exists.
        let err = worker.handle(&job(vec![ChannelKind::Chat])).await.unwrap_err();
        assert!(err.message.contains("no sender configured"));
    }

    #[test]
    fn severity_colors_are_distinct() {
        assert_ne!(
            severity_color(Severity::Info),
            severity_color(Severity::Critical)
        );
        assert_ne!(
            severity_color(Severity::Warning),
            severity_color(Severity::Critical)
        );
    }
}
