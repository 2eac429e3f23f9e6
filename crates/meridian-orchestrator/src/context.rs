//! Explicitly constructed orchestrator context.
//!
//! Queue and worker handles are built once here and passed to call sites;
//! there are no module-level singletons. External triggers (API, webhook,
//! schedule) enter through [`OrchestratorContext::trigger_deployment`] and
//! [`OrchestratorContext::trigger_rollback`].

use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meridian_proto::{DeploymentId, DockerSource, GitSource, ServerId, ServiceSpec, SourceType};
use meridian_queue::{ConsumerConfig, ConsumerPool, EnqueueOptions, Queue, QueueConfig};
use meridian_store::{
    AlertStore, Deployment, DeploymentStore, MemoryStore, ScalingStore, StrategyStore,
    TriggerType, UptimeStore,
};

use crate::agent::AgentGateway;
use crate::config::{OrchestratorConfig, PoolConfig};
use crate::controllers::{AlertEvaluator, AutoscaleController, UptimeChecker};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::jobs::{BuildJobData, DeployJobData, NotifyJobData};
use crate::metrics::MetricsSource;
use crate::strategy::StrategyEngine;
use crate::workers::{BuildExecutor, BuildWorker, DeployWorker, NotificationChannel, NotifyWorker};

/// The storage backends the orchestrator talks to.
#[derive(Clone)]
pub struct Stores {
    /// Deployment records.
    pub deployments: Arc<dyn DeploymentStore>,
    /// Rollout strategies.
    pub strategies: Arc<dyn StrategyStore>,
    /// Autoscaling rules, replica counts, placements, audit trail.
    pub scaling: Arc<dyn ScalingStore>,
    /// Uptime monitors and checks.
    pub uptime: Arc<dyn UptimeStore>,
    /// Alert rules and fired alerts.
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    /// All stores backed by one shared in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            deployments: Arc::clone(&store) as Arc<dyn DeploymentStore>,
            strategies: Arc::clone(&store) as Arc<dyn StrategyStore>,
            scaling: Arc::clone(&store) as Arc<dyn ScalingStore>,
            uptime: Arc::clone(&store) as Arc<dyn UptimeStore>,
            alerts: store as Arc<dyn AlertStore>,
        }
    }
}

/// Holds every queue, store, and collaborator handle, constructed once.
pub struct OrchestratorContext {
    /// Service configuration.
    pub config: OrchestratorConfig,
    /// Storage backends.
    pub stores: Stores,
    /// Build job queue.
    pub build_queue: Arc<Queue<BuildJobData>>,
    /// Deploy job queue.
    pub deploy_queue: Arc<Queue<DeployJobData>>,
    /// Notification job queue.
    pub notify_queue: Arc<Queue<NotifyJobData>>,
    /// Agent command gateway.
    pub gateway: Arc<dyn AgentGateway>,
    /// Metrics backend.
    pub metrics: Arc<dyn MetricsSource>,
}

impl OrchestratorContext {
    /// Construct the context, creating the three queues.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        stores: Stores,
        gateway: Arc<dyn AgentGateway>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            config,
            stores,
            build_queue: Arc::new(Queue::new(QueueConfig::new("builds"))),
            deploy_queue: Arc::new(Queue::new(QueueConfig::new("deploys"))),
            notify_queue: Arc::new(Queue::new(QueueConfig::new("notifications"))),
            gateway,
            metrics,
        }
    }

    /// Create a deployment for a service and enqueue the work to run it.
    ///
    /// Git-sourced services get a build job that chains into a deploy;
    /// image-sourced services go straight to the deploy queue. The dedup key
    /// guarantees a single in-flight job per deployment.
    pub async fn trigger_deployment(
        &self,
        service: ServiceSpec,
        server_id: ServerId,
        git: Option<GitSource>,
        trigger: TriggerType,
    ) -> OrchestratorResult<DeploymentId> {
        let mut deployment =
            Deployment::new(service.id.clone(), server_id.clone(), trigger);
        if let Some(git) = &git {
            deployment = deployment.with_git_ref(git.commit_sha.clone());
        }
        if service.source_type == SourceType::DockerImage {
            let image = service.docker_image.clone().ok_or_else(|| {
                OrchestratorError::config("image-sourced service has no docker_image")
            })?;
            deployment = deployment.with_image_ref(image);
        }

        let deployment_id = deployment.id.clone();
        self.stores.deployments.insert(&deployment).await?;
        self.stores
            .scaling
            .set_service_server(&service.id, &server_id)
            .await?;

        info!(
            deployment_id = %deployment_id,
            service = %service.name,
            server_id = %server_id,
            "deployment triggered"
        );

        match service.source_type {
            SourceType::Git => {
                let git = git.ok_or_else(|| {
                    OrchestratorError::config("git-sourced service needs a git revision")
                })?;
                let data = BuildJobData {
                    deployment_id: deployment_id.clone(),
                    server_id,
                    service,
                    git,
                    build_args: Default::default(),
                    trigger,
                };
                let dedup_key = data.dedup_key();
                self.build_queue
                    .enqueue(
                        data,
                        EnqueueOptions::with_max_attempts(self.config.queues.build.max_attempts)
                            .dedup_key(dedup_key),
                    )
                    .await?;
            }
            SourceType::DockerImage => {
                let image = deployment.image_ref.as_deref().ok_or_else(|| {
                    OrchestratorError::config("image-sourced service has no docker_image")
                })?;
                let docker = parse_image(image);
                let data = DeployJobData {
                    deployment_id: deployment_id.clone(),
                    server_id,
                    service,
                    git: None,
                    docker: Some(docker),
                    trigger,
                };
                let dedup_key = data.dedup_key();
                self.deploy_queue
                    .enqueue(
                        data,
                        EnqueueOptions::with_max_attempts(self.config.queues.deploy.max_attempts)
                            .dedup_key(dedup_key),
                    )
                    .await?;
            }
        }

        Ok(deployment_id)
    }

    /// Create a rollback deployment from an earlier deployment's image.
    ///
    /// The source deployment is never mutated; the rollback is a new record
    /// with `rollback_from` set, dispatched through the deploy queue.
    pub async fn trigger_rollback(
        &self,
        service: ServiceSpec,
        server_id: ServerId,
        rollback_from: &DeploymentId,
    ) -> OrchestratorResult<DeploymentId> {
        let source = self
            .stores
            .deployments
            .get(rollback_from)
            .await?
            .ok_or_else(|| {
                OrchestratorError::config(format!("unknown source deployment {rollback_from}"))
            })?;
        let image = source.image_ref.clone().ok_or_else(|| {
            OrchestratorError::config(format!(
                "deployment {rollback_from} has no image to roll back to"
            ))
        })?;

        let deployment = Deployment::new(service.id.clone(), server_id.clone(), TriggerType::Rollback)
            .with_rollback_from(rollback_from.clone())
            .with_image_ref(image.clone());
        let deployment_id = deployment.id.clone();
        self.stores.deployments.insert(&deployment).await?;

        info!(
            deployment_id = %deployment_id,
            rollback_from = %rollback_from,
            image = %image,
            "rollback triggered"
        );

        let data = DeployJobData {
            deployment_id: deployment_id.clone(),
            server_id,
            service,
            git: None,
            docker: Some(parse_image(&image)),
            trigger: TriggerType::Rollback,
        };
        let dedup_key = data.dedup_key();
        self.deploy_queue
            .enqueue(
                data,
                EnqueueOptions::with_max_attempts(self.config.queues.deploy.max_attempts)
                    .dedup_key(dedup_key),
            )
            .await?;

        Ok(deployment_id)
    }

    /// Start every worker pool and control loop.
    ///
    /// Returns the spawned task handles; they stop when `cancel` fires.
    pub fn start(
        &self,
        executor: Arc<dyn BuildExecutor>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let build_worker = BuildWorker::new(
            Arc::clone(&self.stores.deployments),
            executor,
            Arc::clone(&self.deploy_queue),
            Arc::clone(&self.notify_queue),
            self.config.build.clone(),
            self.config.queues.deploy.max_attempts,
        );
        tasks.push(spawn_pool(
            Arc::clone(&self.build_queue),
            Arc::new(build_worker),
            &self.config.queues.build,
            cancel.clone(),
        ));

        let deploy_worker = DeployWorker::new(
            Arc::clone(&self.stores.deployments),
            Arc::clone(&self.gateway),
            Arc::clone(&self.notify_queue),
        );
        tasks.push(spawn_pool(
            Arc::clone(&self.deploy_queue),
            Arc::new(deploy_worker),
            &self.config.queues.deploy,
            cancel.clone(),
        ));

        let notify_worker = NotifyWorker::new(Arc::clone(&self.stores.deployments), channels);
        tasks.push(spawn_pool(
            Arc::clone(&self.notify_queue),
            Arc::new(notify_worker),
            &self.config.queues.notify,
            cancel.clone(),
        ));

        let alert_evaluator = Arc::new(AlertEvaluator::new(
            Arc::clone(&self.stores.alerts),
            Arc::clone(&self.metrics),
            Arc::clone(&self.notify_queue),
        ));
        let alert_interval =
            std::time::Duration::from_secs(self.config.controllers.alert_interval_secs);
        let alert_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            alert_evaluator.run(alert_interval, alert_cancel).await;
        }));

        let uptime_checker = Arc::new(UptimeChecker::new(
            Arc::clone(&self.stores.uptime),
            Arc::clone(&self.stores.alerts),
            Arc::clone(&self.notify_queue),
        ));
        let uptime_tick = std::time::Duration::from_secs(self.config.controllers.uptime_tick_secs);
        let uptime_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            uptime_checker.run(uptime_tick, uptime_cancel).await;
        }));

        let autoscaler = Arc::new(AutoscaleController::new(
            Arc::clone(&self.stores.scaling),
            Arc::clone(&self.gateway),
            Arc::clone(&self.metrics),
        ));
        let autoscale_interval =
            std::time::Duration::from_secs(self.config.controllers.autoscale_interval_secs);
        let autoscale_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            autoscaler.run(autoscale_interval, autoscale_cancel).await;
        }));

        let strategy_engine = Arc::new(StrategyEngine::new(
            Arc::clone(&self.stores.strategies),
            Arc::clone(&self.stores.scaling),
            Arc::clone(&self.gateway),
            Arc::clone(&self.metrics),
        ));
        let canary_interval =
            std::time::Duration::from_secs(self.config.controllers.canary_interval_secs);
        let canary_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            strategy_engine.run(canary_interval, canary_cancel).await;
        }));

        info!("orchestrator started");
        tasks
    }

    /// A strategy engine over this context's collaborators, for operator
    /// calls (switch, rollback, canary control).
    #[must_use]
    pub fn strategy_engine(&self) -> StrategyEngine {
        StrategyEngine::new(
            Arc::clone(&self.stores.strategies),
            Arc::clone(&self.stores.scaling),
            Arc::clone(&self.gateway),
            Arc::clone(&self.metrics),
        )
    }

    /// An autoscale controller over this context's collaborators, for
    /// operator or API driven evaluation.
    #[must_use]
    pub fn autoscale_controller(&self) -> AutoscaleController {
        AutoscaleController::new(
            Arc::clone(&self.stores.scaling),
            Arc::clone(&self.gateway),
            Arc::clone(&self.metrics),
        )
    }
}

fn spawn_pool<P: Clone + Send + Sync + 'static>(
    queue: Arc<Queue<P>>,
    handler: Arc<dyn meridian_queue::JobHandler<P>>,
    config: &PoolConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut consumer = ConsumerConfig::new(config.concurrency);
    if let Some(limit) = NonZeroU32::new(config.jobs_per_minute) {
        consumer = consumer.jobs_per_minute(limit);
    }
    let pool = ConsumerPool::new(queue, handler, consumer);
    tokio::spawn(async move {
        pool.run(cancel).await;
    })
}

fn parse_image(image: &str) -> DockerSource {
    // A colon in the last path segment separates the tag; a colon earlier is
    // a registry port.
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => DockerSource {
            image: name.to_owned(),
            tag: tag.to_owned(),
        },
        _ => DockerSource {
            image: image.to_owned(),
            tag: "latest".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use meridian_proto::{HealthCheckSpec, ResourceSpec, ServiceId};
    use meridian_store::DeploymentStatus;

    use crate::agent::ChannelAgentGateway;
    use crate::metrics::StaticMetrics;

    fn context() -> OrchestratorContext {
        OrchestratorContext::new(
            OrchestratorConfig::default(),
            Stores::in_memory(),
            Arc::new(ChannelAgentGateway::new()),
            Arc::new(StaticMetrics::new()),
        )
    }

    fn git_service() -> ServiceSpec {
        ServiceSpec {
            id: ServiceId::new("svc-1"),
            name: "api".to_owned(),
            kind: "web".to_owned(),
            source_type: SourceType::Git,
            docker_image: None,
            dockerfile_path: "Dockerfile".to_owned(),
            port: 8080,
            replicas: 2,
            health_check: HealthCheckSpec::default(),
            env_vars: BTreeMap::new(),
            resources: ResourceSpec::default(),
        }
    }

    fn image_service() -> ServiceSpec {
        ServiceSpec {
            source_type: SourceType::DockerImage,
            docker_image: Some("registry.example.com:5000/api:v3".to_owned()),
            ..git_service()
        }
    }

    fn git_source() -> GitSource {
        GitSource {
            repo_url: "https://git.example.com/app.git".to_owned(),
            branch: "main".to_owned(),
            commit_sha: "abc123".to_owned(),
        }
    }

    #[tokio::test]
    async fn git_trigger_enqueues_build_job() {
        let context = context();
        let id = context
            .trigger_deployment(
                git_service(),
                ServerId::new("srv-1"),
                Some(git_source()),
                TriggerType::Webhook,
            )
            .await
            .unwrap();

        let deployment = context.stores.deployments.get(&id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);
        assert_eq!(deployment.git_ref.as_deref(), Some("abc123"));

        let job = context.build_queue.try_next().await.expect("build job");
        assert_eq!(job.payload.deployment_id, id);
        assert_eq!(job.dedup_key.as_deref(), Some(format!("build-{id}").as_str()));
        assert!(context.deploy_queue.try_next().await.is_none());
    }

    #[tokio::test]
    async fn image_trigger_goes_straight_to_deploy() {
        let context = context();
        let id = context
            .trigger_deployment(
                image_service(),
                ServerId::new("srv-1"),
                None,
                TriggerType::Api,
            )
            .await
            .unwrap();

        let job = context.deploy_queue.try_next().await.expect("deploy job");
        assert_eq!(job.payload.deployment_id, id);
        let docker = job.payload.docker.expect("docker source");
        assert_eq!(docker.image, "registry.example.com:5000/api");
        assert_eq!(docker.tag, "v3");
        assert!(context.build_queue.try_next().await.is_none());
    }

    #[tokio::test]
    async fn resubmitted_build_job_coalesces_on_dedup_key() {
        let context = context();
        let id = context
            .trigger_deployment(
                git_service(),
                ServerId::new("srv-1"),
                Some(git_source()),
                TriggerType::Webhook,
            )
            .await
            .unwrap();

        // A retriggered build for the same deployment coalesces into the
        // waiting job instead of duplicating it.
        let data = BuildJobData {
            deployment_id: id.clone(),
            server_id: ServerId::new("srv-1"),
            service: git_service(),
            git: git_source(),
            build_args: Default::default(),
            trigger: TriggerType::Webhook,
        };
        let dedup_key = data.dedup_key();
        context
            .build_queue
            .enqueue(data, EnqueueOptions::default().dedup_key(dedup_key))
            .await
            .unwrap();

        let stats = context.build_queue.stats().await;
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn rollback_creates_new_deployment_from_source_image() {
        let context = context();
        let original = context
            .trigger_deployment(
                image_service(),
                ServerId::new("srv-1"),
                None,
                TriggerType::Api,
            )
            .await
            .unwrap();
        // Drain the original's deploy job.
        context.deploy_queue.try_next().await.unwrap();

        let rollback = context
            .trigger_rollback(image_service(), ServerId::new("srv-1"), &original)
            .await
            .unwrap();
        assert_ne!(rollback, original);

        let record = context
            .stores
            .deployments
            .get(&rollback)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.trigger, TriggerType::Rollback);
        assert_eq!(record.rollback_from, Some(original.clone()));
        assert_eq!(
            record.image_ref.as_deref(),
            Some("registry.example.com:5000/api:v3")
        );

        // The source deployment itself is untouched.
        let source = context
            .stores
            .deployments
            .get(&original)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_requires_a_source_image() {
        let context = context();
        let original = context
            .trigger_deployment(
                git_service(),
                ServerId::new("srv-1"),
                Some(git_source()),
                TriggerType::Webhook,
            )
            .await
            .unwrap();

        // Build never ran, so there is no image yet.
        let err = context
            .trigger_rollback(git_service(), ServerId::new("srv-1"), &original)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn image_parsing_handles_registry_ports() {
        let parsed = parse_image("registry.local:5000/app");
        assert_eq!(parsed.image, "registry.local:5000/app");
        assert_eq!(parsed.tag, "latest");

        let parsed = parse_image("registry.local:5000/app:v2");
        assert_eq!(parsed.image, "registry.local:5000/app");
        assert_eq!(parsed.tag, "v2");

        let parsed = parse_image("app");
        assert_eq!(parsed.image, "app");
        assert_eq!(parsed.tag, "latest");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_shutdown() {
        struct NoopExecutor;

        #[async_trait::async_trait]
        impl BuildExecutor for NoopExecutor {
            async fn clone_source(
                &self,
                _git: &GitSource,
                _workspace: &std::path::Path,
            ) -> Result<Vec<String>, crate::workers::StepFailure> {
                Ok(Vec::new())
            }

            async fn build_image(
                &self,
                _workspace: &std::path::Path,
                _dockerfile: &str,
                _image: &str,
                _build_args: &BTreeMap<String, String>,
            ) -> Result<Vec<String>, crate::workers::StepFailure> {
                Ok(Vec::new())
            }

            async fn push_image(
                &self,
                _image: &str,
            ) -> Result<Vec<String>, crate::workers::StepFailure> {
                Ok(Vec::new())
            }
        }

        let context = context();
        let cancel = CancellationToken::new();
        let tasks = context.start(Arc::new(NoopExecutor), Vec::new(), &cancel);
        assert_eq!(tasks.len(), 7);

        cancel.cancel();
        for task in tasks {
            tokio::time::timeout(std::time::Duration::from_secs(5), task)
                .await
                .expect("task stops")
                .expect("task does not panic");
        }
    }
}
