//! Build worker: clone, build image, push, chain a deploy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{error, info, warn};

use meridian_proto::{DockerSource, GitSource};
use meridian_queue::{EnqueueOptions, HandlerError, Job, JobHandler, Queue};
use meridian_store::{truncate_error, ChannelKind, DeploymentStatus, DeploymentStore, Severity};

use crate::config::BuildConfig;
use crate::jobs::{BuildJobData, DeployJobData, NotificationType, NotifyJobData};

/// A failed build step: the output produced so far plus a description.
#[derive(Debug)]
pub struct StepFailure {
    /// Log lines the step emitted before failing.
    pub lines: Vec<String>,
    /// What went wrong.
    pub message: String,
}

impl StepFailure {
    /// A failure with no captured output.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            message: message.into(),
        }
    }
}

/// Executes the opaque build steps.
///
/// The process-backed implementation shells out to `git` and `docker`; tests
/// substitute a mock. Every method returns the log lines the step produced.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Clone the revision into the workspace.
    async fn clone_source(
        &self,
        git: &GitSource,
        workspace: &Path,
    ) -> Result<Vec<String>, StepFailure>;

    /// Build the image from the workspace.
    async fn build_image(
        &self,
        workspace: &Path,
        dockerfile: &str,
        image: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, StepFailure>;

    /// Push the image to the registry.
    async fn push_image(&self, image: &str) -> Result<Vec<String>, StepFailure>;
}

/// [`BuildExecutor`] that shells out to `git` and `docker`.
#[derive(Debug, Default)]
pub struct ProcessBuildExecutor;

impl ProcessBuildExecutor {
    async fn run(mut command: Command, what: &str) -> Result<Vec<String>, StepFailure> {
        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepFailure::new(format!("failed to spawn {what}: {e}")))?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(ToOwned::to_owned)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(ToOwned::to_owned),
        );

        if output.status.success() {
            Ok(lines)
        } else {
            Err(StepFailure {
                message: format!("{what} exited with {}", output.status),
                lines,
            })
        }
    }
}

#[async_trait]
impl BuildExecutor for ProcessBuildExecutor {
    async fn clone_source(
        &self,
        git: &GitSource,
        workspace: &Path,
    ) -> Result<Vec<String>, StepFailure> {
        let mut clone = Command::new("git");
        clone
            .arg("clone")
            .arg("--branch")
            .arg(&git.branch)
            .arg(&git.repo_url)
            .arg(workspace);
        let mut lines = Self::run(clone, "git clone").await?;

        let mut checkout = Command::new("git");
        checkout
            .arg("-C")
            .arg(workspace)
            .arg("checkout")
            .arg(&git.commit_sha);
        lines.extend(Self::run(checkout, "git checkout").await?);
        Ok(lines)
    }

    async fn build_image(
        &self,
        workspace: &Path,
        dockerfile: &str,
        image: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, StepFailure> {
        let mut build = Command::new("docker");
        build
            .arg("build")
            .arg("-f")
            .arg(workspace.join(dockerfile))
            .arg("-t")
            .arg(image);
        for (key, value) in build_args {
            build.arg("--build-arg").arg(format!("{key}={value}"));
        }
        build.arg(workspace);
        Self::run(build, "docker build").await
    }

    async fn push_image(&self, image: &str) -> Result<Vec<String>, StepFailure> {
        let mut push = Command::new("docker");
        push.arg("push").arg(image);
        Self::run(push, "docker push").await
    }
}

/// Handles build jobs: clone, image build, registry push, chained deploy.
pub struct BuildWorker {
    store: Arc<dyn DeploymentStore>,
    executor: Arc<dyn BuildExecutor>,
    deploy_queue: Arc<Queue<DeployJobData>>,
    notify_queue: Arc<Queue<NotifyJobData>>,
    config: BuildConfig,
    deploy_max_attempts: u32,
}

impl BuildWorker {
    /// Create a build worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        executor: Arc<dyn BuildExecutor>,
        deploy_queue: Arc<Queue<DeployJobData>>,
        notify_queue: Arc<Queue<NotifyJobData>>,
        config: BuildConfig,
        deploy_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            executor,
            deploy_queue,
            notify_queue,
            config,
            deploy_max_attempts,
        }
    }

    fn workspace_for(&self, data: &BuildJobData) -> PathBuf {
        self.config.workspace_root.join(data.deployment_id.as_str())
    }

    async fn append_log(&self, data: &BuildJobData, lines: &[String]) {
        let stamped: Vec<String> = lines
            .iter()
            .map(|line| format!("[{}] {line}", Utc::now().to_rfc3339()))
            .collect();
        if let Err(e) = self
            .store
            .append_build_logs(&data.deployment_id, &stamped)
            .await
        {
            warn!(deployment_id = %data.deployment_id, error = %e, "failed to append build logs");
        }
    }

    /// Run the build steps. The caller owns workspace cleanup.
    async fn execute(&self, data: &BuildJobData, workspace: &Path) -> Result<String, String> {
        let git = &data.git;
        self.append_log(
            data,
            &[format!(
                "cloning {} @ {} (branch {})",
                git.repo_url, git.commit_sha, git.branch
            )],
        )
        .await;

        match self.executor.clone_source(git, workspace).await {
            Ok(lines) => self.append_log(data, &lines).await,
            Err(failure) => {
                self.append_log(data, &failure.lines).await;
                return Err(format!("clone failed: {}", failure.message));
            }
        }

        let dockerfile = &data.service.dockerfile_path;
        if !workspace.join(dockerfile).exists() {
            return Err(format!("Dockerfile not found at {dockerfile}"));
        }

        let short_sha = &git.commit_sha[..git.commit_sha.len().min(12)];
        let image = format!("{}/{}:{}", self.config.registry, data.service.name, short_sha);

        self.append_log(data, &[format!("building image {image}")])
            .await;
        match self
            .executor
            .build_image(workspace, dockerfile, &image, &data.build_args)
            .await
        {
            Ok(lines) => self.append_log(data, &lines).await,
            Err(failure) => {
                self.append_log(data, &failure.lines).await;
                return Err(format!("image build failed: {}", failure.message));
            }
        }

        self.append_log(data, &[format!("pushing image {image}")])
            .await;
        match self.executor.push_image(&image).await {
            Ok(lines) => self.append_log(data, &lines).await,
            Err(failure) => {
                self.append_log(data, &failure.lines).await;
                return Err(format!("image push failed: {}", failure.message));
            }
        }

        Ok(image)
    }

    async fn remove_workspace(&self, workspace: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %workspace.display(), error = %e, "failed to remove build workspace");
            }
        }
    }

    async fn chain_deploy(&self, data: &BuildJobData, image: &str) -> Result<(), HandlerError> {
        let (name, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        let deploy = DeployJobData {
            deployment_id: data.deployment_id.clone(),
            server_id: data.server_id.clone(),
            service: data.service.clone(),
            git: Some(data.git.clone()),
            docker: Some(DockerSource {
                image: name.to_owned(),
                tag: tag.to_owned(),
            }),
            trigger: data.trigger,
        };
        let dedup_key = deploy.dedup_key();
        self.deploy_queue
            .enqueue(
                deploy,
                EnqueueOptions::with_max_attempts(self.deploy_max_attempts).dedup_key(dedup_key),
            )
            .await
            .map_err(|e| {
                if e.is_retriable() {
                    HandlerError::retriable(format!("failed to chain deploy job: {e}"))
                } else {
                    HandlerError::terminal(format!("failed to chain deploy job: {e}"))
                }
            })?;
        Ok(())
    }

    async fn notify(&self, data: &BuildJobData, notification: NotificationType, message: String) {
        let severity = match notification {
            NotificationType::DeploymentFailed => Severity::Critical,
            _ => Severity::Info,
        };
        let payload = NotifyJobData::new(
            notification,
            message,
            severity,
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

    async fn fail_deployment(&self, data: &BuildJobData, message: &str) {
        let truncated = truncate_error(message, self.config.error_log_lines);
        if let Err(e) = self
            .store
            .update_status(
                &data.deployment_id,
                DeploymentStatus::Failed,
                Some(&truncated),
            )
            .await
        {
            error!(deployment_id = %data.deployment_id, error = %e, "failed to mark deployment failed");
        }
        self.notify(
            data,
            NotificationType::DeploymentFailed,
            format!("Build for {} failed: {truncated}", data.service.name),
        )
        .await;
    }
}

#[async_trait]
impl JobHandler<BuildJobData> for BuildWorker {
    async fn handle(&self, job: &Job<BuildJobData>) -> Result<(), HandlerError> {
        let data = &job.payload;

        let deployment = self
            .store
            .get(&data.deployment_id)
            .await
            .map_err(|e| HandlerError::retriable(e.to_string()))?
            .ok_or_else(|| {
                HandlerError::terminal(format!("deployment {} not found", data.deployment_id))
            })?;

        // Re-delivery of a finished job is a no-op.
        if deployment.status.is_terminal() {
            info!(deployment_id = %data.deployment_id, status = %deployment.status, "skipping build for terminal deployment");
            return Ok(());
        }

        if deployment.status == DeploymentStatus::Pending {
            self.store
                .update_status(&data.deployment_id, DeploymentStatus::Building, None)
                .await
                .map_err(|e| HandlerError::retriable(e.to_string()))?;
        }

        info!(
            deployment_id = %data.deployment_id,
            service = %data.service.name,
            commit = %data.git.commit_sha,
            "starting build"
        );

        // The workspace is scoped to this job: allocated here, removed on
        // every exit path below.
        let workspace = self.workspace_for(data);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            let message = format!("failed to create build workspace: {e}");
            self.fail_deployment(data, &message).await;
            return Err(HandlerError::terminal(message));
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = match tokio::time::timeout(timeout, self.execute(data, &workspace)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "build timed out after {}s",
                self.config.timeout_secs
            )),
        };

        self.remove_workspace(&workspace).await;

        match result {
            Ok(image) => {
                self.store
                    .set_image_ref(&data.deployment_id, &image)
                    .await
                    .map_err(|e| HandlerError::retriable(e.to_string()))?;

                info!(deployment_id = %data.deployment_id, image = %image, "build completed");
                self.chain_deploy(data, &image).await?;
                self.notify(
                    data,
                    NotificationType::DeploymentStarted,
                    format!(
                        "Deployment {} for {} built image {image}",
                        data.deployment_id, data.service.name
                    ),
                )
                .await;
                Ok(())
            }
            Err(message) => {
                error!(deployment_id = %data.deployment_id, error = %message, "build failed");
                self.fail_deployment(data, &message).await;
                Err(HandlerError::terminal(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use meridian_proto::{
        DeploymentId, HealthCheckSpec, ResourceSpec, ServerId, ServiceId, ServiceSpec, SourceType,
    };
    use meridian_queue::QueueConfig;
    use meridian_store::{Deployment, MemoryStore, TriggerType};

    /// Executor that "clones" by creating files and fails on request.
    struct FakeExecutor {
        dockerfile: bool,
        fail_build: bool,
        fail_push: bool,
        pushed: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn happy() -> Self {
            Self {
                dockerfile: true,
                fail_build: false,
                fail_push: false,
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BuildExecutor for FakeExecutor {
        async fn clone_source(
            &self,
            _git: &GitSource,
            workspace: &Path,
        ) -> Result<Vec<String>, StepFailure> {
            if self.dockerfile {
                std::fs::write(workspace.join("Dockerfile"), "FROM scratch").unwrap();
            }
            Ok(vec!["Cloning into workspace...".to_owned()])
        }

        async fn build_image(
            &self,
            _workspace: &Path,
            _dockerfile: &str,
            _image: &str,
            _build_args: &BTreeMap<String, String>,
        ) -> Result<Vec<String>, StepFailure> {
            if self.fail_build {
                Err(StepFailure {
                    lines: vec!["Step 3/7 : RUN make".to_owned(), "error: exit 2".to_owned()],
                    message: "docker build exited with exit status: 1".to_owned(),
                })
            } else {
                Ok(vec!["Successfully built abc123".to_owned()])
            }
        }

        async fn push_image(&self, image: &str) -> Result<Vec<String>, StepFailure> {
            if self.fail_push {
                Err(StepFailure::new("registry unavailable"))
            } else {
                self.pushed.lock().unwrap().push(image.to_owned());
                Ok(vec![format!("pushed {image}")])
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        deploy_queue: Arc<Queue<DeployJobData>>,
        notify_queue: Arc<Queue<NotifyJobData>>,
        worker: BuildWorker,
        workspace_root: PathBuf,
    }

    fn fixture(executor: FakeExecutor) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let deploy_queue = Arc::new(Queue::new(QueueConfig::new("deploy")));
        let notify_queue = Arc::new(Queue::new(QueueConfig::new("notify")));
        let workspace_root = std::env::temp_dir().join(format!(
            "meridian-build-test-{}",
            ulid::Ulid::new().to_string().to_lowercase()
        ));
        let config = BuildConfig {
            workspace_root: workspace_root.clone(),
            registry: "registry.test/apps".to_owned(),
            error_log_lines: 5,
            timeout_secs: 30,
        };
        let worker = BuildWorker::new(
            Arc::clone(&store) as Arc<dyn DeploymentStore>,
            Arc::new(executor),
            Arc::clone(&deploy_queue),
            Arc::clone(&notify_queue),
            config,
            2,
        );
        Fixture {
            store,
            deploy_queue,
            notify_queue,
            worker,
            workspace_root,
        }
    }

    fn test_service() -> ServiceSpec {
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

    async fn seeded_job(fixture: &Fixture) -> Job<BuildJobData> {
        let deployment = Deployment::new(
            ServiceId::new("svc-1"),
            ServerId::new("srv-1"),
            TriggerType::Manual,
        )
        .with_git_ref("main");
        let deployment_id = deployment.id.clone();
        fixture.store.insert(&deployment).await.unwrap();

        let data = BuildJobData {
            deployment_id,
            server_id: ServerId::new("srv-1"),
            service: test_service(),
            git: GitSource {
                repo_url: "https://git.example.com/app.git".to_owned(),
                branch: "main".to_owned(),
                commit_sha: "0123456789abcdef0123".to_owned(),
            },
            build_args: BTreeMap::new(),
            trigger: TriggerType::Manual,
        };

        Job {
            id: meridian_queue::JobId::generate(),
            payload: data,
            priority: 0,
            attempts: 1,
            max_attempts: 2,
            dedup_key: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn successful_build_chains_deploy_and_cleans_workspace() {
        let fixture = fixture(FakeExecutor::happy());
        let job = seeded_job(&fixture).await;
        let deployment_id = job.payload.deployment_id.clone();

        fixture.worker.handle(&job).await.unwrap();

        let deployment = fixture.store.get(&deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Building);
        assert_eq!(
            deployment.image_ref.as_deref(),
            Some("registry.test/apps/api:0123456789ab")
        );
        assert!(deployment.build_started_at.is_some());
        assert!(!deployment.build_logs.is_empty());

        // Chained deploy job carries the built image.
        let chained = fixture.deploy_queue.try_next().await.expect("deploy job");
        assert_eq!(chained.payload.deployment_id, deployment_id);
        let docker = chained.payload.docker.expect("docker source");
        assert_eq!(docker.tag, "0123456789ab");

        // deployment_started notification enqueued.
        let notify = fixture.notify_queue.try_next().await.expect("notify job");
        assert_eq!(
            notify.payload.notification,
            NotificationType::DeploymentStarted
        );

        assert!(!fixture
            .workspace_root
            .join(deployment_id.as_str())
            .exists());
    }

    #[tokio::test]
    async fn missing_dockerfile_fails_with_cleanup() {
        let fixture = fixture(FakeExecutor {
            dockerfile: false,
            ..FakeExecutor::happy()
        });
        let job = seeded_job(&fixture).await;
        let deployment_id = job.payload.deployment_id.clone();

        let err = fixture.worker.handle(&job).await.unwrap_err();
        assert!(err.message.contains("Dockerfile not found"));
        assert!(!err.retriable);

        let deployment = fixture.store.get(&deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment
            .error_message
            .as_deref()
            .unwrap()
            .contains("Dockerfile not found"));

        // Failure notification, no chained deploy, no leftover workspace.
        let notify = fixture.notify_queue.try_next().await.expect("notify job");
        assert_eq!(
            notify.payload.notification,
            NotificationType::DeploymentFailed
        );
        assert!(fixture.deploy_queue.try_next().await.is_none());
        assert!(!fixture
            .workspace_root
            .join(deployment_id.as_str())
            .exists());
    }

    #[tokio::test]
    async fn build_command_failure_preserves_log_tail() {
        let fixture = fixture(FakeExecutor {
            fail_build: true,
            ..FakeExecutor::happy()
        });
        let job = seeded_job(&fixture).await;
        let deployment_id = job.payload.deployment_id.clone();

        fixture.worker.handle(&job).await.unwrap_err();

        let deployment = fixture.store.get(&deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment
            .error_message
            .as_deref()
            .unwrap()
            .contains("image build failed"));
        // The failing step's output landed in the build logs.
        assert!(deployment
            .build_logs
            .iter()
            .any(|line| line.contains("Step 3/7")));
        assert!(!fixture
            .workspace_root
            .join(deployment_id.as_str())
            .exists());
    }

    #[tokio::test]
    async fn push_failure_fails_deployment_and_cleans_workspace() {
        let fixture = fixture(FakeExecutor {
            fail_push: true,
            ..FakeExecutor::happy()
        });
        let job = seeded_job(&fixture).await;
        let deployment_id = job.payload.deployment_id.clone();

        fixture.worker.handle(&job).await.unwrap_err();

        let deployment = fixture.store.get(&deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(!fixture
            .workspace_root
            .join(deployment_id.as_str())
            .exists());
    }

    #[tokio::test]
    async fn redelivery_after_terminal_status_is_noop() {
        let fixture = fixture(FakeExecutor::happy());
        let job = seeded_job(&fixture).await;
        let deployment_id = job.payload.deployment_id.clone();

        fixture
            .store
            .update_status(&deployment_id, DeploymentStatus::Cancelled, None)
            .await
            .unwrap();

        fixture.worker.handle(&job).await.unwrap();
        assert!(fixture.deploy_queue.try_next().await.is_none());
    }
}
