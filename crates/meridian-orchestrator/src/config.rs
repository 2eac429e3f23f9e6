//! Configuration for the orchestrator.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Top-level configuration for the orchestrator service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrchestratorConfig {
    /// Worker pool tuning per queue.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Build worker configuration.
    #[serde(default)]
    pub build: BuildConfig,

    /// Notification sink endpoints.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Control loop intervals.
    #[serde(default)]
    pub controllers: ControllerConfig,
}

impl OrchestratorConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override
    /// earlier):
    /// 1. Default values
    /// 2. `meridian.toml` in the current directory (if present)
    /// 3. Environment variables with `MERIDIAN_` prefix
    pub fn load() -> OrchestratorResult<Self> {
        Figment::new()
            .merge(Toml::file("meridian.toml"))
            .merge(Env::prefixed("MERIDIAN_").split("__"))
            .extract()
            .map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> OrchestratorResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MERIDIAN_").split("__"))
            .extract()
            .map_err(|e| OrchestratorError::Config(e.to_string()))
    }
}

/// Tuning for one worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Concurrent worker tasks.
    pub concurrency: usize,
    /// Cap on job starts per minute.
    pub jobs_per_minute: u32,
    /// Delivery attempts before a job is failed-terminal.
    pub max_attempts: u32,
}

/// Worker pool tuning per queue.
///
/// Builds are CPU/IO heavy and kept small; deploys are bounded to avoid
/// saturating agent connections; notification sends are network-bound and
/// independent, so that pool runs wide.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Build queue pool.
    #[serde(default = "default_build_pool")]
    pub build: PoolConfig,
    /// Deploy queue pool.
    #[serde(default = "default_deploy_pool")]
    pub deploy: PoolConfig,
    /// Notification queue pool.
    #[serde(default = "default_notify_pool")]
    pub notify: PoolConfig,
}

fn default_build_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 2,
        jobs_per_minute: 10,
        max_attempts: 2,
    }
}

fn default_deploy_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 5,
        jobs_per_minute: 30,
        max_attempts: 2,
    }
}

fn default_notify_pool() -> PoolConfig {
    PoolConfig {
        concurrency: 10,
        jobs_per_minute: 120,
        max_attempts: 3,
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            build: default_build_pool(),
            deploy: default_deploy_pool(),
            notify: default_notify_pool(),
        }
    }
}

/// Build worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Directory ephemeral build workspaces are created under.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Registry prefix pushed images are tagged with.
    #[serde(default = "default_registry")]
    pub registry: String,

    /// How many trailing log lines are preserved in a failure message.
    #[serde(default = "default_error_log_lines")]
    pub error_log_lines: usize,

    /// Hard timeout for a whole build in seconds.
    #[serde(default = "default_build_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/meridian/builds")
}

fn default_registry() -> String {
    "registry.local/meridian".to_owned()
}

const fn default_error_log_lines() -> usize {
    20
}

const fn default_build_timeout_secs() -> u64 {
    900
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            registry: default_registry(),
            error_log_lines: default_error_log_lines(),
            timeout_secs: default_build_timeout_secs(),
        }
    }
}

/// Notification sink endpoints.
///
/// All sinks are best-effort and optional; a channel with no endpoint
/// configured reports a send failure rather than silently succeeding.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationConfig {
    /// Chat webhook URL (severity-colored embed layout).
    pub chat_webhook_url: Option<String>,

    /// Generic webhook URL.
    pub webhook_url: Option<String>,

    /// HTTP relay endpoint that accepts rendered emails.
    pub email_endpoint: Option<String>,

    /// From address for emails.
    #[serde(default = "default_email_from")]
    pub email_from: String,

    /// Default recipients when a job names none.
    #[serde(default)]
    pub default_recipients: Vec<String>,
}

fn default_email_from() -> String {
    "meridian@localhost".to_owned()
}

/// Control loop intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between alert rule sweeps.
    #[serde(default = "default_alert_interval_secs")]
    pub alert_interval_secs: u64,

    /// Seconds between uptime scheduler ticks.
    #[serde(default = "default_uptime_tick_secs")]
    pub uptime_tick_secs: u64,

    /// Seconds between autoscaling evaluations.
    #[serde(default = "default_autoscale_interval_secs")]
    pub autoscale_interval_secs: u64,

    /// Seconds between canary auto-promotion evaluations.
    #[serde(default = "default_canary_interval_secs")]
    pub canary_interval_secs: u64,
}

const fn default_alert_interval_secs() -> u64 {
    60
}

const fn default_uptime_tick_secs() -> u64 {
    5
}

const fn default_autoscale_interval_secs() -> u64 {
    30
}

const fn default_canary_interval_secs() -> u64 {
    60
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            alert_interval_secs: default_alert_interval_secs(),
            uptime_tick_secs: default_uptime_tick_secs(),
            autoscale_interval_secs: default_autoscale_interval_secs(),
            canary_interval_secs: default_canary_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queues.build.concurrency, 2);
        assert_eq!(config.queues.deploy.concurrency, 5);
        assert_eq!(config.queues.notify.concurrency, 10);
        assert_eq!(config.controllers.alert_interval_secs, 60);
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [queues.build]
            concurrency = 4
            jobs_per_minute = 20
            max_attempts = 1

            [build]
            registry = "registry.example.com/apps"

            [notifications]
            chat_webhook_url = "https://chat.example.com/hook"

            [controllers]
            alert_interval_secs = 30
        "#;

        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queues.build.concurrency, 4);
        assert_eq!(config.queues.deploy.concurrency, 5);
        assert_eq!(config.build.registry, "registry.example.com/apps");
        assert_eq!(
            config.notifications.chat_webhook_url.as_deref(),
            Some("https://chat.example.com/hook")
        );
        assert_eq!(config.controllers.alert_interval_secs, 30);
    }
}
