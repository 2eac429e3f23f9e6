//! Storage traits.
//!
//! Each trait is the seam to the relational backend that owns the schema;
//! handlers and controllers only ever see these interfaces. All mutating
//! operations are keyed by entity id, never by job id, so re-delivered jobs
//! stay idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meridian_proto::{DeploymentId, MonitorId, RuleId, ServerId, ServiceId};

use crate::alert::{Alert, AlertRule};
use crate::deployment::{Deployment, DeploymentStatus};
use crate::error::StoreResult;
use crate::scaling::{AutoScalingRule, ScaleDirection, ScalingEvent};
use crate::strategy::ServiceStrategy;
use crate::uptime::{ProbeStatus, UptimeCheck, UptimeMonitor};

/// Persistence for deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment.
    ///
    /// Fails if a deployment with the same id already exists.
    async fn insert(&self, deployment: &Deployment) -> StoreResult<()>;

    /// Get a deployment by id.
    async fn get(&self, id: &DeploymentId) -> StoreResult<Option<Deployment>>;

    /// Apply a status transition, enforcing the state machine and stamping
    /// phase timestamps. `error` is truncated and preserved on the record.
    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> StoreResult<()>;

    /// Record the image produced by a build.
    async fn set_image_ref(&self, id: &DeploymentId, image_ref: &str) -> StoreResult<()>;

    /// Append build log lines, visible to readers while the build runs.
    async fn append_build_logs(&self, id: &DeploymentId, lines: &[String]) -> StoreResult<()>;

    /// Append rollout log lines reported by the agent.
    async fn append_deploy_logs(&self, id: &DeploymentId, lines: &[String]) -> StoreResult<()>;

    /// Read build logs from an offset cursor.
    ///
    /// Returns the new lines and the next offset, or `None` for an unknown
    /// deployment.
    async fn build_logs(
        &self,
        id: &DeploymentId,
        offset: usize,
    ) -> StoreResult<Option<(Vec<String>, usize)>>;

    /// Read rollout logs from an offset cursor.
    async fn deploy_logs(
        &self,
        id: &DeploymentId,
        offset: usize,
    ) -> StoreResult<Option<(Vec<String>, usize)>>;

    /// List a service's deployments, newest first.
    async fn list_for_service(
        &self,
        service_id: &ServiceId,
        limit: usize,
    ) -> StoreResult<Vec<Deployment>>;
}

/// Persistence for per-service rollout strategies (1:1 with services).
#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// Get the strategy for a service.
    async fn get(&self, service_id: &ServiceId) -> StoreResult<Option<ServiceStrategy>>;

    /// Insert or replace the strategy for a service.
    async fn upsert(&self, strategy: &ServiceStrategy) -> StoreResult<()>;

    /// All configured strategies.
    async fn list(&self) -> StoreResult<Vec<ServiceStrategy>>;
}

/// Persistence for autoscaling rules, replica counts, and the audit trail.
#[async_trait]
pub trait ScalingStore: Send + Sync {
    /// Rules attached to a service, in rule order.
    async fn rules_for_service(&self, service_id: &ServiceId)
        -> StoreResult<Vec<AutoScalingRule>>;

    /// Services that have at least one enabled rule.
    async fn services_with_rules(&self) -> StoreResult<Vec<ServiceId>>;

    /// Insert or replace a rule.
    async fn upsert_rule(&self, rule: &AutoScalingRule) -> StoreResult<()>;

    /// Stamp a rule's last firing.
    async fn mark_rule_fired(
        &self,
        rule_id: &RuleId,
        direction: ScaleDirection,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Current replica count for a service.
    async fn current_replicas(&self, service_id: &ServiceId) -> StoreResult<u32>;

    /// Persist a new replica count.
    async fn set_replicas(&self, service_id: &ServiceId, replicas: u32) -> StoreResult<()>;

    /// The server a service is placed on, if known.
    async fn server_for_service(&self, service_id: &ServiceId) -> StoreResult<Option<ServerId>>;

    /// Record a service's placement.
    async fn set_service_server(
        &self,
        service_id: &ServiceId,
        server_id: &ServerId,
    ) -> StoreResult<()>;

    /// Append an immutable scaling event.
    async fn record_event(&self, event: &ScalingEvent) -> StoreResult<()>;

    /// A service's scaling events, newest first.
    async fn events_for_service(
        &self,
        service_id: &ServiceId,
        limit: usize,
    ) -> StoreResult<Vec<ScalingEvent>>;
}

/// Persistence for uptime monitors and probe results.
#[async_trait]
pub trait UptimeStore: Send + Sync {
    /// Enabled monitors due for a probe at `now`.
    async fn due_monitors(&self, now: DateTime<Utc>) -> StoreResult<Vec<UptimeMonitor>>;

    /// Get a monitor by id.
    async fn get_monitor(&self, id: &MonitorId) -> StoreResult<Option<UptimeMonitor>>;

    /// Insert or replace a monitor.
    async fn upsert_monitor(&self, monitor: &UptimeMonitor) -> StoreResult<()>;

    /// Update a monitor's rolling probe state.
    async fn update_probe_state(
        &self,
        id: &MonitorId,
        status: ProbeStatus,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Append an immutable probe result.
    async fn record_check(&self, check: &UptimeCheck) -> StoreResult<()>;

    /// A monitor's probe results, newest first.
    async fn checks_for_monitor(
        &self,
        id: &MonitorId,
        limit: usize,
    ) -> StoreResult<Vec<UptimeCheck>>;
}

/// Persistence for alert rules and fired alerts.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// All enabled alert rules.
    async fn enabled_rules(&self) -> StoreResult<Vec<AlertRule>>;

    /// Insert or replace a rule.
    async fn upsert_rule(&self, rule: &AlertRule) -> StoreResult<()>;

    /// Stamp a rule's last firing.
    async fn mark_rule_triggered(&self, rule_id: &RuleId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Insert a fired alert.
    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()>;

    /// All alerts still in the active status.
    async fn active_alerts(&self) -> StoreResult<Vec<Alert>>;
}
