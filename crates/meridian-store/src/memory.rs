//! In-memory store used by tests and embedded deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meridian_proto::{DeploymentId, MonitorId, RuleId, ServerId, ServiceId};

use crate::alert::{Alert, AlertRule, AlertStatus};
use crate::deployment::{Deployment, DeploymentStatus};
use crate::error::{StoreError, StoreResult};
use crate::scaling::{AutoScalingRule, ScaleDirection, ScalingEvent};
use crate::strategy::ServiceStrategy;
use crate::traits::{AlertStore, DeploymentStore, ScalingStore, StrategyStore, UptimeStore};
use crate::uptime::{ProbeStatus, UptimeCheck, UptimeMonitor};

/// In-memory implementation of every store trait.
///
/// Data is lost when the process exits; production deployments put the
/// relational backend behind the same traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, Deployment>>,
    strategies: RwLock<HashMap<String, ServiceStrategy>>,
    scaling_rules: RwLock<Vec<AutoScalingRule>>,
    replicas: RwLock<HashMap<String, u32>>,
    placements: RwLock<HashMap<String, ServerId>>,
    scaling_events: RwLock<Vec<ScalingEvent>>,
    monitors: RwLock<HashMap<String, UptimeMonitor>>,
    checks: RwLock<Vec<UptimeCheck>>,
    alert_rules: RwLock<Vec<AlertRule>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(lock: &RwLock<T>) -> StoreResult<std::sync::RwLockReadGuard<'_, T>> {
        lock.read().map_err(|_| StoreError::internal("lock poisoned"))
    }

    fn write<T>(lock: &RwLock<T>) -> StoreResult<std::sync::RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|_| StoreError::internal("lock poisoned"))
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, deployment: &Deployment) -> StoreResult<()> {
        let mut deployments = Self::write(&self.deployments)?;
        let key = deployment.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(StoreError::internal(format!(
                "deployment {key} already exists"
            )));
        }
        deployments.insert(key, deployment.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> StoreResult<Option<Deployment>> {
        Ok(Self::read(&self.deployments)?.get(id.as_str()).cloned())
    }

    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut deployments = Self::write(&self.deployments)?;
        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::not_found("deployment", id.as_str()))?;
        deployment.apply_status(status, error, Utc::now())
    }

    async fn set_image_ref(&self, id: &DeploymentId, image_ref: &str) -> StoreResult<()> {
        let mut deployments = Self::write(&self.deployments)?;
        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::not_found("deployment", id.as_str()))?;
        deployment.image_ref = Some(image_ref.to_owned());
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn append_build_logs(&self, id: &DeploymentId, lines: &[String]) -> StoreResult<()> {
        let mut deployments = Self::write(&self.deployments)?;
        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::not_found("deployment", id.as_str()))?;
        deployment.build_logs.extend_from_slice(lines);
        Ok(())
    }

    async fn append_deploy_logs(&self, id: &DeploymentId, lines: &[String]) -> StoreResult<()> {
        let mut deployments = Self::write(&self.deployments)?;
        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::not_found("deployment", id.as_str()))?;
        deployment.deploy_logs.extend_from_slice(lines);
        Ok(())
    }

    async fn build_logs(
        &self,
        id: &DeploymentId,
        offset: usize,
    ) -> StoreResult<Option<(Vec<String>, usize)>> {
        let deployments = Self::read(&self.deployments)?;
        Ok(deployments.get(id.as_str()).map(|d| {
            let lines: Vec<String> = d.build_logs.iter().skip(offset).cloned().collect();
            (lines, d.build_logs.len())
        }))
    }

    async fn deploy_logs(
        &self,
        id: &DeploymentId,
        offset: usize,
    ) -> StoreResult<Option<(Vec<String>, usize)>> {
        let deployments = Self::read(&self.deployments)?;
        Ok(deployments.get(id.as_str()).map(|d| {
            let lines: Vec<String> = d.deploy_logs.iter().skip(offset).cloned().collect();
            (lines, d.deploy_logs.len())
        }))
    }

    async fn list_for_service(
        &self,
        service_id: &ServiceId,
        limit: usize,
    ) -> StoreResult<Vec<Deployment>> {
        let deployments = Self::read(&self.deployments)?;
        let mut results: Vec<Deployment> = deployments
            .values()
            .filter(|d| &d.service_id == service_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        Ok(results)
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn get(&self, service_id: &ServiceId) -> StoreResult<Option<ServiceStrategy>> {
        Ok(Self::read(&self.strategies)?
            .get(service_id.as_str())
            .cloned())
    }

    async fn upsert(&self, strategy: &ServiceStrategy) -> StoreResult<()> {
        Self::write(&self.strategies)?
            .insert(strategy.service_id.as_str().to_owned(), strategy.clone());
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<ServiceStrategy>> {
        Ok(Self::read(&self.strategies)?.values().cloned().collect())
    }
}

#[async_trait]
impl ScalingStore for MemoryStore {
    async fn rules_for_service(
        &self,
        service_id: &ServiceId,
    ) -> StoreResult<Vec<AutoScalingRule>> {
        Ok(Self::read(&self.scaling_rules)?
            .iter()
            .filter(|r| &r.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn services_with_rules(&self) -> StoreResult<Vec<ServiceId>> {
        let rules = Self::read(&self.scaling_rules)?;
        let mut services = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if !services.contains(&rule.service_id) {
                services.push(rule.service_id.clone());
            }
        }
        Ok(services)
    }

    async fn upsert_rule(&self, rule: &AutoScalingRule) -> StoreResult<()> {
        rule.validate()?;
        let mut rules = Self::write(&self.scaling_rules)?;
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule.clone();
        } else {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn mark_rule_fired(
        &self,
        rule_id: &RuleId,
        direction: ScaleDirection,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut rules = Self::write(&self.scaling_rules)?;
        let rule = rules
            .iter_mut()
            .find(|r| &r.id == rule_id)
            .ok_or_else(|| StoreError::not_found("autoscaling rule", rule_id.as_str()))?;
        rule.last_scale_action = Some(at);
        rule.last_scale_direction = Some(direction);
        Ok(())
    }

    async fn current_replicas(&self, service_id: &ServiceId) -> StoreResult<u32> {
        Ok(Self::read(&self.replicas)?
            .get(service_id.as_str())
            .copied()
            .unwrap_or(1))
    }

    async fn set_replicas(&self, service_id: &ServiceId, replicas: u32) -> StoreResult<()> {
        Self::write(&self.replicas)?.insert(service_id.as_str().to_owned(), replicas);
        Ok(())
    }

    async fn server_for_service(&self, service_id: &ServiceId) -> StoreResult<Option<ServerId>> {
        Ok(Self::read(&self.placements)?
            .get(service_id.as_str())
            .cloned())
    }

    async fn set_service_server(
        &self,
        service_id: &ServiceId,
        server_id: &ServerId,
    ) -> StoreResult<()> {
        Self::write(&self.placements)?
            .insert(service_id.as_str().to_owned(), server_id.clone());
        Ok(())
    }

    async fn record_event(&self, event: &ScalingEvent) -> StoreResult<()> {
        Self::write(&self.scaling_events)?.push(event.clone());
        Ok(())
    }

    async fn events_for_service(
        &self,
        service_id: &ServiceId,
        limit: usize,
    ) -> StoreResult<Vec<ScalingEvent>> {
        let events = Self::read(&self.scaling_events)?;
        let mut results: Vec<ScalingEvent> = events
            .iter()
            .filter(|e| &e.service_id == service_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        Ok(results)
    }
}

#[async_trait]
impl UptimeStore for MemoryStore {
    async fn due_monitors(&self, now: DateTime<Utc>) -> StoreResult<Vec<UptimeMonitor>> {
        Ok(Self::read(&self.monitors)?
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect())
    }

    async fn get_monitor(&self, id: &MonitorId) -> StoreResult<Option<UptimeMonitor>> {
        Ok(Self::read(&self.monitors)?.get(id.as_str()).cloned())
    }

    async fn upsert_monitor(&self, monitor: &UptimeMonitor) -> StoreResult<()> {
        Self::write(&self.monitors)?.insert(monitor.id.as_str().to_owned(), monitor.clone());
        Ok(())
    }

    async fn update_probe_state(
        &self,
        id: &MonitorId,
        status: ProbeStatus,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut monitors = Self::write(&self.monitors)?;
        let monitor = monitors
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::not_found("uptime monitor", id.as_str()))?;
        monitor.last_status = Some(status);
        monitor.consecutive_failures = consecutive_failures;
        monitor.last_checked_at = Some(at);
        Ok(())
    }

    async fn record_check(&self, check: &UptimeCheck) -> StoreResult<()> {
        Self::write(&self.checks)?.push(check.clone());
        Ok(())
    }

    async fn checks_for_monitor(
        &self,
        id: &MonitorId,
        limit: usize,
    ) -> StoreResult<Vec<UptimeCheck>> {
        let checks = Self::read(&self.checks)?;
        let mut results: Vec<UptimeCheck> = checks
            .iter()
            .filter(|c| &c.monitor_id == id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        Ok(results)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn enabled_rules(&self) -> StoreResult<Vec<AlertRule>> {
        Ok(Self::read(&self.alert_rules)?
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_rule(&self, rule: &AlertRule) -> StoreResult<()> {
        let mut rules = Self::write(&self.alert_rules)?;
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule.clone();
        } else {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn mark_rule_triggered(&self, rule_id: &RuleId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut rules = Self::write(&self.alert_rules)?;
        let rule = rules
            .iter_mut()
            .find(|r| &r.id == rule_id)
            .ok_or_else(|| StoreError::not_found("alert rule", rule_id.as_str()))?;
        rule.last_triggered_at = Some(at);
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        Self::write(&self.alerts)?.push(alert.clone());
        Ok(())
    }

    async fn active_alerts(&self) -> StoreResult<Vec<Alert>> {
        Ok(Self::read(&self.alerts)?
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::TriggerType;
    use meridian_proto::ServerId;

    fn test_deployment() -> Deployment {
        Deployment::new(
            ServiceId::new("svc-1"),
            ServerId::new("srv-1"),
            TriggerType::Manual,
        )
        .with_git_ref("main")
    }

    #[tokio::test]
    async fn deployment_insert_get_update() {
        let store = MemoryStore::new();
        let deployment = test_deployment();
        let id = deployment.id.clone();

        store.insert(&deployment).await.unwrap();
        assert!(store.insert(&deployment).await.is_err());

        store
            .update_status(&id, DeploymentStatus::Building, None)
            .await
            .unwrap();
        let fetched = DeploymentStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DeploymentStatus::Building);
        assert!(fetched.build_started_at.is_some());

        // The state machine is enforced through the store.
        let err = store
            .update_status(&id, DeploymentStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn build_log_offset_streaming() {
        let store = MemoryStore::new();
        let deployment = test_deployment();
        let id = deployment.id.clone();
        store.insert(&deployment).await.unwrap();

        store
            .append_build_logs(&id, &["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        let (lines, offset) = store.build_logs(&id, 0).await.unwrap().unwrap();
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(offset, 2);

        store
            .append_build_logs(&id, &["c".to_owned()])
            .await
            .unwrap();
        let (lines, offset) = store.build_logs(&id, offset).await.unwrap().unwrap();
        assert_eq!(lines, vec!["c"]);
        assert_eq!(offset, 3);

        assert!(store
            .build_logs(&DeploymentId::new("missing"), 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn replicas_default_to_one() {
        let store = MemoryStore::new();
        let service = ServiceId::new("svc-1");
        assert_eq!(store.current_replicas(&service).await.unwrap(), 1);

        store.set_replicas(&service, 4).await.unwrap();
        assert_eq!(store.current_replicas(&service).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn scaling_rules_keep_insertion_order() {
        let store = MemoryStore::new();
        let service = ServiceId::new("svc-1");

        let first = AutoScalingRule::new(service.clone(), "cpu_percent");
        let second = AutoScalingRule::new(service.clone(), "memory_percent");
        ScalingStore::upsert_rule(&store, &first).await.unwrap();
        ScalingStore::upsert_rule(&store, &second).await.unwrap();

        let rules = store.rules_for_service(&service).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].metric, "cpu_percent");
        assert_eq!(rules[1].metric, "memory_percent");

        assert_eq!(store.services_with_rules().await.unwrap(), vec![service]);
    }

    #[tokio::test]
    async fn invalid_rule_rejected() {
        let store = MemoryStore::new();
        let mut rule = AutoScalingRule::new(ServiceId::new("svc-1"), "cpu_percent");
        rule.min_replicas = 10;
        rule.max_replicas = 1;
        assert!(ScalingStore::upsert_rule(&store, &rule).await.is_err());
    }

    #[tokio::test]
    async fn monitor_probe_state_roundtrip() {
        let store = MemoryStore::new();
        let monitor = UptimeMonitor::new("api", "https://example.com/health");
        let id = monitor.id.clone();
        store.upsert_monitor(&monitor).await.unwrap();

        let due = store.due_monitors(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        let now = Utc::now();
        store
            .update_probe_state(&id, ProbeStatus::Down, 2, now)
            .await
            .unwrap();
        let fetched = store.get_monitor(&id).await.unwrap().unwrap();
        assert_eq!(fetched.consecutive_failures, 2);
        assert_eq!(fetched.last_status, Some(ProbeStatus::Down));

        // Just probed, no longer due.
        assert!(store.due_monitors(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alert_rules_and_alerts() {
        let store = MemoryStore::new();
        let mut rule = AlertRule::new(
            "org-1",
            "high cpu",
            "cpu_percent",
            crate::AlertOperator::Gt,
            80.0,
        );
        AlertStore::upsert_rule(&store, &rule).await.unwrap();
        assert_eq!(store.enabled_rules().await.unwrap().len(), 1);

        rule.enabled = false;
        AlertStore::upsert_rule(&store, &rule).await.unwrap();
        assert!(store.enabled_rules().await.unwrap().is_empty());

        let alert = Alert::new("org-1", crate::Severity::Critical, "down", "it is down");
        store.insert_alert(&alert).await.unwrap();
        assert_eq!(store.active_alerts().await.unwrap().len(), 1);
    }
}
