//! Autoscaling controller.
//!
//! Evaluates per-service scaling rules against live metrics and issues
//! `scale` commands to the agent, bounded by replica limits and
//! direction-specific cooldowns. Every decision that attempts to change
//! replicas is recorded as an immutable [`ScalingEvent`], successful or not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_proto::{AgentCommand, RuleId, ScalePayload, ServiceId};
use meridian_store::{ScaleDirection, ScalingEvent, ScalingEventStatus, ScalingStore};

use crate::agent::AgentGateway;
use crate::error::OrchestratorResult;
use crate::metrics::MetricsSource;

/// Outcome of one rule evaluation pass for a service.
#[derive(Debug, Clone)]
pub struct ScaleDecision {
    /// Whether a scaling action is proposed.
    pub should_scale: bool,
    /// Direction of the proposed action.
    pub direction: Option<ScaleDirection>,
    /// Proposed replica count (equals current when not scaling).
    pub new_replicas: u32,
    /// Why this decision was reached.
    pub reason: String,
    /// Rule that matched, when scaling.
    pub rule_id: Option<RuleId>,
    /// Metric that triggered the match.
    pub trigger_metric: Option<String>,
    /// Metric value at evaluation time.
    pub trigger_value: Option<f64>,
}

impl ScaleDecision {
    fn hold(current: u32, reason: impl Into<String>) -> Self {
        Self {
            should_scale: false,
            direction: None,
            new_replicas: current,
            reason: reason.into(),
            rule_id: None,
            trigger_metric: None,
            trigger_value: None,
        }
    }
}

/// Evaluates scaling rules and applies the resulting actions.
pub struct AutoscaleController {
    scaling: Arc<dyn ScalingStore>,
    gateway: Arc<dyn AgentGateway>,
    metrics: Arc<dyn MetricsSource>,
}

impl AutoscaleController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        scaling: Arc<dyn ScalingStore>,
        gateway: Arc<dyn AgentGateway>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            scaling,
            gateway,
            metrics,
        }
    }

    /// Evaluate a service's rules against the given metric values.
    ///
    /// Rules are considered in order and the first rule proposing an action
    /// wins; no attempt is made to apply multiple rules in one pass. The
    /// proposed replica count always lies in the rule's
    /// `[min_replicas, max_replicas]`.
    pub async fn evaluate(
        &self,
        service_id: &ServiceId,
        current_metrics: &HashMap<String, f64>,
    ) -> OrchestratorResult<ScaleDecision> {
        let current = self.scaling.current_replicas(service_id).await?;
        let rules = self.scaling.rules_for_service(service_id).await?;
        let now = Utc::now();

        let mut hold_reason: Option<String> = None;

        for rule in rules.iter().filter(|r| r.enabled) {
            let Some(&value) = current_metrics.get(&rule.metric) else {
                continue;
            };

            if value >= rule.scale_up_threshold {
                if rule.in_cooldown(ScaleDirection::Up, now) {
                    hold_reason.get_or_insert_with(|| "scale-up cooldown active".to_owned());
                    continue;
                }
                if current >= rule.max_replicas {
                    hold_reason.get_or_insert_with(|| {
                        format!("already at max replicas ({})", rule.max_replicas)
                    });
                    continue;
                }
                let new_replicas = current.saturating_add(rule.scale_up_by).min(rule.max_replicas);
                return Ok(ScaleDecision {
                    should_scale: true,
                    direction: Some(ScaleDirection::Up),
                    new_replicas,
                    reason: format!(
                        "{} {value:.2} >= scale-up threshold {}",
                        rule.metric, rule.scale_up_threshold
                    ),
                    rule_id: Some(rule.id.clone()),
                    trigger_metric: Some(rule.metric.clone()),
                    trigger_value: Some(value),
                });
            }

            if value <= rule.scale_down_threshold {
                if rule.in_cooldown(ScaleDirection::Down, now) {
                    hold_reason.get_or_insert_with(|| "scale-down cooldown active".to_owned());
                    continue;
                }
                if current <= rule.min_replicas {
                    hold_reason.get_or_insert_with(|| {
                        format!("already at min replicas ({})", rule.min_replicas)
                    });
                    continue;
                }
                let new_replicas = current.saturating_sub(rule.scale_down_by).max(rule.min_replicas);
                return Ok(ScaleDecision {
                    should_scale: true,
                    direction: Some(ScaleDirection::Down),
                    new_replicas,
                    reason: format!(
                        "{} {value:.2} <= scale-down threshold {}",
                        rule.metric, rule.scale_down_threshold
                    ),
                    rule_id: Some(rule.id.clone()),
                    trigger_metric: Some(rule.metric.clone()),
                    trigger_value: Some(value),
                });
            }
        }

        Ok(ScaleDecision::hold(
            current,
            hold_reason.unwrap_or_else(|| "metrics within thresholds".to_owned()),
        ))
    }

    /// Apply a scaling decision.
    ///
    /// Requires the service's agent to be connected; otherwise a `failed`
    /// event is recorded and replicas are left unchanged. On success the new
    /// replica count is persisted, a `scale` command dispatched, the rule's
    /// last-action stamped, and a `completed` event recorded.
    pub async fn apply_scale(
        &self,
        service_id: &ServiceId,
        decision: &ScaleDecision,
    ) -> OrchestratorResult<ScalingEvent> {
        let Some(direction) = decision.direction else {
            return Err(crate::error::OrchestratorError::internal(
                "apply_scale called with a non-scaling decision",
            ));
        };
        let from = self.scaling.current_replicas(service_id).await?;

        let server = self
            .scaling
            .server_for_service(service_id)
            .await?
            .filter(|server| self.gateway.is_connected(server));

        let Some(server) = server else {
            warn!(service_id = %service_id, "cannot scale, agent not connected");
            let event = self
                .event_from_decision(service_id, decision, direction, from)
                .status(ScalingEventStatus::Failed)
                .error("agent not connected")
                .build();
            self.scaling.record_event(&event).await?;
            return Ok(event);
        };

        self.scaling
            .set_replicas(service_id, decision.new_replicas)
            .await?;

        if let Err(e) = self
            .gateway
            .send(
                &server,
                AgentCommand::Scale(ScalePayload {
                    service_id: service_id.clone(),
                    replicas: decision.new_replicas,
                }),
            )
            .await
        {
            // Disconnected between the check and the send; restore the
            // persisted count so state matches the proxy plane.
            warn!(service_id = %service_id, error = %e, "scale dispatch failed");
            self.scaling.set_replicas(service_id, from).await?;
            let event = self
                .event_from_decision(service_id, decision, direction, from)
                .status(ScalingEventStatus::Failed)
                .error(e.to_string())
                .build();
            self.scaling.record_event(&event).await?;
            return Ok(event);
        }

        if let Some(rule_id) = &decision.rule_id {
            self.scaling
                .mark_rule_fired(rule_id, direction, Utc::now())
                .await?;
        }

        info!(
            service_id = %service_id,
            from,
            to = decision.new_replicas,
            direction = %direction,
            "scaled service"
        );

        let event = self
            .event_from_decision(service_id, decision, direction, from)
            .status(ScalingEventStatus::Completed)
            .build();
        self.scaling.record_event(&event).await?;
        Ok(event)
    }

    fn event_from_decision<'a>(
        &self,
        service_id: &'a ServiceId,
        decision: &'a ScaleDecision,
        direction: ScaleDirection,
        from: u32,
    ) -> EventBuilder<'a> {
        EventBuilder {
            service_id,
            decision,
            direction,
            from,
            status: ScalingEventStatus::Pending,
            error: None,
        }
    }

    /// Evaluate and apply rules for every service that has them.
    pub async fn run_pass(&self) -> OrchestratorResult<()> {
        let services = self.scaling.services_with_rules().await?;
        for service_id in services {
            // One service's failure must not block the others.
            if let Err(e) = self.evaluate_service(&service_id).await {
                warn!(service_id = %service_id, error = %e, "autoscale evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_service(&self, service_id: &ServiceId) -> OrchestratorResult<()> {
        let snapshot = self.metrics.snapshot(service_id).await?;
        let decision = self.evaluate(service_id, &snapshot).await?;
        if decision.should_scale {
            self.apply_scale(service_id, &decision).await?;
        } else {
            debug!(service_id = %service_id, reason = %decision.reason, "no scaling action");
        }
        Ok(())
    }

    /// Run evaluation passes on the given interval until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("autoscale controller stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_pass().await {
                        warn!(error = %e, "autoscale pass failed");
                    }
                }
            }
        }
    }
}

struct EventBuilder<'a> {
    service_id: &'a ServiceId,
    decision: &'a ScaleDecision,
    direction: ScaleDirection,
    from: u32,
    status: ScalingEventStatus,
    error: Option<String>,
}

impl EventBuilder<'_> {
    fn status(mut self, status: ScalingEventStatus) -> Self {
        self.status = status;
        self
    }

    fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn build(self) -> ScalingEvent {
        ScalingEvent::new(
            self.service_id.clone(),
            self.decision.rule_id.clone(),
            self.direction,
            self.from,
            self.decision.new_replicas,
            self.decision.trigger_metric.clone().unwrap_or_default(),
            self.decision.trigger_value.unwrap_or_default(),
            self.decision.reason.clone(),
            self.status,
            self.error,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use meridian_proto::ServerId;
    use meridian_store::{AutoScalingRule, MemoryStore};

    use crate::agent::ChannelAgentGateway;
    use crate::metrics::StaticMetrics;

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<ChannelAgentGateway>,
        controller: AutoscaleController,
        service: ServiceId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ChannelAgentGateway::new());
        let metrics = Arc::new(StaticMetrics::new());
        let controller = AutoscaleController::new(
            Arc::clone(&store) as Arc<dyn ScalingStore>,
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            metrics,
        );
        Fixture {
            store,
            gateway,
            controller,
            service: ServiceId::new("svc-1"),
        }
    }

    fn cpu_rule(service: &ServiceId) -> AutoScalingRule {
        let mut rule = AutoScalingRule::new(service.clone(), "cpu_percent");
        rule.scale_up_threshold = 80.0;
        rule.scale_up_by = 1;
        rule.scale_down_threshold = 20.0;
        rule.scale_down_by = 1;
        rule.min_replicas = 1;
        rule.max_replicas = 5;
        rule
    }

    fn metrics_of(value: f64) -> HashMap<String, f64> {
        HashMap::from([("cpu_percent".to_owned(), value)])
    }

    #[tokio::test]
    async fn scales_up_when_threshold_crossed() {
        let fixture = fixture();
        fixture
            .store
            .upsert_rule(&cpu_rule(&fixture.service))
            .await
            .unwrap();
        fixture.store.set_replicas(&fixture.service, 2).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(85.0))
            .await
            .unwrap();

        assert!(decision.should_scale);
        assert_eq!(decision.direction, Some(ScaleDirection::Up));
        assert_eq!(decision.new_replicas, 3);
    }

    #[tokio::test]
    async fn no_scale_at_max_with_reason() {
        let fixture = fixture();
        fixture
            .store
            .upsert_rule(&cpu_rule(&fixture.service))
            .await
            .unwrap();
        fixture.store.set_replicas(&fixture.service, 5).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(90.0))
            .await
            .unwrap();

        assert!(!decision.should_scale);
        assert!(decision.reason.contains("max replicas"));
        assert_eq!(decision.new_replicas, 5);
    }

    #[tokio::test]
    async fn scales_down_clamped_to_min() {
        let fixture = fixture();
        let mut rule = cpu_rule(&fixture.service);
        rule.scale_down_by = 3;
        fixture.store.upsert_rule(&rule).await.unwrap();
        fixture.store.set_replicas(&fixture.service, 2).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(5.0))
            .await
            .unwrap();

        assert!(decision.should_scale);
        assert_eq!(decision.direction, Some(ScaleDirection::Down));
        // 2 - 3 would undershoot; clamped to min_replicas.
        assert_eq!(decision.new_replicas, 1);
    }

    #[tokio::test]
    async fn scale_up_clamped_to_max() {
        let fixture = fixture();
        let mut rule = cpu_rule(&fixture.service);
        rule.scale_up_by = 4;
        fixture.store.upsert_rule(&rule).await.unwrap();
        fixture.store.set_replicas(&fixture.service, 3).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(95.0))
            .await
            .unwrap();

        assert_eq!(decision.new_replicas, 5);
    }

    #[tokio::test]
    async fn within_thresholds_holds() {
        let fixture = fixture();
        fixture
            .store
            .upsert_rule(&cpu_rule(&fixture.service))
            .await
            .unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(50.0))
            .await
            .unwrap();

        assert!(!decision.should_scale);
        assert_eq!(decision.reason, "metrics within thresholds");
    }

    #[tokio::test]
    async fn cooldown_blocks_second_up_scale() {
        let fixture = fixture();
        let server = ServerId::new("srv-1");
        let mut rx = fixture.gateway.connect(&server);
        fixture
            .store
            .set_service_server(&fixture.service, &server)
            .await
            .unwrap();
        fixture
            .store
            .upsert_rule(&cpu_rule(&fixture.service))
            .await
            .unwrap();
        fixture.store.set_replicas(&fixture.service, 2).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(85.0))
            .await
            .unwrap();
        let event = fixture
            .controller
            .apply_scale(&fixture.service, &decision)
            .await
            .unwrap();
        assert_eq!(event.status, ScalingEventStatus::Completed);
        assert_eq!(
            fixture.store.current_replicas(&fixture.service).await.unwrap(),
            3
        );
        assert_eq!(rx.recv().await.unwrap().command_type(), "scale");

        // Within the cooldown window the same rule never proposes up again.
        let second = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(85.0))
            .await
            .unwrap();
        assert!(!second.should_scale);
        assert!(second.reason.contains("cooldown"));
    }

    #[tokio::test]
    async fn disconnected_agent_records_failed_event() {
        let fixture = fixture();
        fixture
            .store
            .upsert_rule(&cpu_rule(&fixture.service))
            .await
            .unwrap();
        fixture.store.set_replicas(&fixture.service, 2).await.unwrap();

        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics_of(85.0))
            .await
            .unwrap();
        let event = fixture
            .controller
            .apply_scale(&fixture.service, &decision)
            .await
            .unwrap();

        assert_eq!(event.status, ScalingEventStatus::Failed);
        assert_eq!(
            event.error_message.as_deref(),
            Some("agent not connected")
        );
        // Replicas unchanged.
        assert_eq!(
            fixture.store.current_replicas(&fixture.service).await.unwrap(),
            2
        );

        let events = fixture
            .store
            .events_for_service(&fixture.service, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn bounds_hold_for_all_evaluations() {
        let fixture = fixture();
        let rule = cpu_rule(&fixture.service);
        fixture.store.upsert_rule(&rule).await.unwrap();

        for replicas in 1..=5u32 {
            fixture
                .store
                .set_replicas(&fixture.service, replicas)
                .await
                .unwrap();
            for value in [0.0, 10.0, 50.0, 85.0, 100.0] {
                let decision = fixture
                    .controller
                    .evaluate(&fixture.service, &metrics_of(value))
                    .await
                    .unwrap();
                assert!(decision.new_replicas >= rule.min_replicas);
                assert!(decision.new_replicas <= rule.max_replicas);
            }
        }
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let fixture = fixture();
        let mut first = cpu_rule(&fixture.service);
        first.scale_up_by = 2;
        let mut second = AutoScalingRule::new(fixture.service.clone(), "memory_percent");
        second.scale_up_threshold = 70.0;
        second.scale_up_by = 1;
        fixture.store.upsert_rule(&first).await.unwrap();
        fixture.store.upsert_rule(&second).await.unwrap();
        fixture.store.set_replicas(&fixture.service, 1).await.unwrap();

        let metrics = HashMap::from([
            ("cpu_percent".to_owned(), 90.0),
            ("memory_percent".to_owned(), 90.0),
        ]);
        let decision = fixture
            .controller
            .evaluate(&fixture.service, &metrics)
            .await
            .unwrap();

        // The cpu rule is first in rule order; its step size applies.
        assert_eq!(decision.new_replicas, 3);
        assert_eq!(decision.rule_id, Some(first.id));
    }
}
