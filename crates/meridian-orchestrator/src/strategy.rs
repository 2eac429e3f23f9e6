//! Deployment strategy engine: blue-green switching and canary rollouts.
//!
//! Every operation persists its strategy state first and then dispatches the
//! traffic command best-effort. The control plane's view always advances; a
//! missed dispatch is logged and reconciled by the next traffic command
//! (recorded as an open-question decision in DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_proto::{
    AgentCommand, DeploymentId, ServiceId, TrafficSplitPayload, TrafficSwitchPayload,
};
use meridian_store::{ScalingStore, ServiceStrategy, StrategyKind, StrategyStore};

use crate::agent::AgentGateway;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics::MetricsSource;

/// Metric names consumed by canary auto-promotion.
const CANARY_ERROR_RATE_METRIC: &str = "error_rate";
const CANARY_LATENCY_METRIC: &str = "latency_ms";

/// Drives blue-green and canary traffic state per service.
pub struct StrategyEngine {
    strategies: Arc<dyn StrategyStore>,
    scaling: Arc<dyn ScalingStore>,
    gateway: Arc<dyn AgentGateway>,
    metrics: Arc<dyn MetricsSource>,
}

impl StrategyEngine {
    /// Create a strategy engine.
    #[must_use]
    pub fn new(
        strategies: Arc<dyn StrategyStore>,
        scaling: Arc<dyn ScalingStore>,
        gateway: Arc<dyn AgentGateway>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            strategies,
            scaling,
            gateway,
            metrics,
        }
    }

    /// Load a service's strategy and check its kind.
    async fn expect_kind(
        &self,
        service_id: &ServiceId,
        expected: StrategyKind,
    ) -> OrchestratorResult<ServiceStrategy> {
        let strategy = self
            .strategies
            .get(service_id)
            .await?
            .ok_or_else(|| OrchestratorError::StrategyNotFound(service_id.to_string()))?;
        if strategy.kind != expected {
            return Err(OrchestratorError::StrategyMismatch {
                service: service_id.to_string(),
                expected: expected.as_str(),
                actual: strategy.kind.as_str(),
            });
        }
        Ok(strategy)
    }

    /// Dispatch a traffic command to the service's agent, best-effort.
    async fn dispatch_traffic(&self, service_id: &ServiceId, command: AgentCommand) {
        let server = match self.scaling.server_for_service(service_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                warn!(service_id = %service_id, "no placement, traffic command not dispatched");
                return;
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "placement lookup failed");
                return;
            }
        };

        if let Err(e) = self.gateway.send(&server, command).await {
            warn!(
                service_id = %service_id,
                server_id = %server,
                error = %e,
                "traffic command not dispatched"
            );
        }
    }

    /// Blue-green: route all traffic to `new_deployment_id`.
    ///
    /// Flips the active color to the idle slot, assigns the new deployment
    /// to it, and dispatches a `traffic_switch`.
    pub async fn switch(
        &self,
        service_id: &ServiceId,
        new_deployment_id: DeploymentId,
    ) -> OrchestratorResult<()> {
        let mut strategy = self.expect_kind(service_id, StrategyKind::BlueGreen).await?;

        let target = strategy.active_color.toggled();
        *strategy.slot_mut(target) = Some(new_deployment_id.clone());
        strategy.active_color = target;
        strategy.last_switched_at = Some(Utc::now());
        self.strategies.upsert(&strategy).await?;

        info!(
            service_id = %service_id,
            deployment_id = %new_deployment_id,
            color = %target,
            "blue-green switch"
        );

        self.dispatch_traffic(
            service_id,
            AgentCommand::TrafficSwitch(TrafficSwitchPayload {
                service_id: service_id.clone(),
                active_deployment_id: new_deployment_id,
                strategy: StrategyKind::BlueGreen.as_str().to_owned(),
            }),
        )
        .await;
        Ok(())
    }

    /// Blue-green: route traffic back to the previously active slot.
    ///
    /// Fails when that slot is empty.
    pub async fn rollback(&self, service_id: &ServiceId) -> OrchestratorResult<()> {
        let mut strategy = self.expect_kind(service_id, StrategyKind::BlueGreen).await?;

        let previous = strategy.active_color.toggled();
        let Some(deployment_id) = strategy.slot(previous).clone() else {
            return Err(OrchestratorError::config(format!(
                "cannot roll back {service_id}: {previous} slot is empty"
            )));
        };

        strategy.active_color = previous;
        strategy.last_switched_at = Some(Utc::now());
        self.strategies.upsert(&strategy).await?;

        info!(
            service_id = %service_id,
            deployment_id = %deployment_id,
            color = %previous,
            "blue-green rollback"
        );

        self.dispatch_traffic(
            service_id,
            AgentCommand::TrafficSwitch(TrafficSwitchPayload {
                service_id: service_id.clone(),
                active_deployment_id: deployment_id,
                strategy: StrategyKind::BlueGreen.as_str().to_owned(),
            }),
        )
        .await;
        Ok(())
    }

    /// Canary: start routing the first configured step of traffic to
    /// `canary_deployment_id`.
    pub async fn canary_start(
        &self,
        service_id: &ServiceId,
        canary_deployment_id: DeploymentId,
    ) -> OrchestratorResult<()> {
        let mut strategy = self.expect_kind(service_id, StrategyKind::Canary).await?;

        let Some(&first_step) = strategy.canary_steps.first() else {
            return Err(OrchestratorError::config(format!(
                "no canary steps configured for {service_id}"
            )));
        };

        strategy.canary_deployment_id = Some(canary_deployment_id.clone());
        strategy.canary_step_index = 0;
        strategy.canary_weight = first_step;
        strategy.is_active = true;
        strategy.last_switched_at = Some(Utc::now());
        self.strategies.upsert(&strategy).await?;

        info!(
            service_id = %service_id,
            deployment_id = %canary_deployment_id,
            weight = first_step,
            "canary started"
        );

        self.dispatch_traffic(
            service_id,
            AgentCommand::TrafficSplit(TrafficSplitPayload {
                service_id: service_id.clone(),
                canary_deployment_id: Some(canary_deployment_id),
                weight: first_step,
            }),
        )
        .await;
        Ok(())
    }

    /// Canary: move to the next traffic step.
    ///
    /// When no steps remain the canary is promoted: weight 100 and the
    /// rollout deactivated.
    pub async fn canary_advance(&self, service_id: &ServiceId) -> OrchestratorResult<()> {
        let mut strategy = self.expect_kind(service_id, StrategyKind::Canary).await?;
        if !strategy.is_active {
            return Err(OrchestratorError::config(format!(
                "no active canary for {service_id}"
            )));
        }

        let next_index = strategy.canary_step_index + 1;
        if let Some(&weight) = strategy.canary_steps.get(next_index) {
            strategy.canary_step_index = next_index;
            strategy.canary_weight = weight;
            info!(service_id = %service_id, weight, step = next_index, "canary advanced");
        } else {
            strategy.canary_weight = 100;
            strategy.is_active = false;
            info!(service_id = %service_id, "canary promoted");
        }
        strategy.last_switched_at = Some(Utc::now());
        self.strategies.upsert(&strategy).await?;

        self.dispatch_traffic(
            service_id,
            AgentCommand::TrafficSplit(TrafficSplitPayload {
                service_id: service_id.clone(),
                canary_deployment_id: strategy.canary_deployment_id.clone(),
                weight: strategy.canary_weight,
            }),
        )
        .await;
        Ok(())
    }

    /// Canary: abort the rollout, forcing all traffic back to stable.
    pub async fn canary_abort(&self, service_id: &ServiceId) -> OrchestratorResult<()> {
        let mut strategy = self.expect_kind(service_id, StrategyKind::Canary).await?;

        strategy.canary_deployment_id = None;
        strategy.canary_weight = 0;
        strategy.is_active = false;
        strategy.last_switched_at = Some(Utc::now());
        self.strategies.upsert(&strategy).await?;

        info!(service_id = %service_id, "canary aborted");

        self.dispatch_traffic(
            service_id,
            AgentCommand::TrafficSplit(TrafficSplitPayload {
                service_id: service_id.clone(),
                canary_deployment_id: None,
                weight: 0,
            }),
        )
        .await;
        Ok(())
    }

    /// Evaluate every active auto-promoting canary once: abort on breached
    /// error/latency thresholds, advance otherwise.
    pub async fn evaluate_canaries(&self) -> OrchestratorResult<()> {
        let strategies = self.strategies.list().await?;
        for strategy in strategies
            .into_iter()
            .filter(|s| s.kind == StrategyKind::Canary && s.is_active && s.canary_auto_promote)
        {
            let service_id = strategy.service_id.clone();
            if let Err(e) = self.evaluate_canary(&strategy).await {
                warn!(service_id = %service_id, error = %e, "canary evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_canary(&self, strategy: &ServiceStrategy) -> OrchestratorResult<()> {
        let service_id = &strategy.service_id;
        let snapshot = self.metrics.snapshot(service_id).await?;

        let error_rate = snapshot.get(CANARY_ERROR_RATE_METRIC).copied();
        let latency_ms = snapshot.get(CANARY_LATENCY_METRIC).copied();

        let error_breach = error_rate.is_some_and(|v| v > strategy.canary_error_threshold);
        let latency_breach =
            latency_ms.is_some_and(|v| v > strategy.canary_latency_threshold_ms as f64);

        if error_breach || latency_breach {
            warn!(
                service_id = %service_id,
                error_rate = ?error_rate,
                latency_ms = ?latency_ms,
                "canary unhealthy, aborting"
            );
            return self.canary_abort(service_id).await;
        }

        // No data at all means no verdict; hold the current step.
        if error_rate.is_none() && latency_ms.is_none() {
            debug!(service_id = %service_id, "no canary metrics, holding step");
            return Ok(());
        }

        self.canary_advance(service_id).await
    }

    /// Run canary evaluation on the given interval until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("strategy engine stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_canaries().await {
                        warn!(error = %e, "canary evaluation pass failed");
                    }
                }
            }
        }
    }
}
