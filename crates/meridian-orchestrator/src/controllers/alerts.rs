//! Alert evaluation controller.
//!
//! A periodic sweep over every enabled alert rule. Sweeps never overlap:
//! alert creation is keyed only by rule, so two concurrent sweeps could
//! double-fire. A single rule's evaluation error is isolated and logged,
//! never aborting the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_queue::{EnqueueOptions, Queue};
use meridian_store::{Alert, AlertRule, AlertStore};

use crate::error::OrchestratorResult;
use crate::jobs::{NotificationType, NotifyJobData};
use crate::metrics::{MetricQuery, MetricsSource};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Whether the sweep ran (false when another sweep was in progress).
    pub ran: bool,
    /// Rules evaluated against a metric value.
    pub evaluated: usize,
    /// Rules that fired an alert.
    pub fired: usize,
    /// Rules skipped because they were cooling down.
    pub skipped_cooldown: usize,
    /// Rules skipped because the metric had no data.
    pub skipped_no_data: usize,
    /// Rules whose evaluation errored (isolated, logged).
    pub errors: usize,
}

enum RuleOutcome {
    Fired,
    NotFired,
    NoData,
}

/// Evaluates metric-threshold alert rules on a fixed interval.
pub struct AlertEvaluator {
    alerts: Arc<dyn AlertStore>,
    metrics: Arc<dyn MetricsSource>,
    notify_queue: Arc<Queue<NotifyJobData>>,
    events: broadcast::Sender<Alert>,
    sweep_guard: Mutex<()>,
}

impl AlertEvaluator {
    /// Create an evaluator.
    #[must_use]
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        metrics: Arc<dyn MetricsSource>,
        notify_queue: Arc<Queue<NotifyJobData>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            alerts,
            metrics,
            notify_queue,
            events,
            sweep_guard: Mutex::new(()),
        }
    }

    /// Subscribe to fired alerts (the published external event stream).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.events.subscribe()
    }

    /// Run sweeps on the given interval until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("alert evaluator stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        warn!(error = %e, "alert sweep failed");
                    }
                }
            }
        }
    }

    /// Evaluate every enabled rule once.
    ///
    /// Returns immediately (with `ran: false`) if a sweep is already in
    /// progress.
    pub async fn run_sweep(&self) -> OrchestratorResult<SweepSummary> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            debug!("alert sweep already in progress, skipping");
            return Ok(SweepSummary::default());
        };

        let now = Utc::now();
        let rules = self.alerts.enabled_rules().await?;
        let mut summary = SweepSummary {
            ran: true,
            ..SweepSummary::default()
        };

        for rule in rules {
            if rule.in_cooldown(now) {
                summary.skipped_cooldown += 1;
                continue;
            }

            match self.evaluate_rule(&rule, now).await {
                Ok(RuleOutcome::Fired) => {
                    summary.evaluated += 1;
                    summary.fired += 1;
                }
                Ok(RuleOutcome::NotFired) => summary.evaluated += 1,
                Ok(RuleOutcome::NoData) => summary.skipped_no_data += 1,
                Err(e) => {
                    // Batch job with partial-failure isolation: this rule's
                    // error must not abort the remaining rules.
                    warn!(rule_id = %rule.id, error = %e, "rule evaluation failed");
                    summary.errors += 1;
                }
            }
        }

        debug!(
            fired = summary.fired,
            evaluated = summary.evaluated,
            "alert sweep finished"
        );
        Ok(summary)
    }

    async fn evaluate_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<RuleOutcome> {
        let query = MetricQuery {
            service_id: rule.service_id.clone(),
            metric: rule.metric.clone(),
            start: now - chrono::Duration::minutes(i64::from(rule.window_minutes)),
            end: now,
        };

        // A metric with no data is skipped, not an error.
        let Some(value) = self.metrics.aggregate(&query).await? else {
            return Ok(RuleOutcome::NoData);
        };

        if !rule.operator.evaluate(value, rule.threshold) {
            return Ok(RuleOutcome::NotFired);
        }

        let message = format!(
            "{} is {value:.2}, threshold {} {}",
            rule.metric,
            rule.operator.as_str(),
            rule.threshold
        );
        info!(rule_id = %rule.id, rule = %rule.name, value, "alert rule fired");

        let mut alert = Alert::new(rule.org_id.clone(), rule.severity, rule.name.clone(), &message)
            .with_rule(rule.id.clone())
            .with_metadata(serde_json::json!({
                "metric": rule.metric,
                "value": value,
                "operator": rule.operator.as_str(),
                "threshold": rule.threshold,
                "window_minutes": rule.window_minutes,
            }));
        if let Some(service_id) = &rule.service_id {
            alert = alert.with_service(service_id.clone());
        }

        self.alerts.insert_alert(&alert).await?;
        self.alerts.mark_rule_triggered(&rule.id, now).await?;

        // Best-effort external event publication.
        let _ = self.events.send(alert.clone());

        // One notification job per channel referenced by the rule.
        for channel in &rule.channels {
            let mut payload = NotifyJobData::new(
                NotificationType::AlertFired,
                format!("{}: {message}", rule.name),
                rule.severity,
                vec![*channel],
            );
            payload.service_id = rule.service_id.clone();

            if let Err(e) = self
                .notify_queue
                .enqueue(payload, EnqueueOptions::default())
                .await
            {
                warn!(rule_id = %rule.id, channel = %channel, error = %e, "failed to enqueue alert notification");
            }
        }

        Ok(RuleOutcome::Fired)
    }
}
