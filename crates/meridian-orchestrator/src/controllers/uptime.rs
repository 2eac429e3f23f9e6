//! Uptime check worker.
//!
//! Probes each monitor on its own interval, records one check per probe,
//! and raises an alert on the probe that makes the consecutive-failure count
//! reach the configured threshold (edge-triggered, not level-triggered).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_queue::{EnqueueOptions, Queue};
use meridian_store::{
    Alert, AlertStore, ChannelKind, ProbeStatus, Severity, UptimeCheck, UptimeMonitor, UptimeStore,
};

use crate::error::OrchestratorResult;
use crate::jobs::{NotificationType, NotifyJobData};

/// Raw result of one HTTP probe, before classification.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    /// Response status code, when a response arrived.
    pub status_code: Option<u16>,
    /// Response body, fetched only when the monitor matches on content.
    pub body: Option<String>,
    /// Round-trip time in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Transport error (timeout, DNS, connection refused, ...).
    pub error: Option<String>,
}

/// Probes uptime monitors and tracks consecutive failures.
pub struct UptimeChecker {
    uptime: Arc<dyn UptimeStore>,
    alerts: Arc<dyn AlertStore>,
    notify_queue: Arc<Queue<NotifyJobData>>,
    client: reqwest::Client,
}

impl UptimeChecker {
    /// Create a checker.
    #[must_use]
    pub fn new(
        uptime: Arc<dyn UptimeStore>,
        alerts: Arc<dyn AlertStore>,
        notify_queue: Arc<Queue<NotifyJobData>>,
    ) -> Self {
        Self {
            uptime,
            alerts,
            notify_queue,
            client: reqwest::Client::new(),
        }
    }

    /// Run the scheduler loop until cancelled, probing due monitors.
    pub async fn run(&self, tick: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("uptime checker stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "uptime tick failed");
                    }
                }
            }
        }
    }

    /// Probe every monitor due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> OrchestratorResult<()> {
        let due = self.uptime.due_monitors(now).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "probing due monitors");

        // Probes are independent; run them concurrently under their own
        // timeouts.
        let probes = due.into_iter().map(|monitor| async move {
            let outcome = self.probe(&monitor).await;
            if let Err(e) = self.apply_probe(&monitor, outcome, Utc::now()).await {
                warn!(monitor_id = %monitor.id, error = %e, "failed to record probe");
            }
        });
        futures::future::join_all(probes).await;
        Ok(())
    }

    /// Issue the HTTP request for one monitor.
    async fn probe(&self, monitor: &UptimeMonitor) -> ProbeOutcome {
        let method = reqwest::Method::from_str(&monitor.method)
            .unwrap_or(reqwest::Method::GET);

        let mut request = self
            .client
            .request(method, &monitor.url)
            .timeout(Duration::from_secs(monitor.timeout_secs));

        for (name, value) in &monitor.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &monitor.body {
            request = request.body(body.clone());
        }

        let started = std::time::Instant::now();
        match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                // Only read the body when classification needs it.
                let body = if monitor.expected_body_contains.is_some() {
                    response.text().await.ok()
                } else {
                    None
                };
                ProbeOutcome {
                    status_code: Some(status_code),
                    body,
                    response_time_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                }
            }
            // Timeouts and transport failures classify as down, not as a
            // crash of the checker.
            Err(e) => ProbeOutcome {
                error: Some(e.to_string()),
                ..ProbeOutcome::default()
            },
        }
    }

    /// Classify an outcome against the monitor's expectations.
    fn classify(monitor: &UptimeMonitor, outcome: &ProbeOutcome) -> (ProbeStatus, Option<String>) {
        if let Some(error) = &outcome.error {
            return (ProbeStatus::Down, Some(error.clone()));
        }

        let Some(status_code) = outcome.status_code else {
            return (ProbeStatus::Down, Some("no response".to_owned()));
        };

        if status_code != monitor.expected_status_code {
            return (
                ProbeStatus::Down,
                Some(format!(
                    "expected status {}, got {status_code}",
                    monitor.expected_status_code
                )),
            );
        }

        if let Some(needle) = &monitor.expected_body_contains {
            let found = outcome
                .body
                .as_deref()
                .is_some_and(|body| body.contains(needle.as_str()));
            if !found {
                return (
                    ProbeStatus::Down,
                    Some(format!("body does not contain {needle:?}")),
                );
            }
        }

        (ProbeStatus::Up, None)
    }

    /// Record one probe result and update the monitor's failure counter,
    /// alerting when the counter newly reaches the threshold.
    pub async fn apply_probe(
        &self,
        monitor: &UptimeMonitor,
        outcome: ProbeOutcome,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<ProbeStatus> {
        let (status, detail) = Self::classify(monitor, &outcome);

        let check = UptimeCheck::new(
            monitor.id.clone(),
            status,
            outcome.status_code,
            outcome.response_time_ms,
            detail.clone(),
        );
        self.uptime.record_check(&check).await?;

        let failures = match status {
            ProbeStatus::Up => 0,
            ProbeStatus::Down => monitor.consecutive_failures + 1,
        };
        self.uptime
            .update_probe_state(&monitor.id, status, failures, now)
            .await?;

        if status == ProbeStatus::Down {
            debug!(
                monitor_id = %monitor.id,
                failures,
                threshold = monitor.alert_after_failures,
                "probe down"
            );
            // Fires only on the probe that crosses the threshold; staying
            // above it does not re-alert every tick.
            if failures == monitor.alert_after_failures {
                self.raise_alert(monitor, detail.as_deref(), failures).await;
            }
        }

        Ok(status)
    }

    async fn raise_alert(&self, monitor: &UptimeMonitor, detail: Option<&str>, failures: u32) {
        let message = format!(
            "{} ({}) failed {failures} consecutive checks: {}",
            monitor.name,
            monitor.url,
            detail.unwrap_or("down"),
        );
        info!(monitor_id = %monitor.id, "uptime monitor crossed failure threshold");

        let alert = Alert::new(
            monitor.org_id.clone(),
            Severity::Critical,
            format!("{} is down", monitor.name),
            &message,
        )
        .with_metadata(serde_json::json!({
            "monitor_id": monitor.id.as_str(),
            "url": monitor.url,
            "consecutive_failures": failures,
        }));

        if let Err(e) = self.alerts.insert_alert(&alert).await {
            warn!(monitor_id = %monitor.id, error = %e, "failed to insert uptime alert");
        }

        let payload = NotifyJobData::new(
            NotificationType::UptimeDown,
            message,
            Severity::Critical,
            vec![ChannelKind::Chat, ChannelKind::Webhook],
        );
        if let Err(e) = self
            .notify_queue
            .enqueue(payload, EnqueueOptions::default())
            .await
        {
            warn!(monitor_id = %monitor.id, error = %e, "failed to enqueue uptime notification");
        }
    }
}
