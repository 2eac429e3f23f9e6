//! Alert rules and fired alerts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use meridian_proto::{RuleId, ServiceId};

/// Comparison applied between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Equal (within a small epsilon).
    Eq,
}

impl AlertOperator {
    /// Evaluate `value <op> threshold`.
    #[must_use]
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => (value - threshold).abs() < 1e-9,
        }
    }

    /// The operator as its wire-level string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Eq => "eq",
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

impl Severity {
    /// The severity name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a fired alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Firing, unhandled.
    Active,
    /// Seen by an operator.
    Acknowledged,
    /// No longer firing.
    Resolved,
}

/// Delivery channel for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Chat webhook (severity-colored embed).
    Chat,
    /// Generic webhook POST.
    Webhook,
    /// Email.
    Email,
}

impl ChannelKind {
    /// The channel name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Webhook => "webhook",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A metric-threshold alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule id.
    pub id: RuleId,
    /// Owning organisation.
    pub org_id: String,
    /// Service scope, if the rule is service-specific.
    pub service_id: Option<ServiceId>,
    /// Display name.
    pub name: String,
    /// Metric the rule watches.
    pub metric: String,
    /// Comparison operator.
    pub operator: AlertOperator,
    /// Threshold value.
    pub threshold: f64,
    /// Metric aggregation window in minutes.
    pub window_minutes: u32,
    /// Minimum minutes between firings.
    pub cooldown_minutes: u32,
    /// Severity of the alerts the rule fires.
    pub severity: Severity,
    /// Channels notified when the rule fires.
    pub channels: Vec<ChannelKind>,
    /// Whether the rule is evaluated.
    pub enabled: bool,
    /// When the rule last fired.
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl AlertRule {
    /// A rule with defaults for the given metric and threshold.
    #[must_use]
    pub fn new(
        org_id: impl Into<String>,
        name: impl Into<String>,
        metric: impl Into<String>,
        operator: AlertOperator,
        threshold: f64,
    ) -> Self {
        Self {
            id: RuleId::generate(),
            org_id: org_id.into(),
            service_id: None,
            name: name.into(),
            metric: metric.into(),
            operator,
            threshold,
            window_minutes: 5,
            cooldown_minutes: 15,
            severity: Severity::Warning,
            channels: vec![ChannelKind::Chat],
            enabled: true,
            last_triggered_at: None,
        }
    }

    /// Whether the rule is still cooling down from its last firing.
    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_triggered_at.is_some_and(|last| {
            now < last + Duration::minutes(i64::from(self.cooldown_minutes))
        })
    }
}

/// A fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Service the alert concerns, if any.
    pub service_id: Option<ServiceId>,
    /// Rule that fired the alert, if rule-driven.
    pub rule_id: Option<RuleId>,
    /// Severity.
    pub severity: Severity,
    /// Lifecycle status.
    pub status: AlertStatus,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub message: String,
    /// Structured context (metric values, monitor ids, ...).
    pub metadata: serde_json::Value,
    /// When the alert fired.
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Create a new active alert.
    #[must_use]
    pub fn new(
        org_id: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            org_id: org_id.into(),
            service_id: None,
            rule_id: None,
            severity,
            status: AlertStatus::Active,
            title: title.into(),
            message: message.into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Scope the alert to a service.
    #[must_use]
    pub fn with_service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    /// Attach the firing rule.
    #[must_use]
    pub fn with_rule(mut self, rule_id: RuleId) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_evaluate() {
        assert!(AlertOperator::Gt.evaluate(85.0, 80.0));
        assert!(!AlertOperator::Gt.evaluate(80.0, 80.0));
        assert!(AlertOperator::Gte.evaluate(80.0, 80.0));
        assert!(AlertOperator::Lt.evaluate(10.0, 20.0));
        assert!(AlertOperator::Lte.evaluate(20.0, 20.0));
        assert!(AlertOperator::Eq.evaluate(0.1 + 0.2, 0.3));
    }

    #[test]
    fn cooldown_window() {
        let mut rule = AlertRule::new("org-1", "high cpu", "cpu_percent", AlertOperator::Gt, 80.0);
        rule.cooldown_minutes = 15;
        let now = Utc::now();

        assert!(!rule.in_cooldown(now));
        rule.last_triggered_at = Some(now);
        assert!(rule.in_cooldown(now + Duration::minutes(14)));
        assert!(!rule.in_cooldown(now + Duration::minutes(15)));
    }
}
