//! Autoscaling rules and their audit trail.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use meridian_proto::{RuleId, ServiceId};

use crate::error::{StoreError, StoreResult};

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    /// Add replicas.
    Up,
    /// Remove replicas.
    Down,
}

impl ScaleDirection {
    /// The direction name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A per-service autoscaling rule.
///
/// Invariant: `min_replicas <= max_replicas`, and every applied replica
/// count lies in `[min_replicas, max_replicas]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScalingRule {
    /// Unique rule id.
    pub id: RuleId,
    /// Service the rule scales.
    pub service_id: ServiceId,
    /// Metric the rule watches (e.g. "cpu_percent").
    pub metric: String,
    /// Whether the rule is evaluated.
    pub enabled: bool,
    /// Metric value at or above which the rule scales up.
    pub scale_up_threshold: f64,
    /// Replicas added per scale-up.
    pub scale_up_by: u32,
    /// Seconds before another scale-up may fire.
    pub scale_up_cooldown_secs: u64,
    /// Metric value at or below which the rule scales down.
    pub scale_down_threshold: f64,
    /// Replicas removed per scale-down.
    pub scale_down_by: u32,
    /// Seconds before another scale-down may fire.
    pub scale_down_cooldown_secs: u64,
    /// Lower replica bound.
    pub min_replicas: u32,
    /// Upper replica bound.
    pub max_replicas: u32,
    /// When the rule last fired.
    pub last_scale_action: Option<DateTime<Utc>>,
    /// Direction of the last firing.
    pub last_scale_direction: Option<ScaleDirection>,
}

impl AutoScalingRule {
    /// A rule with sensible defaults for the given service and metric.
    #[must_use]
    pub fn new(service_id: ServiceId, metric: impl Into<String>) -> Self {
        Self {
            id: RuleId::generate(),
            service_id,
            metric: metric.into(),
            enabled: true,
            scale_up_threshold: 80.0,
            scale_up_by: 1,
            scale_up_cooldown_secs: 300,
            scale_down_threshold: 20.0,
            scale_down_by: 1,
            scale_down_cooldown_secs: 600,
            min_replicas: 1,
            max_replicas: 5,
            last_scale_action: None,
            last_scale_direction: None,
        }
    }

    /// Validate the rule's bounds.
    pub fn validate(&self) -> StoreResult<()> {
        if self.min_replicas > self.max_replicas {
            return Err(StoreError::validation(format!(
                "min_replicas {} exceeds max_replicas {}",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.scale_up_by == 0 && self.scale_down_by == 0 {
            return Err(StoreError::validation(
                "rule scales by zero in both directions",
            ));
        }
        Ok(())
    }

    /// Cooldown length for the given direction.
    #[must_use]
    pub const fn cooldown_secs(&self, direction: ScaleDirection) -> u64 {
        match direction {
            ScaleDirection::Up => self.scale_up_cooldown_secs,
            ScaleDirection::Down => self.scale_down_cooldown_secs,
        }
    }

    /// Whether the rule is still cooling down for the given direction.
    #[must_use]
    pub fn in_cooldown(&self, direction: ScaleDirection, now: DateTime<Utc>) -> bool {
        let (Some(last_action), Some(last_direction)) =
            (self.last_scale_action, self.last_scale_direction)
        else {
            return false;
        };
        if last_direction != direction {
            return false;
        }
        let cooldown = Duration::seconds(self.cooldown_secs(direction).min(i64::MAX as u64) as i64);
        now < last_action + cooldown
    }
}

/// Outcome of a recorded scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventStatus {
    /// The scale command was dispatched and replicas persisted.
    Completed,
    /// The action is still in flight.
    Pending,
    /// The action could not be applied.
    Failed,
}

/// Immutable audit record of one scaling decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    /// Unique event id.
    pub id: String,
    /// Service the decision applied to.
    pub service_id: ServiceId,
    /// Rule that fired, if the action was rule-driven.
    pub rule_id: Option<RuleId>,
    /// Direction of the change.
    pub direction: ScaleDirection,
    /// Replica count before.
    pub from_replicas: u32,
    /// Replica count after (intended).
    pub to_replicas: u32,
    /// Metric that triggered the decision.
    pub trigger_metric: String,
    /// Metric value at decision time.
    pub trigger_value: f64,
    /// Human-readable reason.
    pub reason: String,
    /// Outcome.
    pub status: ScalingEventStatus,
    /// Error message when the action failed.
    pub error_message: Option<String>,
    /// When the decision was made.
    pub created_at: DateTime<Utc>,
}

impl ScalingEvent {
    /// Create an event record. `status` and `error_message` describe the
    /// outcome already known at creation time.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        service_id: ServiceId,
        rule_id: Option<RuleId>,
        direction: ScaleDirection,
        from_replicas: u32,
        to_replicas: u32,
        trigger_metric: impl Into<String>,
        trigger_value: f64,
        reason: impl Into<String>,
        status: ScalingEventStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            service_id,
            rule_id,
            direction,
            from_replicas,
            to_replicas,
            trigger_metric: trigger_metric.into(),
            trigger_value,
            reason: reason.into(),
            status,
            error_message,
            created_at: Utc::now(),
        }
    }
}
