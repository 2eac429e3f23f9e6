//! Progressive-delivery strategy records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meridian_proto::{DeploymentId, ServiceId};

/// Rollout strategy kind, one per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Replace replicas in place.
    Rolling,
    /// Two slots, traffic switched atomically between them.
    BlueGreen,
    /// Weighted traffic split stepped towards full promotion.
    Canary,
}

impl StrategyKind {
    /// The kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::BlueGreen => "blue_green",
            Self::Canary => "canary",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blue-green slot color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// The blue slot.
    Blue,
    /// The green slot.
    Green,
}

impl Color {
    /// The other color.
    #[must_use]
    pub const fn toggled(&self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// The color name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-service rollout strategy state.
///
/// Invariant for canaries: `canary_weight` equals
/// `canary_steps[canary_step_index]` while a canary is active; an aborted
/// canary forces weight 0, a fully promoted one forces weight 100 with
/// `is_active` false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStrategy {
    /// Service this strategy belongs to (1:1).
    pub service_id: ServiceId,
    /// Strategy kind.
    pub kind: StrategyKind,
    /// Deployment occupying the blue slot.
    pub blue_deployment_id: Option<DeploymentId>,
    /// Deployment occupying the green slot.
    pub green_deployment_id: Option<DeploymentId>,
    /// Which slot currently receives traffic.
    pub active_color: Color,
    /// Deployment receiving canary traffic.
    pub canary_deployment_id: Option<DeploymentId>,
    /// Percentage of traffic routed to the canary, 0-100.
    pub canary_weight: u8,
    /// Ordered traffic steps, each 0-100.
    pub canary_steps: Vec<u8>,
    /// Index of the current step in `canary_steps`.
    pub canary_step_index: usize,
    /// Whether the canary advances automatically when metrics stay healthy.
    pub canary_auto_promote: bool,
    /// Error-rate percentage above which an auto-promoted canary aborts.
    pub canary_error_threshold: f64,
    /// Latency in milliseconds above which an auto-promoted canary aborts.
    pub canary_latency_threshold_ms: u64,
    /// Whether a rollout is currently in progress.
    pub is_active: bool,
    /// When traffic last moved (switch, split change, or rollback).
    pub last_switched_at: Option<DateTime<Utc>>,
}

impl ServiceStrategy {
    /// A blue-green strategy with empty slots, blue active.
    #[must_use]
    pub fn blue_green(service_id: ServiceId) -> Self {
        Self {
            service_id,
            kind: StrategyKind::BlueGreen,
            blue_deployment_id: None,
            green_deployment_id: None,
            active_color: Color::Blue,
            canary_deployment_id: None,
            canary_weight: 0,
            canary_steps: Vec::new(),
            canary_step_index: 0,
            canary_auto_promote: false,
            canary_error_threshold: 5.0,
            canary_latency_threshold_ms: 1_000,
            is_active: false,
            last_switched_at: None,
        }
    }

    /// A canary strategy with the given traffic steps.
    #[must_use]
    pub fn canary(service_id: ServiceId, steps: Vec<u8>) -> Self {
        Self {
            kind: StrategyKind::Canary,
            canary_steps: steps,
            ..Self::blue_green(service_id)
        }
    }

    /// The deployment in the given slot.
    #[must_use]
    pub const fn slot(&self, color: Color) -> &Option<DeploymentId> {
        match color {
            Color::Blue => &self.blue_deployment_id,
            Color::Green => &self.green_deployment_id,
        }
    }

    /// Mutable access to the deployment in the given slot.
    pub fn slot_mut(&mut self, color: Color) -> &mut Option<DeploymentId> {
        match color {
            Color::Blue => &mut self.blue_deployment_id,
            Color::Green => &mut self.green_deployment_id,
        }
    }

    /// The deployment currently receiving all blue-green traffic.
    #[must_use]
    pub const fn active_deployment(&self) -> &Option<DeploymentId> {
        self.slot(self.active_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_toggles() {
        assert_eq!(Color::Blue.toggled(), Color::Green);
        assert_eq!(Color::Green.toggled(), Color::Blue);
    }

    #[test]
    fn slots_address_the_right_field() {
        let mut strategy = ServiceStrategy::blue_green(ServiceId::new("svc-1"));
        *strategy.slot_mut(Color::Green) = Some(DeploymentId::new("dep-1"));
        assert_eq!(
            strategy.green_deployment_id,
            Some(DeploymentId::new("dep-1"))
        );
        assert!(strategy.slot(Color::Blue).is_none());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&StrategyKind::BlueGreen).unwrap();
        assert_eq!(json, r#""blue_green""#);
    }
}
