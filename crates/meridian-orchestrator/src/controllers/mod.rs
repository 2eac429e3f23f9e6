//! Closed-loop controllers: alert evaluation, uptime checks, autoscaling.

pub mod alerts;
pub mod autoscale;
pub mod uptime;

pub use alerts::{AlertEvaluator, SweepSummary};
pub use autoscale::{AutoscaleController, ScaleDecision};
pub use uptime::{ProbeOutcome, UptimeChecker};
