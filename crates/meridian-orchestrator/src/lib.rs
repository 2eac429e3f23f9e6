//! Meridian orchestrator
//!
//! The deployment orchestration core: turns a deployment request into a
//! running container on a remote host, and keeps running services healthy by
//! reacting to metric, rate, and uptime signals.
//!
//! # Architecture
//!
//! Work flows through three typed queues, each drained by its own pool:
//!
//! ```text
//! trigger ──▶ build queue ──▶ BuildWorker ──▶ deploy queue ──▶ DeployWorker ──▶ agent
//!                                   │                               │
//!                                   └────────▶ notify queue ◀───────┘
//!                                                   │
//!                                              NotifyWorker ──▶ chat / webhook / email
//! ```
//!
//! Independently, three control loops run on their own schedules:
//!
//! - [`controllers::AlertEvaluator`]: single-flight sweeps over alert rules
//! - [`controllers::UptimeChecker`]: per-monitor HTTP probes with
//!   consecutive-failure tracking
//! - [`controllers::AutoscaleController`]: rule evaluation with cooldowns
//!   and replica bounds
//!
//! The [`strategy::StrategyEngine`] maintains blue-green and canary rollout
//! state and issues traffic commands; [`status::StatusIngest`] accepts the
//! agent's asynchronous rollout reports.
//!
//! All collaborators are handed in through [`context::OrchestratorContext`];
//! there is no global mutable state.

pub mod agent;
pub mod config;
pub mod context;
pub mod controllers;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod status;
pub mod strategy;
pub mod workers;

pub use agent::{AgentGateway, ChannelAgentGateway};
pub use config::OrchestratorConfig;
pub use context::{OrchestratorContext, Stores};
pub use error::{OrchestratorError, OrchestratorResult};
pub use jobs::{BuildJobData, DeployJobData, NotificationType, NotifyJobData};
pub use metrics::{MetricQuery, MetricsSource, StaticMetrics};
pub use status::StatusIngest;
pub use strategy::StrategyEngine;
