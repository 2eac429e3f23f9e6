//! Meridian agent protocol
//!
//! Defines the command envelope sent from the orchestration core to per-host
//! agents, the asynchronous status messages agents send back, and the id and
//! service-spec types shared by the rest of the workspace.
//!
//! The protocol is transport-agnostic: envelopes serialize to JSON and can
//! travel over a websocket, a message bus, or an in-process channel. Every
//! command carries a unique id so agents can deduplicate redeliveries.

mod command;
mod service;
mod status;
mod types;

pub use command::{
    AgentCommand, CommandEnvelope, DeployPayload, DockerSource, GitSource, ScalePayload,
    TrafficSplitPayload, TrafficSwitchPayload,
};
pub use service::{HealthCheckSpec, ResourceSpec, ServiceSpec, SourceType};
pub use status::{AgentEvent, DeployOutcome, DeployStatusReport};
pub use types::{CommandId, DeploymentId, MonitorId, RuleId, ServerId, ServiceId};
