//! Agent gateway: the seam between the core and connected host agents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meridian_proto::{AgentCommand, CommandEnvelope, ServerId};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Sends commands to the agent connected for a server.
///
/// Implementations own the transport (websocket, message bus, in-process
/// channel). Sending is fire-and-forget from the core's perspective: results
/// arrive asynchronously on the status channel.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Whether an agent is currently connected for the server.
    fn is_connected(&self, server_id: &ServerId) -> bool;

    /// Send a command to the server's agent.
    ///
    /// Fails with [`OrchestratorError::AgentNotConnected`] when no agent is
    /// connected.
    async fn send(&self, server_id: &ServerId, command: AgentCommand) -> OrchestratorResult<()>;
}

/// Channel-backed gateway.
///
/// Each connected agent is represented by an unbounded sender; the transport
/// layer (out of scope here) drains the paired receiver onto the wire. Also
/// used directly by tests, which keep the receiver to observe dispatched
/// commands.
#[derive(Debug, Default)]
pub struct ChannelAgentGateway {
    connections: DashMap<String, mpsc::UnboundedSender<CommandEnvelope>>,
    last_heartbeat: DashMap<String, DateTime<Utc>>,
}

impl ChannelAgentGateway {
    /// Create a gateway with no connected agents.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent connection for a server.
    ///
    /// Returns the receiver the transport drains. A reconnect replaces the
    /// previous connection.
    pub fn connect(&self, server_id: &ServerId) -> mpsc::UnboundedReceiver<CommandEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .connections
            .insert(server_id.as_str().to_owned(), tx)
            .is_some()
        {
            info!(server_id = %server_id, "agent reconnected, replacing previous connection");
        } else {
            info!(server_id = %server_id, "agent connected");
        }
        self.record_heartbeat(server_id);
        rx
    }

    /// Remove an agent connection.
    pub fn disconnect(&self, server_id: &ServerId) {
        if self.connections.remove(server_id.as_str()).is_some() {
            info!(server_id = %server_id, "agent disconnected");
        }
        self.last_heartbeat.remove(server_id.as_str());
    }

    /// Record a heartbeat from the server's agent.
    pub fn record_heartbeat(&self, server_id: &ServerId) {
        self.last_heartbeat
            .insert(server_id.as_str().to_owned(), Utc::now());
    }

    /// When the server's agent last heartbeated.
    #[must_use]
    pub fn last_heartbeat(&self, server_id: &ServerId) -> Option<DateTime<Utc>> {
        self.last_heartbeat
            .get(server_id.as_str())
            .map(|entry| *entry)
    }

    /// Number of connected agents.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl AgentGateway for ChannelAgentGateway {
    fn is_connected(&self, server_id: &ServerId) -> bool {
        self.connections.contains_key(server_id.as_str())
    }

    async fn send(&self, server_id: &ServerId, command: AgentCommand) -> OrchestratorResult<()> {
        let envelope = CommandEnvelope::new(command);
        let command_type = envelope.command_type();

        let Some(sender) = self
            .connections
            .get(server_id.as_str())
            .map(|entry| entry.clone())
        else {
            return Err(OrchestratorError::AgentNotConnected {
                server: server_id.clone(),
            });
        };

        if sender.send(envelope).is_err() {
            // The transport side dropped its receiver; treat as disconnected.
            warn!(server_id = %server_id, "agent channel closed, dropping connection");
            self.connections.remove(server_id.as_str());
            return Err(OrchestratorError::AgentNotConnected {
                server: server_id.clone(),
            });
        }

        debug!(server_id = %server_id, command = command_type, "command dispatched");
        Ok(())
    }
}
