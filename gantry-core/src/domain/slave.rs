//! Slave domain types
//!
//! A slave is one worker agent: either a subprocess the coordinator spawns
//! and supervises itself (local) or an independent process that registers
//! over the network (remote).

use serde::{Deserialize, Serialize};

use crate::collection::Identifiable;

/// Configured identity of one worker agent
///
/// This is the persisted part of a slave; connection state and the bound
/// channel live in the coordinator's registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveConfig {
    /// Unique slave name, also the agent's `--name` argument.
    pub name: String,
    pub kind: SlaveKind,
    pub applicability: Applicability,
}

impl Identifiable for SlaveConfig {
    fn id(&self) -> &str {
        &self.name
    }
}

/// How a slave's process is managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveKind {
    /// Spawned and supervised by the coordinator.
    Local,
    /// Runs elsewhere and registers over the network.
    Remote,
}

/// Which jobs a slave accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Applicability {
    /// Takes any job whose mission has no slave restriction.
    General,
    /// Only takes jobs whose mission names this slave explicitly.
    Assignment,
}

/// Slave connection lifecycle
///
/// Valid transitions:
/// - Disconnected -> Connecting (local subprocess spawned)
/// - Disconnected -> Connected (remote agent registered)
/// - Connecting -> Connected (spawned agent registered)
/// - Connecting -> Disconnected (subprocess died before registering)
/// - Connected -> Disconnected (channel closed)
///
/// All other transitions are rejected; state is only ever changed through
/// [`ConnectionState::transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Check whether transitioning from `self` to `target` is valid.
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        matches!(
            (self, target),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Disconnected, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }

    /// Validate and perform a transition, returning the new state.
    ///
    /// This is the only sanctioned way to change connection state.
    pub fn transition_to(self, target: ConnectionState) -> Result<ConnectionState, String> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(format!(
                "invalid connection state transition: {self} -> {target}"
            ))
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
