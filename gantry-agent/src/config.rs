//! Agent configuration
//!
//! Everything arrives on the command line (or the matching environment
//! variables); this module only carries the resolved values plus the
//! reconnection policy constants.

use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Slave name this agent registers as. Must match a slave configured on
    /// the coordinator or registration is refused.
    pub name: String,

    /// Coordinator host to dial
    pub host: String,

    /// Coordinator port to dial
    pub port: u16,

    /// Delay before the first reconnection attempt
    pub reconnect_initial: Duration,

    /// Upper bound for the backoff delay
    pub reconnect_max: Duration,

    /// Consecutive failed attempts tolerated before giving up
    pub max_attempts: u32,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        if self.host.is_empty() {
            anyhow::bail!("host cannot be empty");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        Ok(())
    }
}
