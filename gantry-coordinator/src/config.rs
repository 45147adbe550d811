//! Coordinator configuration
//!
//! Defines all configurable parameters for the coordinator including
//! the agent listen address, data directory, and scheduler tick interval.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration
///
/// All addresses and intervals are configurable to allow tuning
/// for different deployments (dev vs prod) and for fast test runs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the coordinator listens on for agent connections
    pub bind_addr: SocketAddr,

    /// Host passed to locally spawned agents so they can dial back
    pub advertise_host: String,

    /// Root directory of the on-disk mission/slave/result store
    pub data_dir: PathBuf,

    /// Command used to spawn agents for local slaves
    pub agent_command: String,

    /// Scheduler tick interval (one virtual-clock step per tick)
    pub tick_interval: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(bind_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            bind_addr,
            advertise_host: "127.0.0.1".to_string(),
            data_dir,
            agent_command: "gantry-agent".to_string(),
            tick_interval: Duration::from_secs(60),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - GANTRY_BIND_ADDR (optional, default: 0.0.0.0:7070)
    /// - GANTRY_ADVERTISE_HOST (optional, default: 127.0.0.1)
    /// - GANTRY_DATA_DIR (optional, default: ./gantry-data)
    /// - GANTRY_AGENT_COMMAND (optional, default: gantry-agent)
    /// - GANTRY_TICK_SECONDS (optional, default: 60)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = std::env::var("GANTRY_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7070".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("GANTRY_BIND_ADDR is not a valid socket address: {e}"))?;

        let advertise_host =
            std::env::var("GANTRY_ADVERTISE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let data_dir = std::env::var("GANTRY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./gantry-data"));

        let agent_command =
            std::env::var("GANTRY_AGENT_COMMAND").unwrap_or_else(|_| "gantry-agent".to_string());

        let tick_interval = std::env::var("GANTRY_TICK_SECONDS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Ok(Self {
            bind_addr,
            advertise_host,
            data_dir,
            agent_command,
            tick_interval,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.advertise_host.is_empty() {
            anyhow::bail!("advertise_host cannot be empty");
        }

        if self.agent_command.is_empty() {
            anyhow::bail!("agent_command cannot be empty");
        }

        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir cannot be empty");
        }

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7070),
            PathBuf::from("./gantry-data"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 7070);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.agent_command, "gantry-agent");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Empty agent command should fail
        config.agent_command = String::new();
        assert!(config.validate().is_err());

        config.agent_command = "gantry-agent".to_string();

        // Zero tick interval should fail
        config.tick_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config.tick_interval = Duration::from_millis(20);
        assert!(config.validate().is_ok());
    }
}
