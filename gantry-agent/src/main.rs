//! Gantry Agent
//!
//! The process that actually runs jobs. It dials the coordinator, registers
//! under its slave name, and then executes whatever the coordinator
//! dispatches: one job at a time, one shell per action, output streamed back
//! line by line.
//!
//! The same binary serves both slave kinds. For a local slave the
//! coordinator spawns it with these flags itself; for a remote slave an
//! operator starts it on the remote machine pointing at the coordinator.

mod config;
mod connection;
mod executor;
mod runner;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AgentConfig;
use crate::connection::ConnectionError;

#[derive(Debug, Parser)]
#[command(name = "gantry-agent", version, about = "Executes jobs for a Gantry coordinator")]
struct Cli {
    /// Slave name to register as; must be configured on the coordinator
    #[arg(long, env = "GANTRY_AGENT_NAME")]
    name: String,

    /// Coordinator host
    #[arg(long, env = "GANTRY_COORDINATOR_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Coordinator port
    #[arg(long, env = "GANTRY_COORDINATOR_PORT", default_value_t = 7070)]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::new(cli.name, cli.host, cli.port);
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(2);
    }

    info!(
        name = %config.name,
        host = %config.host,
        port = config.port,
        "Starting Gantry Agent"
    );

    match connection::run(&config).await {
        Ok(()) => {}
        Err(ConnectionError::Rejected) => std::process::exit(1),
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    }
}
