//! Gantry Coordinator
//!
//! The long-running hub of a Gantry installation. It owns the mission and
//! slave registries, persists both as JSON documents on disk, enqueues jobs
//! by hand or on a schedule, and hands them to connected agents over a
//! line-delimited TCP protocol.
//!
//! Architecture:
//! - Registries: missions with their job history, slaves with their
//!   connection state, each behind its own async mutex
//! - Store: JSON documents under the data directory, rewritten on change
//! - Server: one task per agent connection, pull-based job dispatch
//! - Scheduler: a virtual clock that enqueues jobs for matching missions
//! - Supervision: local slaves run as child processes the coordinator spawns

mod channel;
mod config;
mod notify;
mod registry;
mod scheduler;
mod server;
mod state;
mod store;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::state::AppState;
use crate::store::{JsonStore, ResultsSink, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Coordinator");

    let config = Config::from_env()?;
    config.validate()?;
    info!(
        "Loaded configuration: bind_addr={}, data_dir={}",
        config.bind_addr,
        config.data_dir.display()
    );

    let store = Arc::new(JsonStore::new(&config.data_dir));
    let state = AppState::initialize(
        config,
        store.clone() as Arc<dyn Store>,
        store as Arc<dyn ResultsSink>,
    )
    .await?;

    // Bring up everything that was configured before the crash or restart.
    state.slaves.lock().await.connect_local(&state);
    scheduler::refresh(&state).await;

    server::run(state).await
}
