//! Shared application state
//!
//! One [`AppState`] is built at startup and handed around as an `Arc`; there
//! are no globals. The two registries sit behind their own async mutexes and
//! no code path holds both locks at once: slave bookkeeping and mission
//! bookkeeping happen in sequence, never nested.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::config::Config;
use crate::notify::Notifier;
use crate::registry::mission::MissionRegistry;
use crate::registry::slave::SlaveRegistry;
use crate::scheduler::Scheduler;
use crate::store::{ResultsSink, Store};

pub struct AppState {
    pub config: Config,
    pub missions: Mutex<MissionRegistry>,
    pub slaves: Mutex<SlaveRegistry>,
    pub notifier: Notifier,
    /// Template receiver for the work-available signal; connection tasks
    /// clone it. The producing side lives in the mission registry.
    pub work_signal: watch::Receiver<u64>,
    pub scheduler: Scheduler,
}

impl AppState {
    /// Build the shared state: reload the store, normalize what came back,
    /// and wire the registries to their collaborators.
    pub async fn initialize(
        config: Config,
        store: Arc<dyn Store>,
        results: Arc<dyn ResultsSink>,
    ) -> anyhow::Result<Arc<Self>> {
        let persisted = store
            .load()
            .await
            .context("failed to load persisted state")?;
        info!(
            missions = persisted.missions.len(),
            slaves = persisted.slaves.len(),
            "loaded persisted state"
        );

        let notifier = Notifier::new();
        let (work_tx, work_signal) = watch::channel(0u64);

        let mut missions =
            MissionRegistry::new(store.clone(), results, notifier.clone(), work_tx);
        missions.load(persisted.missions);

        let mut slaves = SlaveRegistry::new(store, notifier.clone());
        slaves.load(persisted.slaves);

        Ok(Arc::new(Self {
            scheduler: Scheduler::new(config.tick_interval),
            config,
            missions: Mutex::new(missions),
            slaves: Mutex::new(slaves),
            notifier,
            work_signal,
        }))
    }
}
