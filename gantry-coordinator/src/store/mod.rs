//! Persistence collaborators
//!
//! The in-memory registries are authoritative; the store is a write-through
//! copy read once at startup. Mutations persist best-effort: a failed write
//! is logged by the caller and the mutation stands. Job results additionally
//! go to a [`ResultsSink`] keyed by mission and job so finished output
//! survives restarts.

pub mod json;

pub use json::JsonStore;

use async_trait::async_trait;
use gantry_core::domain::job::ActionResult;
use gantry_core::domain::mission::Mission;
use gantry_core::domain::slave::SlaveConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything the coordinator reloads at startup.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub missions: Vec<Mission>,
    pub slaves: Vec<SlaveConfig>,
}

/// Atomic key/value persistence for missions and the slave roster.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the full persisted state. Missing storage yields an empty state.
    async fn load(&self) -> Result<PersistedState, StoreError>;

    /// Write one mission document, replacing any previous version atomically.
    async fn save_mission(&self, mission: &Mission) -> Result<(), StoreError>;

    async fn remove_mission(&self, id: &str) -> Result<(), StoreError>;

    /// Write one slave roster entry.
    async fn save_slave(&self, slave: &SlaveConfig) -> Result<(), StoreError>;

    async fn remove_slave(&self, name: &str) -> Result<(), StoreError>;
}

/// Write-once archive of finished job results.
#[async_trait]
pub trait ResultsSink: Send + Sync {
    async fn write_results(
        &self,
        mission_id: &str,
        job_id: &str,
        results: &[ActionResult],
    ) -> Result<(), StoreError>;
}
