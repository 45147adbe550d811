//! JSON file store
//!
//! One document per key under the data directory:
//!
//! ```text
//! <root>/missions/<mission-id>.json
//! <root>/slaves/<slave-name>.json
//! <root>/results/<mission-id>/<job-id>.json
//! ```
//!
//! Writes go to a sibling `.tmp` file first and are renamed into place, so a
//! document is always either the old version or the new one, never a torn
//! write. Unreadable documents are skipped with a warning at load time
//! rather than failing startup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gantry_core::domain::job::ActionResult;
use gantry_core::domain::mission::Mission;
use gantry_core::domain::slave::SlaveConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::warn;

use super::{PersistedState, ResultsSink, Store, StoreError};

#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn mission_path(&self, id: &str) -> PathBuf {
        self.root.join("missions").join(format!("{id}.json"))
    }

    fn slave_path(&self, name: &str) -> PathBuf {
        self.root.join("slaves").join(format!("{name}.json"))
    }

    fn results_path(&self, mission_id: &str, job_id: &str) -> PathBuf {
        self.root
            .join("results")
            .join(mission_id)
            .join(format!("{job_id}.json"))
    }

    async fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(document)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &encoded).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_document(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every `.json` document in `dir`, skipping unreadable ones.
    async fn read_documents<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable document: {e}");
                    continue;
                }
            };
            match serde_json::from_slice(&bytes) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    warn!(path = %path.display(), "skipping malformed document: {e}");
                }
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        let missions = Self::read_documents(&self.root.join("missions")).await?;
        let slaves = Self::read_documents(&self.root.join("slaves")).await?;
        Ok(PersistedState { missions, slaves })
    }

    async fn save_mission(&self, mission: &Mission) -> Result<(), StoreError> {
        Self::write_document(&self.mission_path(&mission.id), mission).await
    }

    async fn remove_mission(&self, id: &str) -> Result<(), StoreError> {
        Self::remove_document(&self.mission_path(id)).await
    }

    async fn save_slave(&self, slave: &SlaveConfig) -> Result<(), StoreError> {
        Self::write_document(&self.slave_path(&slave.name), slave).await
    }

    async fn remove_slave(&self, name: &str) -> Result<(), StoreError> {
        Self::remove_document(&self.slave_path(name)).await
    }
}

#[async_trait]
impl ResultsSink for JsonStore {
    async fn write_results(
        &self,
        mission_id: &str,
        job_id: &str,
        results: &[ActionResult],
    ) -> Result<(), StoreError> {
        Self::write_document(&self.results_path(mission_id, job_id), &results).await
    }
}
