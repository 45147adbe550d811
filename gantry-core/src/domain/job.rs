//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collection::Identifiable;

/// One execution attempt of a mission
///
/// Structure shared between the coordinator (owns the lifecycle) and the
/// agent (fills in results while running).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique id of the form `job<N>`, scoped to the owning mission.
    pub id: String,
    pub mission_id: String,
    /// Name of the slave executing this job. Empty until dispatched.
    #[serde(default)]
    pub slave: String,
    pub status: JobStatus,
    #[serde(default)]
    pub results: Vec<ActionResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly queued job with no slave assigned yet.
    pub fn queued(id: impl Into<String>, mission_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mission_id: mission_id.into(),
            slave: String::new(),
            status: JobStatus::Queued,
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

impl Identifiable for Job {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Job execution status
///
/// Transitions are one-directional: queued -> running -> success | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// Check whether transitioning from `self` to `target` is valid.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Whether this status is terminal (no further transitions possible).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Overall verdict from per-action exit codes: success only if every
    /// attempted action exited 0.
    pub fn from_results(results: &[ActionResult]) -> JobStatus {
        if results.iter().all(|r| r.exit_code == 0) {
            JobStatus::Success
        } else {
            JobStatus::Failed
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one attempted action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Exit code of the action subprocess. -1 means the subprocess never
    /// produced one: spawn failure, stream error, or killed before exiting.
    pub exit_code: i32,
    /// Accumulated stdout/stderr text, stderr lines tagged.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
