//! Mission registry and dispatch queue
//!
//! Owns every mission, its job history, and the FIFO queue of jobs waiting
//! for a slave. Jobs enter the queue through [`MissionRegistry::start_job`]
//! (manual or scheduled) and leave it when a slave asks for work and
//! [`MissionRegistry::dispatch_job_to_slave`] finds a queued job that slave
//! may take. Dispatch is pull-only: the registry never pushes work to an
//! idle slave on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use gantry_core::collection::{Collection, next_numbered_id};
use gantry_core::domain::job::{ActionResult, Job, JobStatus};
use gantry_core::domain::mission::{Action, Mission, ScheduleSpec};
use gantry_core::envelope::{ErrorCode, ResponseEnvelope};
use gantry_core::protocol::MissionAssignment;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::notify::Notifier;
use crate::store::{ResultsSink, Store};

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("mission {0} not found")]
    NotFound(String),
    #[error("invalid mission: {0}")]
    Invalid(String),
    #[error("duplicate mission id {0}")]
    Duplicate(String),
}

impl From<&MissionError> for ResponseEnvelope {
    fn from(error: &MissionError) -> Self {
        let code = match error {
            MissionError::NotFound(_) => ErrorCode::NotFound,
            MissionError::Invalid(_) => ErrorCode::InvalidData,
            MissionError::Duplicate(_) => ErrorCode::InvalidRequest,
        };
        ResponseEnvelope::error(code, error.to_string())
    }
}

/// Fields accepted when creating a mission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionDraft {
    pub name: String,
    pub shell: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub assigned_slaves: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

/// Full replacement configuration for an existing mission. The id names the
/// mission to update; job history is never touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionUpdate {
    pub id: String,
    pub name: String,
    pub shell: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub assigned_slaves: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

/// One queued job waiting for a compatible slave.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedJob {
    mission_id: String,
    job_id: String,
}

pub struct MissionRegistry {
    missions: Collection<Mission>,
    queue: VecDeque<QueuedJob>,
    store: Arc<dyn Store>,
    results: Arc<dyn ResultsSink>,
    notifier: Notifier,
    /// Bumped on the empty -> non-empty queue edge; idle connections watch it.
    work_available: watch::Sender<u64>,
}

impl MissionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        results: Arc<dyn ResultsSink>,
        notifier: Notifier,
        work_available: watch::Sender<u64>,
    ) -> Self {
        Self {
            missions: Collection::new(),
            queue: VecDeque::new(),
            store,
            results,
            notifier,
            work_available,
        }
    }

    /// Adopt missions reloaded from the store.
    ///
    /// Jobs that were still queued or running when the previous process died
    /// can never complete now, so they are normalized to failed before the
    /// mission is adopted. The dispatch queue always starts empty.
    pub fn load(&mut self, missions: Vec<Mission>) {
        for mut mission in missions {
            for job in &mut mission.jobs {
                if !job.status.is_terminal() {
                    warn!(
                        mission = %mission.id,
                        job = %job.id,
                        was = %job.status,
                        "marking interrupted job as failed"
                    );
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                }
            }
            if let Err(e) = self.missions.insert(mission) {
                warn!("skipping persisted mission: {e}");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Mission> {
        self.missions.get(id)
    }

    pub fn missions(&self) -> impl Iterator<Item = &Mission> {
        self.missions.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a job for this mission is already waiting in the queue.
    pub fn has_queued_job(&self, mission_id: &str) -> bool {
        self.queue.iter().any(|entry| entry.mission_id == mission_id)
    }

    pub fn has_scheduled_missions(&self) -> bool {
        self.missions.iter().any(|m| m.schedule.is_some())
    }

    pub async fn add_mission(&mut self, draft: MissionDraft) -> Result<String, MissionError> {
        validate_mission_fields(&draft.name, &draft.shell)?;

        let id = self.missions.next_id("mission");
        let mission = Mission {
            id: id.clone(),
            name: draft.name,
            shell: draft.shell,
            actions: draft.actions,
            assigned_slaves: draft.assigned_slaves,
            environment: draft.environment,
            schedule: draft.schedule,
            jobs: Vec::new(),
        };

        let snapshot = mission.clone();
        self.missions
            .insert(mission)
            .map_err(|e| MissionError::Duplicate(e.0))?;

        self.persist_mission(&snapshot).await;
        self.notifier.mission_added(&snapshot);
        info!(mission = %id, name = %snapshot.name, "mission added");
        Ok(id)
    }

    /// Replace a mission's configuration. The mission to change is the one
    /// named by `update.id`, never inferred from anything else.
    pub async fn update_mission(&mut self, update: MissionUpdate) -> Result<(), MissionError> {
        validate_mission_fields(&update.name, &update.shell)?;

        let Some(mission) = self.missions.get_mut(&update.id) else {
            return Err(MissionError::NotFound(update.id));
        };
        mission.name = update.name;
        mission.shell = update.shell;
        mission.actions = update.actions;
        mission.assigned_slaves = update.assigned_slaves;
        mission.environment = update.environment;
        mission.schedule = update.schedule;

        let snapshot = mission.clone();
        self.persist_mission(&snapshot).await;
        self.notifier.mission_updated(&snapshot);
        info!(mission = %snapshot.id, "mission updated");
        Ok(())
    }

    pub async fn remove_mission(&mut self, id: &str) -> Result<(), MissionError> {
        let Some(mission) = self.missions.remove(id) else {
            return Err(MissionError::NotFound(id.to_string()));
        };
        // Queued jobs of a removed mission must never reach a slave.
        self.queue.retain(|entry| entry.mission_id != id);

        if let Err(e) = self.store.remove_mission(id).await {
            warn!(mission = id, "failed to remove mission from store: {e}");
        }
        self.notifier.mission_removed(id);
        info!(mission = id, name = %mission.name, "mission removed");
        Ok(())
    }

    /// Queue a new job for a mission.
    ///
    /// The job id is the lowest free `job<N>` within the mission. If the
    /// queue was empty, idle connections are signalled that work appeared;
    /// a queue that already had entries stays silent, so a slave that never
    /// asks again is intentionally left starving.
    pub async fn start_job(&mut self, mission_id: &str) -> Result<String, MissionError> {
        let Some(mission) = self.missions.get_mut(mission_id) else {
            return Err(MissionError::NotFound(mission_id.to_string()));
        };

        let job_id = next_numbered_id("job", mission.jobs.iter().map(|j| j.id.as_str()));
        let job = Job::queued(job_id.clone(), mission_id);
        mission.jobs.push(job.clone());
        let snapshot = mission.clone();

        self.queue.push_back(QueuedJob {
            mission_id: mission_id.to_string(),
            job_id: job_id.clone(),
        });
        if self.queue.len() == 1 {
            self.work_available.send_modify(|version| *version += 1);
        }

        self.persist_mission(&snapshot).await;
        self.notifier.job_added(&job);
        info!(mission = mission_id, job = %job_id, "job queued");
        Ok(job_id)
    }

    /// Hand the oldest compatible queued job to `slave`, if any.
    ///
    /// The queue is scanned front to back; entries the slave may not take
    /// are skipped and stay queued for somebody else. On a hit the job
    /// transitions to running and the returned snapshot carries the mission
    /// configuration as of this moment.
    pub async fn dispatch_job_to_slave(
        &mut self,
        slave: &str,
        general_purpose: bool,
    ) -> Option<MissionAssignment> {
        let index = self.queue.iter().position(|entry| {
            self.missions
                .get(&entry.mission_id)
                .is_some_and(|m| m.accepts_slave(slave, general_purpose))
        })?;
        let entry = self.queue.remove(index)?;

        let Some(mission) = self.missions.get_mut(&entry.mission_id) else {
            warn!(mission = %entry.mission_id, "queued job for unknown mission dropped");
            return None;
        };
        let Some(job) = mission.job_mut(&entry.job_id) else {
            warn!(job = %entry.job_id, "queued job no longer exists, dropped");
            return None;
        };
        if !job.status.can_transition_to(JobStatus::Running) {
            warn!(job = %entry.job_id, status = %job.status, "queued job not startable, dropped");
            return None;
        }
        job.slave = slave.to_string();
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let job_snapshot = job.clone();

        let assignment = MissionAssignment::new(mission, job_snapshot.clone());
        let snapshot = mission.clone();

        self.persist_mission(&snapshot).await;
        self.notifier.job_updated(&job_snapshot);
        info!(
            mission = %entry.mission_id,
            job = %entry.job_id,
            slave,
            "job dispatched"
        );
        Some(assignment)
    }

    /// Apply a terminal report from the executing agent.
    ///
    /// Only a currently running job accepts the report; anything else is a
    /// stale echo (job already failed by a disconnect, mission edited, a
    /// duplicate report) and is dropped without error.
    pub async fn update_job(
        &mut self,
        mission_id: &str,
        job_id: &str,
        status: JobStatus,
        results: Vec<ActionResult>,
    ) -> bool {
        let Some(mission) = self.missions.get_mut(mission_id) else {
            debug!(mission = mission_id, "job update for unknown mission dropped");
            return false;
        };
        let Some(job) = mission.job_mut(job_id) else {
            debug!(mission = mission_id, job = job_id, "job update for unknown job dropped");
            return false;
        };
        if job.status != JobStatus::Running || !job.status.can_transition_to(status) {
            debug!(
                mission = mission_id,
                job = job_id,
                current = %job.status,
                reported = %status,
                "stale job update dropped"
            );
            return false;
        }

        job.status = status;
        job.results = results;
        job.finished_at = Some(Utc::now());
        let job_snapshot = job.clone();
        let snapshot = mission.clone();

        self.persist_mission(&snapshot).await;
        if let Err(e) = self
            .results
            .write_results(mission_id, job_id, &job_snapshot.results)
            .await
        {
            warn!(mission = mission_id, job = job_id, "failed to archive job results: {e}");
        }
        self.notifier.job_updated(&job_snapshot);
        info!(mission = mission_id, job = job_id, status = %status, "job finished");
        true
    }

    /// Force a job to failed after the channel of the slave executing it is
    /// gone. Only a still-running job is touched, so a terminal report that
    /// won the race stands and a late interrupt is a no-op.
    pub async fn fail_interrupted_job(&mut self, mission_id: &str, job_id: &str) -> bool {
        let Some(mission) = self.missions.get_mut(mission_id) else {
            return false;
        };
        let Some(job) = mission.job_mut(job_id) else {
            return false;
        };
        if job.status != JobStatus::Running {
            return false;
        }

        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        let job_snapshot = job.clone();
        let snapshot = mission.clone();

        self.persist_mission(&snapshot).await;
        self.notifier.job_updated(&job_snapshot);
        warn!(
            mission = mission_id,
            job = job_id,
            slave = %job_snapshot.slave,
            "job failed, slave channel lost while running"
        );
        true
    }

    /// Queue a job for every mission whose schedule matches `time`, unless
    /// one is already waiting. Returns the missions that fired.
    pub async fn fire_due(&mut self, time: NaiveDateTime) -> Vec<String> {
        let due: Vec<String> = self
            .missions
            .iter()
            .filter(|m| m.schedule.as_ref().is_some_and(|s| s.matches(time)))
            .filter(|m| !self.queue.iter().any(|entry| entry.mission_id == m.id))
            .map(|m| m.id.clone())
            .collect();

        let mut fired = Vec::new();
        for mission_id in due {
            match self.start_job(&mission_id).await {
                Ok(job_id) => {
                    debug!(mission = %mission_id, job = %job_id, "schedule fired");
                    fired.push(mission_id);
                }
                Err(e) => warn!(mission = %mission_id, "schedule failed to queue job: {e}"),
            }
        }
        fired
    }

    async fn persist_mission(&self, mission: &Mission) {
        if let Err(e) = self.store.save_mission(mission).await {
            warn!(mission = %mission.id, "failed to persist mission: {e}");
        }
    }
}

fn validate_mission_fields(name: &str, shell: &str) -> Result<(), MissionError> {
    if name.trim().is_empty() {
        return Err(MissionError::Invalid("name cannot be empty".to_string()));
    }
    if shell.trim().is_empty() {
        return Err(MissionError::Invalid("shell cannot be empty".to_string()));
    }
    Ok(())
}
