//! Job execution pipeline
//!
//! Runs one job at a time. Actions execute sequentially in the order the
//! mission defines them; the first non-zero exit short-circuits the rest.
//! The runner knows nothing about the socket: it pushes messages into the
//! session's outgoing queue and is told to stop through a watch flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gantry_core::domain::job::JobStatus;
use gantry_core::protocol::{AgentMessage, JobReport, MissionAssignment};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor;

pub struct JobRunner {
    output: mpsc::Sender<AgentMessage>,
    abort: watch::Receiver<bool>,
    busy: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(output: mpsc::Sender<AgentMessage>, abort: watch::Receiver<bool>) -> Self {
        Self {
            output,
            abort,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start executing an assignment. Returns `None` while a job is already
    /// running; the coordinator never dispatches twice on a healthy channel,
    /// so a refused assignment is dropped rather than queued.
    pub fn start(&self, mission: MissionAssignment) -> Option<JoinHandle<()>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return None;
        }
        let output = self.output.clone();
        let abort = self.abort.clone();
        let busy = self.busy.clone();
        Some(tokio::spawn(run_job(mission, output, abort, busy)))
    }
}

async fn run_job(
    mission: MissionAssignment,
    output: mpsc::Sender<AgentMessage>,
    mut abort: watch::Receiver<bool>,
    busy: Arc<AtomicBool>,
) {
    let Some(job_id) = mission.job().map(|job| job.id.clone()) else {
        warn!(mission = %mission.id, "assignment carries no job, dropping");
        busy.store(false, Ordering::SeqCst);
        return;
    };

    info!(
        mission = %mission.id,
        job = %job_id,
        actions = mission.actions.len(),
        "job started"
    );

    let mut results = Vec::with_capacity(mission.actions.len());
    for (index, action) in mission.actions.iter().enumerate() {
        if *abort.borrow() {
            break;
        }
        info!(job = %job_id, action = index, command = %action.command, "running action");
        let result = executor::execute(
            &mission.shell,
            &mission.environment,
            action,
            &job_id,
            &output,
            &mut abort,
        )
        .await;
        let failed = result.exit_code != 0;
        results.push(result);
        if failed {
            info!(job = %job_id, action = index, "action failed, skipping the rest");
            break;
        }
    }

    // An aborted job must not report success off the actions it never ran.
    let status = if *abort.borrow() {
        JobStatus::Failed
    } else {
        JobStatus::from_results(&results)
    };
    info!(job = %job_id, %status, "job finished");

    // Clear busy before asking for more work so the next dispatch is not
    // refused as a double dispatch.
    busy.store(false, Ordering::SeqCst);
    let report = JobReport {
        id: job_id,
        status,
        results,
    };
    let _ = output.send(AgentMessage::JobFinished { job: report }).await;
    let _ = output.send(AgentMessage::RequestJob).await;
}
