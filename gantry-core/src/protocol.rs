//! Coordinator <-> agent wire protocol
//!
//! Events travel over a persistent bidirectional channel as newline-delimited
//! JSON, one object per line, internally tagged by an `event` field. The
//! framing is deliberately dumb; everything interesting is in the typed
//! payloads below.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::domain::job::{ActionResult, Job, JobStatus};
use crate::domain::mission::{Action, Mission};

/// Messages sent from an agent to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AgentMessage {
    /// Announce identity; must be the first message on a fresh channel.
    #[serde(rename = "register-as-slave")]
    RegisterAsSlave { id: String },

    /// Ask for work. Sent after registration and after every finished job.
    #[serde(rename = "request-job")]
    RequestJob,

    /// One chunk of action output, streamed while the job runs.
    #[serde(rename = "job:output", rename_all = "camelCase")]
    JobOutput { job_id: String, output: String },

    /// Terminal report carrying the full per-action results.
    #[serde(rename = "job:finished")]
    JobFinished { job: JobReport },
}

/// Messages sent from the coordinator to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CoordinatorMessage {
    /// Registration refused: the name is unknown to the coordinator or a
    /// channel is already bound for it. The existing binding, if any, is
    /// unaffected.
    #[serde(rename = "slave-rejected")]
    SlaveRejected,

    /// Dispatch one job, carrying the mission snapshot to execute.
    #[serde(rename = "job:start")]
    JobStart { mission: MissionAssignment },
}

/// Dispatch-time snapshot of a mission
///
/// A job always executes the mission configuration as it was at dispatch
/// time, not a live reference; `jobs` holds exactly the one job being
/// started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionAssignment {
    pub id: String,
    pub shell: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub jobs: Vec<Job>,
}

impl MissionAssignment {
    /// Snapshot `mission` for dispatching `job`.
    pub fn new(mission: &Mission, job: Job) -> Self {
        Self {
            id: mission.id.clone(),
            shell: mission.shell.clone(),
            actions: mission.actions.clone(),
            environment: mission.environment.clone(),
            jobs: vec![job],
        }
    }

    /// The single job this assignment starts.
    pub fn job(&self) -> Option<&Job> {
        self.jobs.first()
    }
}

/// Job fields reported back by the agent on completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub id: String,
    pub status: JobStatus,
    pub results: Vec<ActionResult>,
}

/// Encode one message as a newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line, tolerating the trailing newline.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_on_the_wire() {
        let register = AgentMessage::RegisterAsSlave {
            id: "node1".to_string(),
        };
        let line = encode_line(&register).unwrap();
        assert_eq!(line, "{\"event\":\"register-as-slave\",\"id\":\"node1\"}\n");

        let request = encode_line(&AgentMessage::RequestJob).unwrap();
        assert_eq!(request, "{\"event\":\"request-job\"}\n");

        let rejected = encode_line(&CoordinatorMessage::SlaveRejected).unwrap();
        assert_eq!(rejected, "{\"event\":\"slave-rejected\"}\n");
    }

    #[test]
    fn test_output_payload_uses_camel_case() {
        let message = AgentMessage::JobOutput {
            job_id: "job0".to_string(),
            output: "hello\n".to_string(),
        };
        let line = encode_line(&message).unwrap();
        assert!(line.contains("\"event\":\"job:output\""));
        assert!(line.contains("\"jobId\":\"job0\""));
    }

    #[test]
    fn test_decode_round_trip() {
        let line = "{\"event\":\"job:finished\",\"job\":{\"id\":\"job2\",\"status\":\"failed\",\"results\":[]}}\n";
        let message: AgentMessage = decode_line(line).unwrap();
        match message {
            AgentMessage::JobFinished { job } => {
                assert_eq!(job.id, "job2");
                assert_eq!(job.status, JobStatus::Failed);
                assert!(job.results.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_assignment_snapshot_carries_single_job() {
        let mission = Mission {
            id: "mission0".into(),
            name: "build".into(),
            shell: "sh".into(),
            actions: vec![Action::new("make", "compile")],
            assigned_slaves: Vec::new(),
            environment: HashMap::from([("CI".to_string(), "1".to_string())]),
            schedule: None,
            jobs: Vec::new(),
        };
        let job = Job::queued("job0", "mission0");

        let assignment = MissionAssignment::new(&mission, job);
        assert_eq!(assignment.jobs.len(), 1);
        assert_eq!(assignment.job().unwrap().id, "job0");
        assert_eq!(assignment.environment.get("CI").unwrap(), "1");

        let line = encode_line(&CoordinatorMessage::JobStart {
            mission: assignment,
        })
        .unwrap();
        assert!(line.contains("\"event\":\"job:start\""));
        assert!(line.contains("\"shell\":\"sh\""));
    }
}
