//! Push notification fan-out
//!
//! Every observable mutation of the coordinator state (missions, slaves,
//! jobs, live job output) is published on an in-process broadcast channel.
//! Observers subscribe and relay; with no subscribers a send is a no-op.
//! Notifications never fail the mutation that produced them.

use gantry_core::domain::job::Job;
use gantry_core::domain::mission::Mission;
use gantry_core::domain::slave::{ConnectionState, SlaveConfig};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

/// One push to observers: a channel name plus the payload fields
/// flattened next to it.
#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub channel: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<PushNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushNotification> {
        self.sender.subscribe()
    }

    fn push<T: Serialize>(&self, channel: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(channel, "failed to serialize notification payload: {e}");
                return;
            }
        };
        let _ = self.sender.send(PushNotification {
            channel: channel.to_string(),
            payload,
        });
    }

    pub fn mission_added(&self, mission: &Mission) {
        self.push("mission:add", mission);
    }

    pub fn mission_updated(&self, mission: &Mission) {
        self.push("mission:update", mission);
    }

    pub fn mission_removed(&self, id: &str) {
        self.push("mission:remove", &json!({ "id": id }));
    }

    pub fn slave_updated(&self, config: &SlaveConfig, state: ConnectionState) {
        self.push(
            "slave:update",
            &json!({
                "name": config.name,
                "kind": config.kind,
                "applicability": config.applicability,
                "state": state,
            }),
        );
    }

    pub fn job_added(&self, job: &Job) {
        self.push("job:add", job);
    }

    pub fn job_updated(&self, job: &Job) {
        self.push("job:update", job);
    }

    pub fn job_output(&self, mission_id: &str, job_id: &str, output: &str) {
        self.push(
            "job:output",
            &json!({
                "missionId": mission_id,
                "jobId": job_id,
                "output": output,
            }),
        );
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
