//! Agent connection server
//!
//! Accepts TCP connections from agents and speaks the newline-delimited JSON
//! protocol with each one. A connection must register as a configured slave
//! with its first line; after that its task relays dispatches, output
//! chunks, and terminal reports between the agent and the registries. When
//! the connection dies, whatever job it was executing is failed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use gantry_core::domain::slave::Applicability;
use gantry_core::protocol::{self, AgentMessage, CoordinatorMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Outgoing};
use crate::state::AppState;

type AgentLines = Lines<BufReader<OwnedReadHalf>>;

pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    serve(state, listener).await
}

pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no address")?;
    info!(%addr, "listening for agents");
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let state = state.clone();
        tokio::spawn(handle_connection(state, stream, peer));
    }
}

/// The slave identity a connection registered as.
struct RegisteredAgent {
    name: String,
    general_purpose: bool,
}

async fn handle_connection(state: Arc<AppState>, stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "agent connection opened");
    let (read_half, write_half) = stream.into_split();
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(Channel::new(queue_tx));
    let writer = tokio::spawn(write_outgoing(write_half, queue_rx));
    let mut lines = BufReader::new(read_half).lines();

    if let Some(agent) = register(&state, &channel, &mut lines, peer).await {
        let interrupted = serve_slave(&state, &agent, &channel, &mut lines).await;

        let was_bound = state
            .slaves
            .lock()
            .await
            .handle_channel_closed(&agent.name, &channel);
        if was_bound {
            info!(slave = %agent.name, %peer, "agent disconnected");
        }
        if let Some((mission_id, job_id)) = interrupted {
            state
                .missions
                .lock()
                .await
                .fail_interrupted_job(&mission_id, &job_id)
                .await;
        }
    }

    channel.close();
    let _ = writer.await;
    debug!(%peer, "agent connection closed");
}

/// Read and apply the registration line. On refusal the agent gets a
/// `slave-rejected` and the connection ends; the payload does not say why,
/// the log does.
async fn register(
    state: &Arc<AppState>,
    channel: &Arc<Channel>,
    lines: &mut AgentLines,
    peer: SocketAddr,
) -> Option<RegisteredAgent> {
    let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!(%peer, "connection closed before registration");
            return None;
        }
        Err(e) => {
            debug!(%peer, "read failed before registration: {e}");
            return None;
        }
    };

    let name = match protocol::decode_line::<AgentMessage>(&line) {
        Ok(AgentMessage::RegisterAsSlave { id }) => id,
        Ok(_) => {
            warn!(%peer, "first message was not a registration, dropping connection");
            return None;
        }
        Err(e) => {
            warn!(%peer, "unparseable registration: {e}");
            return None;
        }
    };

    match state.slaves.lock().await.register(&name, channel.clone()) {
        Ok(config) => Some(RegisteredAgent {
            name,
            general_purpose: config.applicability == Applicability::General,
        }),
        Err(e) => {
            warn!(slave = %name, %peer, "registration refused: {e}");
            let _ = channel.send(CoordinatorMessage::SlaveRejected);
            None
        }
    }
}

/// Relay loop for one registered agent. Returns the assignment still in
/// flight when the connection ended, if any.
async fn serve_slave(
    state: &Arc<AppState>,
    agent: &RegisteredAgent,
    channel: &Arc<Channel>,
    lines: &mut AgentLines,
) -> Option<(String, String)> {
    let mut work = state.work_signal.clone();
    let mut wants_work = false;
    let mut current: Option<(String, String)> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(slave = %agent.name, "read failed: {e}");
                        break;
                    }
                };
                let message = match protocol::decode_line::<AgentMessage>(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(slave = %agent.name, "unparseable message dropped: {e}");
                        continue;
                    }
                };
                match message {
                    AgentMessage::RegisterAsSlave { .. } => {
                        warn!(slave = %agent.name, "repeat registration on live channel ignored");
                    }
                    AgentMessage::RequestJob => {
                        // Mark the signal seen before looking, so a job
                        // enqueued between the look and the wait still wakes
                        // us.
                        work.borrow_and_update();
                        if try_dispatch(state, agent, channel, &mut current).await {
                            wants_work = false;
                        } else {
                            wants_work = true;
                        }
                    }
                    AgentMessage::JobOutput { job_id, output } => {
                        match &current {
                            Some((mission_id, current_job)) if *current_job == job_id => {
                                state.notifier.job_output(mission_id, &job_id, &output);
                            }
                            _ => {
                                debug!(slave = %agent.name, job = %job_id, "output for unknown job dropped");
                            }
                        }
                    }
                    AgentMessage::JobFinished { job } => {
                        match current.take() {
                            Some((mission_id, job_id)) if job.id == job_id => {
                                let applied = state
                                    .missions
                                    .lock()
                                    .await
                                    .update_job(&mission_id, &job_id, job.status, job.results)
                                    .await;
                                if !applied {
                                    debug!(slave = %agent.name, job = %job_id, "job report arrived too late");
                                }
                            }
                            Some(other) => {
                                warn!(
                                    slave = %agent.name,
                                    reported = %job.id,
                                    running = %other.1,
                                    "job report does not match the job in flight"
                                );
                                current = Some(other);
                            }
                            None => {
                                debug!(slave = %agent.name, reported = %job.id, "job report with nothing in flight");
                            }
                        }
                    }
                }
            }
            changed = work.changed(), if wants_work => {
                if changed.is_err() {
                    break;
                }
                if try_dispatch(state, agent, channel, &mut current).await {
                    wants_work = false;
                }
            }
        }
    }

    current
}

/// Ask the mission registry for a job this slave may take and queue the
/// dispatch. Failing to queue is not rolled back here: the connection is
/// already dying and the cleanup path fails the job.
async fn try_dispatch(
    state: &Arc<AppState>,
    agent: &RegisteredAgent,
    channel: &Arc<Channel>,
    current: &mut Option<(String, String)>,
) -> bool {
    let assignment = state
        .missions
        .lock()
        .await
        .dispatch_job_to_slave(&agent.name, agent.general_purpose)
        .await;
    let Some(assignment) = assignment else {
        return false;
    };

    let job_id = assignment
        .job()
        .map(|job| job.id.clone())
        .unwrap_or_default();
    *current = Some((assignment.id.clone(), job_id));

    if let Err(e) = channel.send(CoordinatorMessage::JobStart {
        mission: assignment,
    }) {
        debug!(slave = %agent.name, "failed to queue job start: {e}");
    }
    true
}

async fn write_outgoing(
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = queue.recv().await {
        match outgoing {
            Outgoing::Message(message) => {
                let line = match protocol::encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to encode outgoing message: {e}");
                        continue;
                    }
                };
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Outgoing::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::mission::MissionDraft;
    use crate::store::JsonStore;
    use gantry_core::domain::job::JobStatus;
    use gantry_core::domain::mission::Action;
    use gantry_core::domain::slave::{ConnectionState, SlaveConfig, SlaveKind};
    use gantry_core::protocol::JobReport;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn boot() -> (Arc<AppState>, SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let store = Arc::new(JsonStore::new(dir.path()));
        let state = AppState::initialize(config, store.clone(), store)
            .await
            .expect("state");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(serve(state.clone(), listener));
        (state, addr, dir)
    }

    async fn add_general_slave(state: &Arc<AppState>, name: &str) {
        state
            .slaves
            .lock()
            .await
            .add_slave(SlaveConfig {
                name: name.to_string(),
                kind: SlaveKind::Remote,
                applicability: Applicability::General,
            })
            .await
            .expect("add slave");
    }

    async fn add_mission_with_job(state: &Arc<AppState>) -> String {
        let mut missions = state.missions.lock().await;
        let id = missions
            .add_mission(MissionDraft {
                name: "build".to_string(),
                shell: "sh".to_string(),
                actions: vec![Action::new("echo hi", "greet")],
                ..MissionDraft::default()
            })
            .await
            .expect("add mission");
        missions.start_job(&id).await.expect("start job");
        id
    }

    async fn connect_as(addr: SocketAddr, name: &str) -> (AgentLines, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        let mut write_half = write_half;
        send(
            &mut write_half,
            &AgentMessage::RegisterAsSlave {
                id: name.to_string(),
            },
        )
        .await;
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn send(write_half: &mut OwnedWriteHalf, message: &AgentMessage) {
        let line = protocol::encode_line(message).expect("encode");
        write_half
            .write_all(line.as_bytes())
            .await
            .expect("write message");
    }

    async fn read_message(lines: &mut AgentLines) -> CoordinatorMessage {
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("no message within 2s")
            .expect("read")
            .expect("connection closed");
        protocol::decode_line(&line).expect("decode")
    }

    async fn wait_for_job_status(
        state: &Arc<AppState>,
        mission_id: &str,
        job_id: &str,
        expected: JobStatus,
    ) {
        for _ in 0..100 {
            {
                let missions = state.missions.lock().await;
                let status = missions
                    .get(mission_id)
                    .and_then(|m| m.job(job_id))
                    .map(|j| j.status);
                if status == Some(expected) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached {expected}");
    }

    #[tokio::test]
    async fn test_agent_executes_one_job_end_to_end() {
        let (state, addr, _dir) = boot().await;
        add_general_slave(&state, "node1").await;
        let mission_id = add_mission_with_job(&state).await;

        let mut pushes = state.notifier.subscribe();
        let (mut lines, mut write_half) = connect_as(addr, "node1").await;
        send(&mut write_half, &AgentMessage::RequestJob).await;

        let message = read_message(&mut lines).await;
        let CoordinatorMessage::JobStart { mission } = message else {
            panic!("expected job:start, got {message:?}");
        };
        assert_eq!(mission.id, mission_id);
        let job = mission.job().expect("assignment carries the job");
        assert_eq!(job.id, "job0");
        assert_eq!(job.status, JobStatus::Running);

        send(
            &mut write_half,
            &AgentMessage::JobOutput {
                job_id: "job0".to_string(),
                output: "hi\n".to_string(),
            },
        )
        .await;
        send(
            &mut write_half,
            &AgentMessage::JobFinished {
                job: JobReport {
                    id: "job0".to_string(),
                    status: JobStatus::Success,
                    results: Vec::new(),
                },
            },
        )
        .await;
        send(&mut write_half, &AgentMessage::RequestJob).await;

        wait_for_job_status(&state, &mission_id, "job0", JobStatus::Success).await;

        // The streamed chunk went out as a push notification.
        let mut saw_output = false;
        while let Ok(push) = pushes.try_recv() {
            if push.channel == "job:output" {
                assert_eq!(push.payload["jobId"], "job0");
                assert_eq!(push.payload["output"], "hi\n");
                saw_output = true;
            }
        }
        assert!(saw_output, "no job:output notification seen");
    }

    #[tokio::test]
    async fn test_unknown_name_is_rejected() {
        let (_state, addr, _dir) = boot().await;

        let (mut lines, _write_half) = connect_as(addr, "ghost").await;
        let message = read_message(&mut lines).await;
        assert!(matches!(message, CoordinatorMessage::SlaveRejected));

        // The coordinator hangs up after rejecting.
        let eof = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("eof within 2s")
            .expect("read");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected_original_kept() {
        let (state, addr, _dir) = boot().await;
        add_general_slave(&state, "node1").await;

        let (mut first_lines, mut first_write) = connect_as(addr, "node1").await;

        // Wait until the first connection is actually registered.
        for _ in 0..100 {
            if state.slaves.lock().await.get("node1").map(|s| s.state())
                == Some(ConnectionState::Connected)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (mut second_lines, _second_write) = connect_as(addr, "node1").await;
        let message = read_message(&mut second_lines).await;
        assert!(matches!(message, CoordinatorMessage::SlaveRejected));

        // The original binding still dispatches.
        add_mission_with_job(&state).await;
        send(&mut first_write, &AgentMessage::RequestJob).await;
        let message = read_message(&mut first_lines).await;
        assert!(matches!(message, CoordinatorMessage::JobStart { .. }));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_running_job() {
        let (state, addr, _dir) = boot().await;
        add_general_slave(&state, "node1").await;
        let mission_id = add_mission_with_job(&state).await;

        let (mut lines, mut write_half) = connect_as(addr, "node1").await;
        send(&mut write_half, &AgentMessage::RequestJob).await;
        let message = read_message(&mut lines).await;
        assert!(matches!(message, CoordinatorMessage::JobStart { .. }));

        // Kill the connection mid-job.
        drop(write_half);
        drop(lines);

        wait_for_job_status(&state, &mission_id, "job0", JobStatus::Failed).await;
        for _ in 0..100 {
            if state.slaves.lock().await.get("node1").map(|s| s.state())
                == Some(ConnectionState::Disconnected)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slave never returned to disconnected");
    }

    #[tokio::test]
    async fn test_waiting_agent_woken_by_new_job() {
        let (state, addr, _dir) = boot().await;
        add_general_slave(&state, "node1").await;

        let (mut lines, mut write_half) = connect_as(addr, "node1").await;
        // Ask while the queue is empty; the connection parks on the signal.
        send(&mut write_half, &AgentMessage::RequestJob).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        add_mission_with_job(&state).await;
        let message = read_message(&mut lines).await;
        assert!(matches!(message, CoordinatorMessage::JobStart { .. }));
    }

    #[tokio::test]
    async fn test_garbage_line_does_not_kill_connection() {
        let (state, addr, _dir) = boot().await;
        add_general_slave(&state, "node1").await;

        let (mut lines, mut write_half) = connect_as(addr, "node1").await;
        write_half
            .write_all(b"this is not json\n")
            .await
            .expect("write garbage");

        add_mission_with_job(&state).await;
        send(&mut write_half, &AgentMessage::RequestJob).await;
        let message = read_message(&mut lines).await;
        assert!(matches!(message, CoordinatorMessage::JobStart { .. }));
    }
}
