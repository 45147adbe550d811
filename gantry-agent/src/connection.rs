//! Coordinator connection
//!
//! One session per TCP connection: register, ask for work, execute what
//! arrives. When the connection drops mid-job the job is killed locally; the
//! coordinator fails it on its side the moment the channel closes, so the
//! report has nowhere to go anyway. Sessions reconnect with exponential
//! backoff; a registration refusal is fatal.

use gantry_core::protocol::{self, AgentMessage, CoordinatorMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::runner::JobRunner;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("coordinator rejected the registration")]
    Rejected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("gave up after {0} failed connection attempts")]
    RetriesExhausted(u32),
}

/// Connect and serve until the coordinator rejects us or the retry budget
/// runs out. A session that registered successfully resets the budget.
pub async fn run(config: &AgentConfig) -> Result<(), ConnectionError> {
    let mut attempt: u32 = 0;
    let mut delay = config.reconnect_initial;

    loop {
        attempt += 1;
        match serve_session(config).await {
            Ok(()) => {
                info!("connection to coordinator lost, reconnecting");
                attempt = 0;
                delay = config.reconnect_initial;
            }
            Err(ConnectionError::Rejected) => return Err(ConnectionError::Rejected),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!("giving up after {attempt} failed connection attempts: {e}");
                    return Err(ConnectionError::RetriesExhausted(attempt));
                }
                warn!(
                    "connection attempt {attempt}/{} failed: {e}",
                    config.max_attempts
                );
            }
        }

        debug!("reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.reconnect_max);
    }
}

/// One registered session. Returns `Ok(())` when the connection ended after
/// a successful registration, `Rejected` when the coordinator refused the
/// name, and the IO error when the coordinator could not be reached.
async fn serve_session(config: &AgentConfig) -> Result<(), ConnectionError> {
    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, name = %config.name, "connecting to coordinator");
    let stream = TcpStream::connect(&addr).await?;

    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<AgentMessage>(64);
    let writer = tokio::spawn(write_messages(write_half, out_rx));
    let (abort_tx, abort_rx) = watch::channel(false);
    let runner = JobRunner::new(out_tx.clone(), abort_rx);

    let registration = AgentMessage::RegisterAsSlave {
        id: config.name.clone(),
    };
    if out_tx.send(registration).await.is_err() || out_tx.send(AgentMessage::RequestJob).await.is_err() {
        return Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection closed during registration",
        )));
    }
    info!(name = %config.name, "registering and waiting for work");

    let mut lines = BufReader::new(read_half).lines();
    let mut job_handle: Option<JoinHandle<()>> = None;
    let mut outcome = Ok(());
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match protocol::decode_line::<CoordinatorMessage>(&line) {
                Ok(CoordinatorMessage::SlaveRejected) => {
                    error!(name = %config.name, "coordinator rejected the registration");
                    outcome = Err(ConnectionError::Rejected);
                    break;
                }
                Ok(CoordinatorMessage::JobStart { mission }) => match runner.start(mission) {
                    Some(handle) => job_handle = Some(handle),
                    None => warn!("job dispatched while one is already running, dropping it"),
                },
                Err(e) => warn!("unparseable line from coordinator dropped: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("read from coordinator failed: {e}");
                break;
            }
        }
    }

    // Kill whatever is still running; its report has nowhere to go. The
    // writer goes first so nothing blocks on a dead socket.
    let _ = abort_tx.send(true);
    writer.abort();
    let _ = writer.await;
    if let Some(handle) = job_handle {
        let _ = handle.await;
    }
    outcome
}

async fn write_messages(mut write_half: OwnedWriteHalf, mut queue: mpsc::Receiver<AgentMessage>) {
    while let Some(message) = queue.recv().await {
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
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::domain::job::{Job, JobStatus};
    use gantry_core::domain::mission::Action;
    use gantry_core::protocol::MissionAssignment;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::time::timeout;

    fn fast_config(port: u16) -> AgentConfig {
        let mut config = AgentConfig::new("node1", "127.0.0.1", port);
        config.reconnect_initial = Duration::from_millis(10);
        config.reconnect_max = Duration::from_millis(50);
        config.max_attempts = 3;
        config
    }

    async fn listen() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        (listener, addr)
    }

    async fn accept(
        listener: &TcpListener,
    ) -> (
        tokio::io::Lines<BufReader<OwnedReadHalf>>,
        OwnedWriteHalf,
    ) {
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no connection within 2s")
            .expect("accept");
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn read_message(lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>) -> AgentMessage {
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("no message within 2s")
            .expect("read")
            .expect("agent hung up");
        protocol::decode_line(&line).expect("decode")
    }

    #[tokio::test]
    async fn test_agent_registers_requests_and_runs_a_job() {
        let (listener, addr) = listen().await;
        let config = fast_config(addr.port());
        let agent = tokio::spawn(async move { run(&config).await });

        let (mut lines, mut write_half) = accept(&listener).await;
        match read_message(&mut lines).await {
            AgentMessage::RegisterAsSlave { id } => assert_eq!(id, "node1"),
            other => panic!("expected registration, got {other:?}"),
        }
        assert!(matches!(
            read_message(&mut lines).await,
            AgentMessage::RequestJob
        ));

        let assignment = MissionAssignment {
            id: "mission0".to_string(),
            shell: "sh".to_string(),
            actions: vec![Action::new("echo hi", "greet")],
            environment: HashMap::new(),
            jobs: vec![Job::queued("job0", "mission0")],
        };
        let dispatch = protocol::encode_line(&CoordinatorMessage::JobStart {
            mission: assignment,
        })
        .expect("encode");
        write_half
            .write_all(dispatch.as_bytes())
            .await
            .expect("dispatch");

        let mut saw_output = false;
        loop {
            match read_message(&mut lines).await {
                AgentMessage::JobOutput { job_id, output } => {
                    assert_eq!(job_id, "job0");
                    if output.contains("hi") {
                        saw_output = true;
                    }
                }
                AgentMessage::JobFinished { job } => {
                    assert_eq!(job.id, "job0");
                    assert_eq!(job.status, JobStatus::Success);
                    assert_eq!(job.results.len(), 1);
                    break;
                }
                other => panic!("unexpected message mid-job: {other:?}"),
            }
        }
        assert!(saw_output, "output chunk never streamed");

        // Done jobs are followed by a fresh request for work.
        assert!(matches!(
            read_message(&mut lines).await,
            AgentMessage::RequestJob
        ));

        agent.abort();
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let (listener, addr) = listen().await;
        let config = fast_config(addr.port());
        let agent = tokio::spawn(async move { run(&config).await });

        let (mut lines, mut write_half) = accept(&listener).await;
        let _ = read_message(&mut lines).await;
        let rejection =
            protocol::encode_line(&CoordinatorMessage::SlaveRejected).expect("encode");
        write_half
            .write_all(rejection.as_bytes())
            .await
            .expect("reject");

        let result = timeout(Duration::from_secs(2), agent)
            .await
            .expect("agent did not exit")
            .expect("join");
        assert!(matches!(result, Err(ConnectionError::Rejected)));
    }

    #[tokio::test]
    async fn test_retry_budget_is_finite() {
        // Bind then drop so the port refuses connections.
        let (listener, addr) = listen().await;
        drop(listener);
        let config = fast_config(addr.port());

        let result = timeout(Duration::from_secs(5), run(&config))
            .await
            .expect("agent did not give up");
        assert!(matches!(result, Err(ConnectionError::RetriesExhausted(3))));
    }

    #[tokio::test]
    async fn test_agent_reconnects_after_disconnect() {
        let (listener, addr) = listen().await;
        let config = fast_config(addr.port());
        let agent = tokio::spawn(async move { run(&config).await });

        let (mut lines, write_half) = accept(&listener).await;
        let _ = read_message(&mut lines).await;
        drop(write_half);
        drop(lines);

        // A fresh session starts with a fresh registration.
        let (mut lines, _write_half) = accept(&listener).await;
        match read_message(&mut lines).await {
            AgentMessage::RegisterAsSlave { id } => assert_eq!(id, "node1"),
            other => panic!("expected registration, got {other:?}"),
        }

        agent.abort();
    }
}
