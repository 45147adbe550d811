//! Action execution
//!
//! Runs one action: spawns the mission's shell, feeds the action command on
//! stdin, reads stdout and stderr line by line, and enforces the per-action
//! timeout. Every line is streamed to the coordinator as it appears and
//! accumulated into the transcript stored in the result; stderr lines are
//! tagged so a single transcript keeps both streams apart. A stream that
//! fails mid-read fails the action: the error joins the transcript and the
//! exit code is forced to -1.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;

use chrono::Utc;
use gantry_core::domain::job::ActionResult;
use gantry_core::domain::mission::Action;
use gantry_core::protocol::AgentMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a still-running action was killed.
enum Killed {
    TimedOut(u64),
    Aborted,
}

/// Execute one action to completion, returning its result.
///
/// The exit code is -1 whenever the subprocess never produced a usable one:
/// spawn failure, output stream error, timeout, or abort. `abort` is the
/// session's kill flag; once it turns true the subprocess is killed and the
/// action reported as interrupted.
pub async fn execute(
    shell: &str,
    environment: &HashMap<String, String>,
    action: &Action,
    job_id: &str,
    output: &mpsc::Sender<AgentMessage>,
    abort: &mut watch::Receiver<bool>,
) -> ActionResult {
    let started_at = Utc::now();

    if *abort.borrow() {
        return ActionResult {
            exit_code: -1,
            output: "[agent] job aborted\n".to_string(),
            started_at,
            finished_at: Utc::now(),
        };
    }

    let mut child = match spawn_shell(shell, environment) {
        Ok(child) => child,
        Err(e) => {
            return ActionResult {
                exit_code: -1,
                output: format!("[agent] failed to start shell `{shell}`: {e}\n"),
                started_at,
                finished_at: Utc::now(),
            };
        }
    };

    let (chunk_tx, mut chunks) = mpsc::channel::<Result<String, String>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(stdout, "", "stdout", chunk_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(stderr, "[stderr] ", "stderr", chunk_tx.clone()));
    }
    drop(chunk_tx);

    // Feed the command from its own task and close stdin so the shell exits
    // once it is done. The readers must be draining before the write starts:
    // a command bigger than the stdin pipe whose early lines flood stdout
    // would block the shell against the full pipe, and a foreground write
    // blocked on the shell would keep the timeout from ever being armed.
    if let Some(mut stdin) = child.stdin.take() {
        let command = format!("{}\n", action.command);
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(command.as_bytes()).await {
                debug!("failed to write command to shell stdin: {e}");
            }
        });
    }

    let deadline = Instant::now() + Duration::from_secs(action.timeout);
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let mut transcript = String::new();
    let mut chunks_open = true;
    let mut killed: Option<Killed> = None;
    let mut stream_failed = false;
    let status = loop {
        tokio::select! {
            chunk = chunks.recv(), if chunks_open => {
                match chunk {
                    Some(Ok(chunk)) => {
                        transcript.push_str(&chunk);
                        let _ = output
                            .send(AgentMessage::JobOutput {
                                job_id: job_id.to_string(),
                                output: chunk,
                            })
                            .await;
                    }
                    Some(Err(error)) => {
                        warn!(job = %job_id, "{error}, killing action");
                        transcript.push_str(&format!("[agent] {error}\n"));
                        stream_failed = true;
                        if killed.is_none() {
                            if let Err(e) = child.start_kill() {
                                debug!("failed to kill action after stream error: {e}");
                            }
                        }
                    }
                    None => chunks_open = false,
                }
            }
            status = child.wait() => {
                break status;
            }
            _ = &mut timeout, if action.timeout > 0 && killed.is_none() && !stream_failed => {
                warn!(job = %job_id, "action exceeded its {}s timeout, killing", action.timeout);
                if let Err(e) = child.start_kill() {
                    debug!("failed to kill timed out action: {e}");
                }
                killed = Some(Killed::TimedOut(action.timeout));
            }
            changed = abort.changed(), if killed.is_none() && !stream_failed => {
                if changed.is_err() || *abort.borrow() {
                    debug!(job = %job_id, "abort requested, killing action");
                    if let Err(e) = child.start_kill() {
                        debug!("failed to kill aborted action: {e}");
                    }
                    killed = Some(Killed::Aborted);
                }
            }
        }
    };

    // The readers may still hold buffered lines from before the exit.
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            Ok(chunk) => {
                transcript.push_str(&chunk);
                let _ = output
                    .send(AgentMessage::JobOutput {
                        job_id: job_id.to_string(),
                        output: chunk,
                    })
                    .await;
            }
            Err(error) => {
                warn!(job = %job_id, "{error}");
                transcript.push_str(&format!("[agent] {error}\n"));
                stream_failed = true;
            }
        }
    }

    match &killed {
        Some(Killed::TimedOut(seconds)) => {
            transcript.push_str(&format!(
                "[agent] action killed after exceeding its {seconds}s timeout\n"
            ));
        }
        Some(Killed::Aborted) => transcript.push_str("[agent] job aborted\n"),
        None => {}
    }

    let exit_code = if killed.is_some() || stream_failed {
        -1
    } else {
        match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(job = %job_id, "failed to reap the action process: {e}");
                -1
            }
        }
    };

    ActionResult {
        exit_code,
        output: transcript,
        started_at,
        finished_at: Utc::now(),
    }
}

fn spawn_shell(shell: &str, environment: &HashMap<String, String>) -> io::Result<Child> {
    let mut parts = shell.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mission shell is empty",
        ));
    };

    let mut command = Command::new(program);
    command
        .args(parts)
        .envs(environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command.spawn()
}

/// Forward `stream` line by line into `chunks` until EOF.
///
/// A read error (a subprocess emitting a line that is not valid UTF-8, a
/// failing pipe) ends the stream; it is reported as a final `Err` chunk so
/// the caller can fail the action instead of passing off a truncated
/// transcript as complete.
async fn read_lines<R: AsyncRead + Unpin>(
    stream: R,
    tag: &'static str,
    name: &'static str,
    chunks: mpsc::Sender<Result<String, String>>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut chunk = String::with_capacity(tag.len() + line.len() + 1);
                chunk.push_str(tag);
                chunk.push_str(&line);
                chunk.push('\n');
                if chunks.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = chunks.send(Err(format!("{name} stream error: {e}"))).await;
                break;
            }
        }
    }
}
