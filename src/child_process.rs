/**
 * Stdio-process backend: a spawned command whose stdout is the message stream,
 * stdin the write side and stderr a diagnostic sink.
 */
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{BackendEvent, BackendOptions, BackendSender, Outbound, ProcessError};
use crate::config::StdioServerParameters;
use crate::message::Message;

/// How long stdout is still read once the process has exited. Descendants that
/// inherited the pipe can keep it open long after that.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    success: bool,
}

pub struct StdioBackend {
    pid: Option<u32>,
    command: String,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<BackendEvent>,
    exit: watch::Receiver<Option<ExitInfo>>,
    closing: CancellationToken,
    terminate: CancellationToken,
    kill: CancellationToken,
    exit_timeout: Duration,
}

impl StdioBackend {
    /// Spawns the configured command with its environment merged over ours.
    pub fn spawn(
        params: &StdioServerParameters,
        options: &BackendOptions,
    ) -> Result<Self, ProcessError> {
        let mut command = Command::new(&params.command);
        command
            .args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ProcessError::Spawn {
            command: params.command.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::Io("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Io("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::Io("child stderr unavailable".to_string()))?;

        info!(command = %params.command, args = ?params.args, pid = ?pid, "Spawned stdio backend");

        let capacity = options.capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = watch::channel(None);
        let closing = CancellationToken::new();
        let terminate = CancellationToken::new();
        let kill = CancellationToken::new();

        tokio::spawn(reap(child, exit_tx, terminate.clone(), kill.clone()));
        tokio::spawn(write_stdin(stdin, outbound_rx, closing.clone()));
        tokio::spawn(read_stdout(
            stdout,
            events_tx,
            exit_rx.clone(),
            options.timeouts.process_exit,
            closing.clone(),
        ));
        tokio::spawn(drain_stderr(stderr, params.command.clone()));

        Ok(Self {
            pid,
            command: params.command.clone(),
            outbound: outbound_tx,
            events: events_rx,
            exit: exit_rx,
            closing,
            terminate,
            kill,
            exit_timeout: options.timeouts.process_exit,
        })
    }

    pub fn sender(&self) -> BackendSender {
        BackendSender::new(self.outbound.clone())
    }

    pub async fn receive(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    /// Closes stdin, asks the process to terminate and waits for it to exit.
    /// A process still running after the exit timeout is killed and reported.
    pub async fn close(self) -> Result<(), ProcessError> {
        self.closing.cancel();
        self.terminate.cancel();
        let mut exit = self.exit.clone();

        if wait_for_exit(&mut exit, self.exit_timeout).await {
            debug!(command = %self.command, pid = ?self.pid, "Stdio backend exited");
            return Ok(());
        }

        warn!(
            command = %self.command,
            pid = ?self.pid,
            timeout = ?self.exit_timeout,
            "Stdio backend did not exit in time, killing it"
        );
        self.kill.cancel();
        wait_for_exit(&mut exit, self.exit_timeout).await;
        Err(ProcessError::ForcedKill(self.exit_timeout))
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitInfo>>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, exit.wait_for(|status| status.is_some())).await,
        Ok(Ok(_))
    )
}

async fn exit_status(exit: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match exit.wait_for(|status| status.is_some()).await {
        Ok(status) => *status,
        Err(_) => None,
    }
}

/// Sends SIGTERM while the child is still unreaped, so the pid cannot have been reused.
#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to stop stdio backend");
    }
}

async fn reap(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    terminate: CancellationToken,
    kill: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate.cancelled() => {
            send_terminate(&mut child);
            tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Failed to kill stdio backend");
                    }
                    child.wait().await
                }
            }
        }
    };

    let info = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            success: status.success(),
        },
        Err(e) => {
            warn!(error = %e, "Failed to wait for stdio backend");
            ExitInfo {
                code: None,
                success: false,
            }
        }
    };
    exit_tx.send_replace(Some(info));
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut outbound: mpsc::Receiver<Outbound>,
    closing: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = closing.cancelled() => break,
            next = outbound.recv() => match next {
                Some(next) => next.message,
                None => break,
            },
        };

        let mut line = message.to_line();
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write to stdio backend");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "Failed to flush stdio backend input");
            break;
        }
    }
    // Dropping stdin here closes the pipe.
}

fn exit_failure(status: Option<ExitInfo>) -> ProcessError {
    match status {
        Some(info) if !info.success => ProcessError::UnexpectedExit { code: info.code },
        _ => ProcessError::StreamClosed,
    }
}

/// Hands one stdout line to the session. Returns false once nobody is listening.
async fn forward(
    events: &mpsc::Sender<BackendEvent>,
    closing: &CancellationToken,
    line: String,
) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    tokio::select! {
        _ = closing.cancelled() => false,
        sent = events.send(BackendEvent::Message(Message::new(line))) => sent.is_ok(),
    }
}

/// Forwards whatever the process wrote before exiting, giving up after [`EXIT_DRAIN`].
async fn drain_after_exit(
    lines: &mut Lines<BufReader<ChildStdout>>,
    events: &mpsc::Sender<BackendEvent>,
    closing: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + EXIT_DRAIN;
    while let Ok(Ok(Some(line))) = tokio::time::timeout_at(deadline, lines.next_line()).await {
        if !forward(events, closing, line).await {
            return false;
        }
    }
    true
}

async fn read_stdout(
    stdout: ChildStdout,
    events: mpsc::Sender<BackendEvent>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
    exit_timeout: Duration,
    closing: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let failure = loop {
        tokio::select! {
            _ = closing.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !forward(&events, &closing, line).await {
                        return;
                    }
                }
                Ok(None) => {
                    let exited = tokio::select! {
                        _ = closing.cancelled() => return,
                        exited = wait_for_exit(&mut exit, exit_timeout) => exited,
                    };
                    let status = if exited { *exit.borrow() } else { None };
                    break exit_failure(status);
                }
                Err(e) => break ProcessError::Io(e.to_string()),
            },
            status = exit_status(&mut exit) => {
                if !drain_after_exit(&mut lines, &events, &closing).await {
                    return;
                }
                break exit_failure(status);
            }
        }
    };

    warn!(error = %failure, "Stdio backend stopped");
    let _ = events.send(BackendEvent::Closed(failure.into())).await;
}

async fn drain_stderr(stderr: ChildStderr, command: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "mcp_auth_proxy::backend_stderr", command = %command, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading stdio backend stderr");
                break;
            }
        }
    }
}
