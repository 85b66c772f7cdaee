//! Streaming process executor
//!
//! One call to [`Executor::execute`] is one invocation: build argv, spawn,
//! stream stdout line by line, surface stderr once it closes, and finish with
//! exactly one terminal event. Two reader tasks feed a single fan-in loop; the
//! loop is the only writer to the caller's sink, so nothing can be emitted
//! after the terminal event.
//!
//! Every exit path (normal exit, hard timeout, caller cancellation, consumer
//! gone) reaps the child and joins both readers before returning.

use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{BuiltCommand, ToolTable};
use crate::error::ExecutionError;
use crate::types::{CommandEvent, Tool};
use crate::validator::MAX_OUTPUT_LEN;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const TIMEOUT_MESSAGE: &str = "command execution timed out";
pub const CANCELLED_MESSAGE: &str = "command execution cancelled";

/// Stderr beyond this is drained but not kept.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const PIPE_BUFFER: usize = 64;
/// Longest stdout line kept in memory; longer runs are split into several events.
const STDOUT_LINE_LIMIT: usize = MAX_OUTPUT_LEN;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Build, spawn, or wait failure, or a non-zero exit.
    Failed,
    TimedOut,
    /// Caller cancelled or stopped consuming events.
    Cancelled,
}

enum PipeEvent {
    Line(String),
    Stderr(String),
    Closed,
}

enum Finish {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs allow-listed tools with a hard per-invocation ceiling.
pub struct Executor {
    table: ToolTable,
    timeout: Duration,
}

impl Executor {
    pub fn new(table: ToolTable) -> Self {
        Self {
            table,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn table(&self) -> &ToolTable {
        &self.table
    }

    /// Build and run one validated request, pushing events into `sink`.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        tool: Tool,
        target: &str,
        params: &HashMap<String, String>,
        sink: mpsc::Sender<CommandEvent>,
    ) -> Outcome {
        let target = target.trim();
        match self.table.build(tool, target, params) {
            Ok(command) => self.run(cancel, tool, target, command, sink).await,
            Err(e) => {
                warn!("Cannot build {tool} command: {e}");
                let event = CommandEvent::terminal(tool, target, Utc::now(), Some(e.to_string()));
                deliver_terminal(&sink, event, cancel).await;
                Outcome::Failed
            }
        }
    }

    /// Run an already-built command. Events are labelled with `tool`/`target`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        tool: Tool,
        target: &str,
        command: BuiltCommand,
        sink: mpsc::Sender<CommandEvent>,
    ) -> Outcome {
        let started = Utc::now();
        info!(
            %tool,
            target,
            program = %command.program.display(),
            args = ?command.args,
            "Executing command"
        );

        let mut child = match spawn(&command) {
            Ok(child) => child,
            Err(e) => {
                warn!("{tool} against {target}: {e}");
                let event = CommandEvent::terminal(tool, target, started, Some(e.to_string()));
                deliver_terminal(&sink, event, cancel).await;
                return Outcome::Failed;
            }
        };
        // Captured now: tokio forgets the pid once the child is reaped, but
        // the process group may outlive its leader.
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (stdout, _) => {
                let e = ExecutionError::Pipe(if stdout.is_none() { "stdout" } else { "stderr" });
                warn!("{tool} against {target}: {e}");
                terminate(&mut child, pid).await;
                let event = CommandEvent::terminal(tool, target, started, Some(e.to_string()));
                deliver_terminal(&sink, event, cancel).await;
                return Outcome::Failed;
            }
        };

        let (pipe_tx, mut pipe_rx) = mpsc::channel(PIPE_BUFFER);
        let readers = [
            tokio::spawn(read_stdout(stdout, pipe_tx.clone())),
            tokio::spawn(read_stderr(stderr, pipe_tx)),
        ];

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut open_pipes = readers.len();
        let mut exit: Option<io::Result<ExitStatus>> = None;
        let mut stderr_surfaced = false;

        let finish = loop {
            if open_pipes == 0 {
                if let Some(status) = exit.take() {
                    break Finish::Exited(status);
                }
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Finish::Cancelled,
                _ = &mut deadline => break Finish::TimedOut,
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status);
                    continue;
                }
                msg = pipe_rx.recv(), if open_pipes > 0 => match msg {
                    Some(PipeEvent::Line(line)) => CommandEvent::output(tool, target, line),
                    Some(PipeEvent::Stderr(text)) => {
                        stderr_surfaced = true;
                        CommandEvent::stderr(tool, target, text)
                    }
                    Some(PipeEvent::Closed) => {
                        open_pipes -= 1;
                        continue;
                    }
                    None => {
                        open_pipes = 0;
                        continue;
                    }
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Finish::Cancelled,
                _ = &mut deadline => break Finish::TimedOut,
                sent = sink.send(event) => {
                    if sent.is_err() {
                        debug!("Event consumer for {tool} against {target} went away");
                        break Finish::Cancelled;
                    }
                }
            }
        };
        drop(pipe_rx);

        match finish {
            Finish::Exited(status) => {
                for reader in readers {
                    let _ = reader.await;
                }
                let (outcome, error) = match status {
                    Ok(status) if status.success() => (Outcome::Succeeded, None),
                    Ok(status) => {
                        debug!("{tool} against {target} exited with {status}");
                        (Outcome::Failed, (!stderr_surfaced).then(|| status.to_string()))
                    }
                    Err(e) => (
                        Outcome::Failed,
                        Some(format!("failed to wait for command: {e}")),
                    ),
                };
                let event = CommandEvent::terminal(tool, target, started, error);
                deliver_terminal(&sink, event, cancel).await;
                outcome
            }
            Finish::TimedOut => {
                warn!(
                    "{tool} against {target} timed out after {:?}, killing",
                    self.timeout
                );
                stop(&mut child, pid, readers).await;
                let event =
                    CommandEvent::terminal(tool, target, started, Some(TIMEOUT_MESSAGE.into()));
                deliver_terminal(&sink, event, cancel).await;
                Outcome::TimedOut
            }
            Finish::Cancelled => {
                debug!("{tool} against {target} cancelled, killing");
                stop(&mut child, pid, readers).await;
                let event =
                    CommandEvent::terminal(tool, target, started, Some(CANCELLED_MESSAGE.into()));
                let _ = sink.try_send(event);
                Outcome::Cancelled
            }
        }
    }
}

fn spawn(command: &BuiltCommand) -> Result<Child, ExecutionError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so a timeout can take down anything the tool forked.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(ExecutionError::Spawn)
}

/// The terminal event must not be lost to a full sink, but a cancelled
/// caller is not waited on.
async fn deliver_terminal(
    sink: &mpsc::Sender<CommandEvent>,
    event: CommandEvent,
    cancel: &CancellationToken,
) {
    tokio::select! {
        biased;
        sent = sink.send(event) => {
            if sent.is_err() {
                debug!("Terminal event dropped: consumer gone");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

async fn stop(child: &mut Child, pid: Option<u32>, readers: [JoinHandle<()>; 2]) {
    terminate(child, pid).await;
    for reader in readers {
        reader.abort();
        let _ = reader.await;
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);
    // Also reaps the leader.
    if let Err(e) = child.kill().await {
        debug!("kill after group signal: {e}");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("killpg({pid}) failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn read_stdout<R>(pipe: R, tx: mpsc::Sender<PipeEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_bounded_line(&mut reader, &mut buf, STDOUT_LINE_LIMIT).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() && tx.send(PipeEvent::Line(line.to_string())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("stdout read failed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(PipeEvent::Closed).await;
}

/// Like `read_until(b'\n')`, but returns once `buf` holds `limit` bytes.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(buf.len());
        }
        let room = limit.saturating_sub(buf.len());
        let window = &available[..available.len().min(room)];
        let (taken, done) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), buf.len() + window.len() >= limit),
        };
        buf.extend_from_slice(&window[..taken]);
        reader.consume(taken);
        if done {
            return Ok(buf.len());
        }
    }
}

async fn read_stderr<R>(mut pipe: R, tx: mpsc::Sender<PipeEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = STDERR_CAPTURE_LIMIT.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("stderr read failed: {e}");
                break;
            }
        }
    }

    let text = String::from_utf8_lossy(&captured);
    let text = text.trim_end();
    if !text.is_empty() && tx.send(PipeEvent::Stderr(text.to_string())).await.is_err() {
        return;
    }
    let _ = tx.send(PipeEvent::Closed).await;
}
