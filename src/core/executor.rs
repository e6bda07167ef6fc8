//! Executor
//!
//! Runs commands the gate accepted. The command line is split into an
//! argument vector and spawned directly; no shell is involved at any point,
//! so the metacharacters the gate refuses never get a second interpretation.
//!
//! Output is drained on background threads while the caller waits, each
//! stream bounded by `max_output_bytes`. The wait is sliced so that both the
//! timeout and an operator interrupt can terminate the child promptly.
//!
//! On unix the child leads its own process group. Terminal interrupts reach
//! only ledgate, and timeout or cancellation kills the whole group, so
//! anything the command forked goes down with it.

use crate::core::cancel::CancelToken;
use crate::core::config::ExecutorConfig;
use crate::core::gate::Command;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8 * 1024;
/// How long to keep collecting output once the command is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: Command,
    pub status: ExecutionStatus,
    /// `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == 0
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NotFound,
    PermissionDenied,
    InvalidArguments,
    SpawnFailed,
    WaitFailed,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NotFound => "NOT_FOUND",
            FailureReason::PermissionDenied => "PERMISSION_DENIED",
            FailureReason::InvalidArguments => "INVALID_ARGUMENTS",
            FailureReason::SpawnFailed => "SPAWN_FAILED",
            FailureReason::WaitFailed => "WAIT_FAILED",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The command never produced an exit status of its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct ExecutionFailure {
    pub command: Command,
    pub reason: FailureReason,
    pub message: String,
}

/// Ambient process state supplied by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExecContext {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
    max_output_bytes: usize,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn with_limits(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    /// Run an accepted command to completion, timeout or cancellation.
    pub fn run(
        &self,
        command: &Command,
        context: &ExecContext,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let argv = split_args(&command.raw).ok_or_else(|| ExecutionFailure {
            command: command.clone(),
            reason: FailureReason::InvalidArguments,
            message: "could not split command line (unbalanced quotes?)".to_string(),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutionFailure {
                command: command.clone(),
                reason: FailureReason::InvalidArguments,
                message: "command line has no program".to_string(),
            });
        };

        let mut builder = std::process::Command::new(program);
        builder
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &context.cwd {
            builder.current_dir(cwd);
        }
        for (key, value) in &context.env {
            builder.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }

        let start = Instant::now();
        let mut child = builder.spawn().map_err(|e| spawn_failure(command, program, e))?;
        tracing::info!(program = %program, pid = child.id(), "spawned command");

        let stdout = Capture::spawn(child.stdout.take(), self.max_output_bytes);
        let stderr = Capture::spawn(child.stderr.take(), self.max_output_bytes);

        let waited = self.wait(&mut child, start, cancel);

        let drain_deadline = Instant::now() + DRAIN_GRACE;
        if !(stdout.wait_until(drain_deadline) && stderr.wait_until(drain_deadline)) {
            // Something the command forked still holds the pipes.
            kill_group(&child);
        }
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        let stdout = stdout.finish(drain_deadline);
        let stderr = stderr.finish(drain_deadline);

        let (status, exit_status) = waited.map_err(|e| ExecutionFailure {
            command: command.clone(),
            reason: FailureReason::WaitFailed,
            message: e.to_string(),
        })?;

        let result = ExecutionResult {
            command: command.clone(),
            status,
            exit_code: exit_status.and_then(|s| s.code()).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            program = %program,
            status = result.status.as_str(),
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "command finished"
        );
        Ok(result)
    }

    fn wait(
        &self,
        child: &mut Child,
        start: Instant,
        cancel: &CancelToken,
    ) -> io::Result<(ExecutionStatus, Option<std::process::ExitStatus>)> {
        // A timeout too large to represent is no deadline at all.
        let deadline = start.checked_add(self.timeout);
        loop {
            if cancel.is_cancelled() {
                tracing::warn!(pid = child.id(), "command cancelled by operator");
                return Ok((ExecutionStatus::Cancelled, terminate(child)));
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                tracing::warn!(pid = child.id(), timeout = ?self.timeout, "command timed out");
                return Ok((ExecutionStatus::TimedOut, terminate(child)));
            }
            let slice = deadline.map_or(POLL_INTERVAL, |d| POLL_INTERVAL.min(d - now));
            match child.wait_timeout(slice) {
                // The interrupt may have reached the child before we saw the token.
                Ok(Some(status)) if cancel.is_cancelled() => {
                    tracing::warn!(pid = child.id(), "command cancelled by operator");
                    kill_group(child);
                    return Ok((ExecutionStatus::Cancelled, Some(status)));
                }
                Ok(Some(status)) => return Ok((ExecutionStatus::Completed, Some(status))),
                Ok(None) => continue,
                Err(e) => {
                    let _ = terminate(child);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(&ExecutorConfig::default())
    }
}

/// POSIX-style word splitting; `None` on unbalanced quotes.
pub fn split_args(raw: &str) -> Option<Vec<String>> {
    shlex::split(raw)
}

fn spawn_failure(command: &Command, program: &str, e: io::Error) -> ExecutionFailure {
    let reason = match e.kind() {
        io::ErrorKind::NotFound => FailureReason::NotFound,
        io::ErrorKind::PermissionDenied => FailureReason::PermissionDenied,
        _ => FailureReason::SpawnFailed,
    };
    tracing::warn!(program = %program, reason = reason.as_str(), error = %e, "spawn failed");
    ExecutionFailure {
        command: command.clone(),
        reason,
        message: format!("failed to start '{}': {}", program, e),
    }
}

fn terminate(child: &mut Child) -> Option<std::process::ExitStatus> {
    kill_group(child);
    let _ = child.kill();
    child.wait().ok()
}

/// SIGKILL the child's process group.
#[cfg(unix)]
fn kill_group(child: &Child) {
    // The child was spawned with `process_group(0)`, so its pid is the pgid.
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg takes plain integers; ESRCH for an empty group is ignored.
    let _ = unsafe { libc::killpg(pgid, libc::SIGKILL) };
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// One output stream drained on a background thread into a shared buffer,
/// so partial output survives even if the reader has to be left behind.
struct Capture {
    shared: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>, limit: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let Ok(mut captured) = sink.lock() else {
                            break;
                        };
                        let room = limit.saturating_sub(captured.bytes.len());
                        let take = room.min(n);
                        captured.bytes.extend_from_slice(&buf[..take]);
                        // Keep draining so the child never blocks on a full pipe.
                        if take < n {
                            captured.truncated = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        Self { shared, handle }
    }

    /// True once the stream hit end of file, polling until `deadline`.
    fn wait_until(&self, deadline: Instant) -> bool {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.handle.is_finished()
    }

    /// Wait for end of stream until `deadline`, then take what was read.
    fn finish(self, deadline: Instant) -> Captured {
        if self.wait_until(deadline) {
            let _ = self.handle.join();
        } else {
            tracing::warn!("output stream still open after the command ended, keeping partial output");
        }
        self.shared
            .lock()
            .map(|mut captured| std::mem::take(&mut *captured))
            .unwrap_or_default()
    }
}
