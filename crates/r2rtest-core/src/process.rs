//! Subprocess invocation capability.
//!
//! Compilers and compiled programs are both reached through
//! [`ProcessRunner::invoke`], so the scheduler never touches a concrete
//! process API. [`TokioProcessRunner`] is the production implementation;
//! [`crate::fakes::ScriptedProcessRunner`] stands in for it in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// How long to keep draining pipes after a child was killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A fully specified command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for reports: `KEY=value program arg ...`.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v)))
            .collect();
        parts.push(quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ProcessOutput),

    /// The timeout expired; the process was killed and reaped.
    TimedOut {
        elapsed: Duration,
        stdout: String,
        stderr: String,
    },

    /// The run was cancelled; the process was killed and reaped.
    Cancelled { elapsed: Duration },
}

/// Launch a command and wait for it under a timeout and a cancellation
/// token.
///
/// Implementations must guarantee that a `TimedOut` or `Cancelled` outcome
/// means the process no longer runs. Spawn failures are returned as
/// `io::Error`; `ErrorKind::NotFound` means the program does not exist.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn invoke(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<ProcessOutcome>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn invoke(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<ProcessOutcome> {
        let start = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(pid = ?pid, program = %command.program.display(), "spawned");

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status?),
            _ = deadline => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(status) => {
                let stdout = drain(stdout_task).await;
                let stderr = drain(stderr_task).await;
                Ok(ProcessOutcome::Exited(ProcessOutput {
                    exit_code: status.code(),
                    signal: exit_signal(&status),
                    stdout,
                    stderr,
                    elapsed: start.elapsed(),
                }))
            }
            Waited::TimedOut => {
                terminate(&mut child, pid).await;
                let stdout = drain(stdout_task).await;
                let stderr = drain(stderr_task).await;
                Ok(ProcessOutcome::TimedOut {
                    elapsed: start.elapsed(),
                    stdout,
                    stderr,
                })
            }
            Waited::Cancelled => {
                terminate(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(ProcessOutcome::Cancelled {
                    elapsed: start.elapsed(),
                })
            }
        }
    }
}

/// Kill the child and reap it so no orphan survives.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        // Already exited between the select and the kill.
        debug!(pid = ?pid, error = %e, "kill skipped");
    }
    match child.wait().await {
        Ok(status) => debug!(pid = ?pid, status = %status, "terminated"),
        Err(e) => warn!(pid = ?pid, error = %e, "failed to reap killed process"),
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Collect a pipe reader, giving up if a grandchild keeps the pipe open.
async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Whether `path` names an existing file.
pub fn tool_exists(path: &Path) -> bool {
    path.is_file()
}
