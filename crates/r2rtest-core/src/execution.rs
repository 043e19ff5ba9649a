//! Running compiled programs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::job::{BackendKind, BuildJob};
use crate::domain::result::{tail, Diagnostics, FailureKind};
use crate::process::{CommandSpec, ProcessOutcome, ProcessRunner};

/// Exit code a test program returns on success unless configured otherwise.
pub const DEFAULT_EXPECTED_EXIT_CODE: i32 = 0;

/// How compiled programs are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Runtime host (`corerun`). Without one the artifact is launched
    /// directly.
    pub host: Option<PathBuf>,

    pub core_root: Option<PathBuf>,

    /// Value for `DOTNET_GCStress`, passed through untouched.
    pub gc_stress: Option<String>,

    pub expected_exit_code: i32,

    /// Extra environment for every program.
    pub env: Vec<(String, String)>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            host: None,
            core_root: None,
            gc_stress: None,
            expected_exit_code: DEFAULT_EXPECTED_EXIT_CODE,
            env: Vec::new(),
        }
    }
}

/// How one program run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Passed,
    NonZeroExit(i32),
    Crashed(i32),
    TimedOut,
    Cancelled,
    LaunchFailed(String),
}

impl ExecutionOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExecutionOutcome::NonZeroExit(_) => Some(FailureKind::NonZeroExit),
            ExecutionOutcome::Crashed(_) => Some(FailureKind::Crashed),
            ExecutionOutcome::LaunchFailed(_) => Some(FailureKind::LaunchFailed),
            _ => None,
        }
    }
}

/// An execution outcome with what is needed to reproduce it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub diagnostics: Diagnostics,
    pub elapsed: Duration,
    pub trace: Option<TraceSummary>,
}

/// What a finished trace session produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceSummary {
    pub trace_file: PathBuf,
    pub bytes: u64,
}

/// Handle for an attached trace session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSession {
    pub trace_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace capture unavailable: {0}")]
    Unavailable(String),

    #[error("trace file {path} missing: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Side-channel trace producer wrapped around one program run.
#[async_trait]
pub trait TraceCapture: Send + Sync {
    /// Prepare `command` for tracing before it is launched.
    async fn attach(&self, artifact: &Path, command: &mut CommandSpec) -> Result<TraceSession, TraceError>;

    /// Collect the trace after the program exits.
    async fn detach(&self, session: TraceSession) -> Result<TraceSummary, TraceError>;
}

/// Traces through the runtime's EventPipe, configured by environment.
#[derive(Debug, Clone)]
pub struct EventPipeCapture {
    pub providers: String,
}

impl Default for EventPipeCapture {
    fn default() -> Self {
        Self {
            providers: "Microsoft-Windows-DotNETRuntime:0x4c14fccbd:5".to_string(),
        }
    }
}

#[async_trait]
impl TraceCapture for EventPipeCapture {
    async fn attach(&self, artifact: &Path, command: &mut CommandSpec) -> Result<TraceSession, TraceError> {
        let mut trace = artifact.as_os_str().to_owned();
        trace.push(".nettrace");
        let trace_file = PathBuf::from(trace);
        command.env.insert("DOTNET_EnableEventPipe".into(), "1".into());
        command.env.insert(
            "DOTNET_EventPipeOutputPath".into(),
            trace_file.display().to_string(),
        );
        command
            .env
            .insert("DOTNET_EventPipeConfig".into(), self.providers.clone());
        Ok(TraceSession { trace_file })
    }

    async fn detach(&self, session: TraceSession) -> Result<TraceSummary, TraceError> {
        let meta = tokio::fs::metadata(&session.trace_file)
            .await
            .map_err(|source| TraceError::Missing {
                path: session.trace_file.clone(),
                source,
            })?;
        Ok(TraceSummary {
            trace_file: session.trace_file,
            bytes: meta.len(),
        })
    }
}

/// Launches compiled artifacts under the execution timeout.
pub struct ExecutionRunner {
    config: ExecutionConfig,
    runner: Arc<dyn ProcessRunner>,
    trace: Option<Arc<dyn TraceCapture>>,
}

impl ExecutionRunner {
    pub fn new(config: ExecutionConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config,
            runner,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<Arc<dyn TraceCapture>>) -> Self {
        self.trace = trace;
        self
    }

    /// The command that runs `artifact` for a job on `backend`.
    pub fn command(&self, artifact: &Path, backend: BackendKind) -> CommandSpec {
        let mut cmd = match &self.config.host {
            Some(host) => CommandSpec::new(host).arg(artifact.to_string_lossy()),
            None => CommandSpec::new(artifact),
        };
        if let Some(dir) = artifact.parent() {
            cmd = cmd.current_dir(dir);
        }
        if let Some(core_root) = &self.config.core_root {
            cmd = cmd.env("CORE_ROOT", core_root.display().to_string());
        }
        if let Some(stress) = &self.config.gc_stress {
            cmd = cmd.env("DOTNET_GCStress", stress.clone());
        }
        let r2r = if backend == BackendKind::Jit { "0" } else { "1" };
        cmd = cmd.env("DOTNET_ReadyToRun", r2r);
        for (k, v) in &self.config.env {
            cmd = cmd.env(k.clone(), v.clone());
        }
        cmd
    }

    /// Run the job's entry artifact.
    pub async fn run_job(&self, job: &BuildJob, cancel: &CancelToken) -> ExecutionReport {
        match job.entry_artifact() {
            Some(artifact) => self.run(&artifact, job.backend, job.execution_timeout, cancel).await,
            None => ExecutionReport {
                outcome: ExecutionOutcome::LaunchFailed("target has no entry point".to_string()),
                diagnostics: Diagnostics::message(String::new(), "target has no entry point"),
                elapsed: Duration::ZERO,
                trace: None,
            },
        }
    }

    pub async fn run(
        &self,
        artifact: &Path,
        backend: BackendKind,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> ExecutionReport {
        let mut cmd = self.command(artifact, backend);

        let session = match &self.trace {
            Some(trace) => match trace.attach(artifact, &mut cmd).await {
                Ok(session) => Some((trace.clone(), session)),
                Err(e) => {
                    warn!(artifact = %artifact.display(), error = %e, "trace attach failed");
                    None
                }
            },
            None => None,
        };

        let command_line = cmd.display();
        debug!(command = %command_line, "executing");
        let (outcome, diagnostics, elapsed) = match self.runner.invoke(&cmd, timeout, cancel).await {
            Ok(ProcessOutcome::Exited(out)) => {
                let outcome = match (out.exit_code, out.signal) {
                    (Some(code), _) if code == self.config.expected_exit_code => ExecutionOutcome::Passed,
                    (Some(code), _) => ExecutionOutcome::NonZeroExit(code),
                    (None, Some(signal)) => ExecutionOutcome::Crashed(signal),
                    (None, None) => ExecutionOutcome::Crashed(0),
                };
                let diag = Diagnostics {
                    command_line,
                    exit_code: out.exit_code,
                    signal: out.signal,
                    stdout: tail(&out.stdout),
                    stderr: tail(&out.stderr),
                    message: None,
                };
                (outcome, diag, out.elapsed)
            }
            Ok(ProcessOutcome::TimedOut { elapsed, stdout, stderr }) => {
                let diag = Diagnostics {
                    command_line,
                    stdout: tail(&stdout),
                    stderr: tail(&stderr),
                    message: Some("execution timed out".to_string()),
                    ..Diagnostics::default()
                };
                (ExecutionOutcome::TimedOut, diag, elapsed)
            }
            Ok(ProcessOutcome::Cancelled { elapsed }) => (
                ExecutionOutcome::Cancelled,
                Diagnostics::message(command_line, "cancelled"),
                elapsed,
            ),
            Err(e) => {
                let msg = format!("failed to launch: {e}");
                (
                    ExecutionOutcome::LaunchFailed(msg.clone()),
                    Diagnostics::message(command_line, msg),
                    Duration::ZERO,
                )
            }
        };

        let trace = match session {
            Some((capture, session)) => match capture.detach(session).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(artifact = %artifact.display(), error = %e, "trace collection failed");
                    None
                }
            },
            None => None,
        };

        ExecutionReport {
            outcome,
            diagnostics,
            elapsed,
            trace,
        }
    }
}
