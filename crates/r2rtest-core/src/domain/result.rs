//! Terminal job records.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::job::{BackendKind, BuildJob, JobId, JobState};
use crate::execution::TraceSummary;
use crate::issues::IssueRecord;

/// Maximum bytes of stdout/stderr retained per stream.
pub const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Compiled; execution not requested or not applicable.
    Compiled,
    /// Compiled and executed successfully.
    Passed,
    CompileFailed,
    CompileTimedOut,
    ExecutionFailed,
    ExecutionTimedOut,
    Skipped,
    Cancelled,
}

impl JobStatus {
    /// Map a finished lifecycle state to its status.
    pub fn from_state(state: JobState) -> Option<Self> {
        match state {
            JobState::Compiled => Some(JobStatus::Compiled),
            JobState::Passed => Some(JobStatus::Passed),
            JobState::CompileFailed => Some(JobStatus::CompileFailed),
            JobState::CompileTimedOut => Some(JobStatus::CompileTimedOut),
            JobState::ExecutionFailed => Some(JobStatus::ExecutionFailed),
            JobState::ExecutionTimedOut => Some(JobStatus::ExecutionTimedOut),
            JobState::Skipped => Some(JobStatus::Skipped),
            JobState::Cancelled => Some(JobStatus::Cancelled),
            JobState::Pending | JobState::Compiling | JobState::Executing => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Compiled => "compiled",
            JobStatus::Passed => "passed",
            JobStatus::CompileFailed => "compile_failed",
            JobStatus::CompileTimedOut => "compile_timed_out",
            JobStatus::ExecutionFailed => "execution_failed",
            JobStatus::ExecutionTimedOut => "execution_timed_out",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Compiled | JobStatus::Passed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobStatus::CompileTimedOut | JobStatus::ExecutionTimedOut)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::CompileFailed | JobStatus::ExecutionFailed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a failed job failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The compiler exited with a nonzero code.
    ToolFailure,
    /// The compiler binary could not be launched.
    ToolNotFound,
    /// The compiled program exited with an unexpected code.
    NonZeroExit,
    /// The compiled program was killed by a signal.
    Crashed,
    /// The compiled program could not be started.
    LaunchFailed,
    /// Harness-side failure while preparing or running the job.
    Internal,
}

/// Everything needed to reproduce one subprocess invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostics {
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub message: Option<String>,
}

impl Diagnostics {
    pub fn message(command_line: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Short one-line description for logs and summaries.
    pub fn headline(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("killed by signal {sig}"),
            (None, None) => "no exit status".to_string(),
        }
    }
}

/// Keep the last `OUTPUT_TAIL_BYTES` of captured output, on a char boundary.
pub fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Terminal record for one [`BuildJob`]. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub target: String,
    pub backend: BackendKind,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub compile_ms: Option<u64>,
    pub execution_ms: Option<u64>,
    pub compile: Option<Diagnostics>,
    pub execution: Option<Diagnostics>,
    pub issue: Option<IssueRecord>,
    pub dump: Option<PathBuf>,
    pub trace: Option<TraceSummary>,
}

impl JobResult {
    /// A result carrying only the job's identity and the given status.
    pub fn for_job(job: &BuildJob, status: JobStatus) -> Self {
        Self {
            job_id: job.id,
            target: job.target.name.clone(),
            backend: job.backend,
            inputs: job.target.inputs.clone(),
            output: job.output_path(),
            status,
            failure: None,
            compile_ms: None,
            execution_ms: None,
            compile: None,
            execution: None,
            issue: job.issue().cloned(),
            dump: None,
            trace: None,
        }
    }

    /// The diagnostics of whichever phase decided the outcome.
    pub fn deciding_diagnostics(&self) -> Option<&Diagnostics> {
        match self.status {
            JobStatus::ExecutionFailed | JobStatus::ExecutionTimedOut => self.execution.as_ref(),
            _ => self.compile.as_ref(),
        }
    }

    /// Elapsed time of the deciding phase.
    pub fn deciding_elapsed_ms(&self) -> Option<u64> {
        match self.status {
            JobStatus::ExecutionFailed | JobStatus::ExecutionTimedOut | JobStatus::Passed => {
                self.execution_ms
            }
            _ => self.compile_ms,
        }
    }
}
