//! Build jobs and their lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::target::CompilationTarget;
use crate::issues::IssueRecord;

/// Compiler backends a job can be dispatched to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// No AOT compilation; the IL is copied and run as a JIT baseline.
    Jit,

    /// The legacy external compiler (`crossgen`).
    Legacy,

    /// The next-generation compiler (`crossgen2`).
    NextGen,
}

impl BackendKind {
    /// Name used for output directories and reports.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Jit => "jit",
            BackendKind::Legacy => "crossgen",
            BackendKind::NextGen => "crossgen2",
        }
    }

    /// Whether this backend runs an external compiler.
    pub fn compiles(&self) -> bool {
        !matches!(self, BackendKind::Jit)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable job identity; also the report ordering key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Compiling,
    Compiled,
    CompileFailed,
    CompileTimedOut,
    Skipped,
    Executing,
    Passed,
    ExecutionFailed,
    ExecutionTimedOut,
    Cancelled,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Compiling => "compiling",
            JobState::Compiled => "compiled",
            JobState::CompileFailed => "compile_failed",
            JobState::CompileTimedOut => "compile_timed_out",
            JobState::Skipped => "skipped",
            JobState::Executing => "executing",
            JobState::Passed => "passed",
            JobState::ExecutionFailed => "execution_failed",
            JobState::ExecutionTimedOut => "execution_timed_out",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Compiled` may advance to `Executing` or `Cancelled`; whether it is
    /// terminal depends on the job (see [`BuildJob::is_finished`]).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Compiling | Skipped | Cancelled)
                | (Compiling, Compiled | CompileFailed | CompileTimedOut | Cancelled)
                | (Compiled, Executing | Cancelled)
                | (Executing, Passed | ExecutionFailed | ExecutionTimedOut | Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to} for job {job}")]
pub struct TransitionError {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// A target bound to a backend, with its timeouts and lifecycle state.
///
/// Only the scheduler worker that owns a job mutates its state.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: JobId,
    pub target: CompilationTarget,
    pub backend: BackendKind,

    /// Root under which this job writes (`<output>/<backend>`).
    pub output_root: PathBuf,

    pub compile_timeout: Option<Duration>,
    pub execution_timeout: Option<Duration>,

    /// Run the compiled entry point after a successful compile.
    pub execute: bool,

    state: JobState,
    issue: Option<IssueRecord>,
}

impl BuildJob {
    pub fn new(
        id: JobId,
        target: CompilationTarget,
        backend: BackendKind,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            target,
            backend,
            output_root: output_root.into(),
            compile_timeout: None,
            execution_timeout: None,
            execute: false,
            state: JobState::Pending,
            issue: None,
        }
    }

    pub fn with_compile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.compile_timeout = timeout;
        self
    }

    /// Request execution. Ignored for targets without an entry point.
    pub fn with_execution(mut self, execute: bool, timeout: Option<Duration>) -> Self {
        self.execute = execute && self.target.entry_point.is_some();
        self.execution_timeout = timeout;
        self
    }

    /// Mark the job as matched by a known issue; the scheduler resolves it
    /// to `Skipped` without dispatching it.
    pub fn with_issue(mut self, issue: Option<IssueRecord>) -> Self {
        self.issue = issue;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn issue(&self) -> Option<&IssueRecord> {
        self.issue.as_ref()
    }

    pub fn is_skipped(&self) -> bool {
        self.issue.is_some()
    }

    /// Path handed to the compiler as its output.
    pub fn output_path(&self) -> PathBuf {
        self.target.output_path(&self.output_root)
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.target.artifacts(&self.output_root)
    }

    pub fn entry_artifact(&self) -> Option<PathBuf> {
        self.target.entry_artifact(&self.output_root)
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Advance the lifecycle. Terminal states never change again.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if self.is_finished() || !self.state.can_transition_to(next) {
            return Err(TransitionError {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        if next == JobState::Executing && !self.execute {
            return Err(TransitionError {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether the job has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        match self.state {
            JobState::Pending | JobState::Compiling | JobState::Executing => false,
            JobState::Compiled => !self.execute,
            _ => true,
        }
    }
}
