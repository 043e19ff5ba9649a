//! r2rtest Core Library
//!
//! Orchestrates ahead-of-time compilation and execution of managed
//! assemblies: discovery, known-issue suppression, backend invocation,
//! bounded-concurrency scheduling, execution and reporting.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod execution;
pub mod fakes;
pub mod harness;
pub mod issues;
pub mod metrics;
pub mod obs;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod telemetry;

pub use backend::{BackendAdapter, BackendConfig, CompileOptions, CompileOutcome, Invocation};
pub use cancel::{CancelSource, CancelToken};
pub use config::{BackendSelection, HarnessConfig};
pub use discovery::{
    DiscoveredSet, Discoverer, DiscoveryMode, DiscoveryOptions, PathMapEntry, PathRewrite,
    ResponseFile,
};
pub use domain::{
    BackendKind, BuildJob, CompilationTarget, Diagnostics, FailureKind, JobId, JobResult,
    JobState, JobStatus, ModeFlags, TargetOrigin, TransitionError,
};
pub use error::{BackendError, ConfigError, DiscoveryError, HarnessError, IssueError, Result};
pub use execution::{
    EventPipeCapture, ExecutionConfig, ExecutionOutcome, ExecutionReport, ExecutionRunner,
    TraceCapture, TraceError, TraceSession, TraceSummary,
};
pub use harness::{Harness, RunOutcome};
pub use issues::{Classification, IssueFilter, IssueRecord, MatchMode};
pub use process::{CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use report::{Aggregator, FailureEntry, PerfEntry, ReportArtifacts, RunCounts, RunReport};
pub use scheduler::{default_parallelism, ScheduleOutcome, Scheduler, ToolError};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
