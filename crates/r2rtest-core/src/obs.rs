//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for run start/finish, job dispatch/finish and
//!   missing tools
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::{info, warn};

use crate::domain::job::{BackendKind, JobId};
use crate::domain::result::JobStatus;

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// ```ignore
/// let _span = RunSpan::enter("0b5e...");
/// // every event below carries run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("r2rtest.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, mode: &str, jobs: usize, parallelism: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        mode = %mode,
        jobs = jobs,
        parallelism = parallelism,
    );
}

/// Emit event: run finished with duration, totals and verdict.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, total: usize, failed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total = total,
        failed = failed,
        success = success,
    );
}

/// Emit event: a worker picked a job up.
pub fn emit_job_dispatched(job: JobId, target: &str, backend: BackendKind) {
    info!(event = "job.dispatched", job = %job, target = %target, backend = %backend);
}

/// Emit event: a job reached its terminal status.
pub fn emit_job_finished(job: JobId, target: &str, backend: BackendKind, status: JobStatus, elapsed_ms: u64) {
    info!(
        event = "job.finished",
        job = %job,
        target = %target,
        backend = %backend,
        status = %status,
        elapsed_ms = elapsed_ms,
    );
}

/// Emit event: a compiler could not be launched (warning level).
pub fn emit_tool_missing(backend: BackendKind, path: &std::path::Path) {
    warn!(event = "tool.missing", backend = %backend, path = %path.display());
}
