//! Bounded-concurrency job execution.
//!
//! A fixed pool of `P` workers pulls jobs from one shared queue. Each job is
//! compiled, then executed if requested, and its terminal [`JobResult`] is
//! sent down a single channel. A job's failure, timeout or panic only ever
//! affects that job.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{instrument, warn};

use crate::backend::{BackendAdapter, CompileOutcome};
use crate::cancel::CancelToken;
use crate::domain::job::{BackendKind, BuildJob, JobState};
use crate::domain::result::{Diagnostics, FailureKind, JobResult, JobStatus};
use crate::execution::{ExecutionOutcome, ExecutionRunner};
use crate::metrics::METRICS;
use crate::obs;

/// Number of logical cores, or 1 if unknown.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A compiler that could not be launched during the run. Reported once per
/// backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub backend: BackendKind,
    pub path: PathBuf,
    pub message: String,
}

/// Everything one scheduling pass produced.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    pub results: Vec<JobResult>,
    pub tool_errors: Vec<ToolError>,
}

struct Finished {
    result: JobResult,
    tool_error: Option<ToolError>,
}

/// Runs [`BuildJob`]s on `parallelism` workers.
#[derive(Clone)]
pub struct Scheduler {
    backend: Arc<BackendAdapter>,
    executor: Arc<ExecutionRunner>,
    parallelism: usize,
}

impl Scheduler {
    pub fn new(backend: Arc<BackendAdapter>, executor: Arc<ExecutionRunner>, parallelism: usize) -> Self {
        Self {
            backend,
            executor,
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run every job to a terminal status.
    ///
    /// Returns exactly one result per job, in completion order. Skipped jobs
    /// are resolved before any worker starts; once `cancel` fires, jobs still
    /// queued resolve to `Cancelled`.
    #[instrument(skip_all, fields(jobs = jobs.len(), parallelism = self.parallelism))]
    pub async fn run(&self, jobs: Vec<BuildJob>, cancel: &CancelToken) -> ScheduleOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<Finished>();

        let mut queue = VecDeque::with_capacity(jobs.len());
        for mut job in jobs {
            if job.is_skipped() {
                if let Err(e) = job.transition(JobState::Skipped) {
                    warn!(error = %e, "skip transition rejected");
                }
                METRICS.inc_skipped();
                let result = JobResult::for_job(&job, JobStatus::Skipped);
                let _ = tx.send(Finished {
                    result,
                    tool_error: None,
                });
            } else {
                queue.push_back(job);
            }
        }

        let queue = Arc::new(Mutex::new(queue));
        let mut workers = Vec::with_capacity(self.parallelism);
        for worker in 0..self.parallelism {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let backend = Arc::clone(&self.backend);
            let executor = Arc::clone(&self.executor);

            workers.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(job) = next else { break };

                    let fallback = JobResult::for_job(&job, JobStatus::CompileFailed);
                    let finished = AssertUnwindSafe(process(job, &backend, &executor, &cancel))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let message = panic_message(panic.as_ref());
                            warn!(worker, job = %fallback.job_id, panic = %message, "job panicked");
                            METRICS.inc_compile_failed();
                            Finished {
                                result: JobResult {
                                    failure: Some(FailureKind::Internal),
                                    compile: Some(Diagnostics::message(String::new(), message)),
                                    ..fallback
                                },
                                tool_error: None,
                            }
                        });
                    if tx.send(finished).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut outcome = ScheduleOutcome::default();
        while let Some(finished) = rx.recv().await {
            if let Some(tool_error) = finished.tool_error {
                outcome.tool_errors.push(tool_error);
            }
            outcome.results.push(finished.result);
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task failed");
            }
        }

        // Only reachable after cancellation: workers drain the queue otherwise.
        let leftover: Vec<BuildJob> = queue.lock().await.drain(..).collect();
        for mut job in leftover {
            if let Err(e) = job.transition(JobState::Cancelled) {
                warn!(error = %e, "cancel transition rejected");
            }
            METRICS.inc_cancelled();
            outcome.results.push(JobResult::for_job(&job, JobStatus::Cancelled));
        }

        outcome
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

fn advance(job: &mut BuildJob, next: JobState) {
    if let Err(e) = job.transition(next) {
        warn!(error = %e, "illegal job transition");
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Compile and optionally execute one job.
async fn process(
    mut job: BuildJob,
    backend: &BackendAdapter,
    executor: &ExecutionRunner,
    cancel: &CancelToken,
) -> Finished {
    obs::emit_job_dispatched(job.id, &job.target.name, job.backend);
    METRICS.inc_dispatched();
    advance(&mut job, JobState::Compiling);

    let mut result = JobResult::for_job(&job, JobStatus::Cancelled);
    let mut tool_error = None;

    let compiled = backend.compile(&job, cancel).await;
    result.compile_ms = Some(millis(compiled.elapsed()));
    match compiled {
        CompileOutcome::Success {
            diagnostics, dump, ..
        } => {
            result.compile = diagnostics;
            result.dump = dump;
            advance(&mut job, JobState::Compiled);
        }
        CompileOutcome::ToolFailure { diagnostics, .. } => {
            result.compile = Some(diagnostics);
            result.failure = Some(FailureKind::ToolFailure);
            METRICS.inc_compile_failed();
            advance(&mut job, JobState::CompileFailed);
        }
        CompileOutcome::ToolNotFound {
            backend: kind,
            path,
            first,
        } => {
            let message = format!("{kind} compiler not found at {}", path.display());
            if first {
                obs::emit_tool_missing(kind, &path);
                tool_error = Some(ToolError {
                    backend: kind,
                    path: path.clone(),
                    message: message.clone(),
                });
            }
            result.compile = Some(Diagnostics::message(path.display().to_string(), message));
            result.failure = Some(FailureKind::ToolNotFound);
            result.compile_ms = None;
            METRICS.inc_compile_failed();
            advance(&mut job, JobState::CompileFailed);
        }
        CompileOutcome::TimedOut { diagnostics, .. } => {
            result.compile = Some(diagnostics);
            METRICS.inc_compile_timed_out();
            advance(&mut job, JobState::CompileTimedOut);
        }
        CompileOutcome::Cancelled { .. } => {
            advance(&mut job, JobState::Cancelled);
        }
    }

    if job.state() == JobState::Compiled && job.execute {
        if cancel.is_cancelled() {
            advance(&mut job, JobState::Cancelled);
        } else {
            advance(&mut job, JobState::Executing);
            let report = executor.run_job(&job, cancel).await;
            result.execution_ms = Some(millis(report.elapsed));
            result.trace = report.trace;
            result.failure = report.outcome.failure_kind().or(result.failure);
            result.execution = Some(report.diagnostics);
            let next = match report.outcome {
                ExecutionOutcome::Passed => JobState::Passed,
                ExecutionOutcome::TimedOut => {
                    METRICS.inc_execution_timed_out();
                    JobState::ExecutionTimedOut
                }
                ExecutionOutcome::Cancelled => JobState::Cancelled,
                ExecutionOutcome::NonZeroExit(_)
                | ExecutionOutcome::Crashed(_)
                | ExecutionOutcome::LaunchFailed(_) => {
                    METRICS.inc_execution_failed();
                    JobState::ExecutionFailed
                }
            };
            advance(&mut job, next);
        }
    }

    result.status = JobStatus::from_state(job.state()).unwrap_or(JobStatus::CompileFailed);
    if result.status == JobStatus::Cancelled {
        METRICS.inc_cancelled();
    }
    let elapsed = result.compile_ms.unwrap_or(0) + result.execution_ms.unwrap_or(0);
    obs::emit_job_finished(job.id, &job.target.name, job.backend, result.status, elapsed);

    Finished { result, tool_error }
}
