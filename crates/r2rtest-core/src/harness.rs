//! The end-to-end run pipeline.
//!
//! discover -> classify -> build jobs -> schedule (framework phase, then
//! applications) -> aggregate -> write artifacts -> clean up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::backend::BackendAdapter;
use crate::cancel::CancelToken;
use crate::config::HarnessConfig;
use crate::discovery::{DiscoveredSet, Discoverer, DiscoveryMode, FRAMEWORK_TARGET};
use crate::domain::job::{BackendKind, BuildJob, JobId};
use crate::domain::target::{CompilationTarget, TargetOrigin};
use crate::error::{ConfigError, Result};
use crate::execution::{EventPipeCapture, ExecutionRunner, TraceCapture};
use crate::issues::IssueFilter;
use crate::metrics::METRICS;
use crate::obs;
use crate::process::{ProcessRunner, TokioProcessRunner};
use crate::report::{Aggregator, ReportArtifacts, RunReport};
use crate::scheduler::{ScheduleOutcome, Scheduler};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub artifacts: ReportArtifacts,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code()
    }
}

/// Drives one run from a [`HarnessConfig`].
pub struct Harness {
    config: HarnessConfig,
    run_id: Uuid,
    runner: Arc<dyn ProcessRunner>,
    trace: Option<Arc<dyn TraceCapture>>,
}

impl Harness {
    /// A harness that spawns real processes, tracing through EventPipe when
    /// `config.trace` is set.
    pub fn new(config: HarnessConfig) -> Self {
        let trace: Option<Arc<dyn TraceCapture>> = if config.trace {
            Some(Arc::new(EventPipeCapture::default()))
        } else {
            None
        };
        Self {
            config,
            run_id: Uuid::new_v4(),
            runner: Arc::new(TokioProcessRunner),
            trace,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_trace(mut self, trace: Option<Arc<dyn TraceCapture>>) -> Self {
        self.trace = trace;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Execute the run. Errors only for setup problems; every job outcome
    /// lands in the report.
    pub async fn run(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        let span = tracing::info_span!("r2rtest.harness", run_id = %self.run_id);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let run_id = self.run_id.to_string();

        let mut config = self.config.clone();
        config.apply_core_root_defaults();
        config.validate()?;

        let (framework, apps) = self.discover(&config)?;
        if config.backends.legacy {
            reject_composite(framework.iter().chain(apps.iter()))?;
        }
        let issues = IssueFilter::load(&config.issues, config.match_mode)?;
        debug!(records = issues.len(), "known issues loaded");

        let backends = config.enabled_backends();
        let adapter = BackendAdapter::new(config.tools.clone(), config.compile.clone(), Arc::clone(&self.runner));
        adapter.preflight(&backends)?;

        let mut next_id = 0usize;
        let framework_jobs = framework
            .as_ref()
            .map(|set| build_jobs(&config, set, &backends, &issues, &mut next_id))
            .unwrap_or_default();
        let app_jobs = apps
            .as_ref()
            .map(|set| build_jobs(&config, set, &backends, &issues, &mut next_id))
            .unwrap_or_default();

        let cleanup: HashMap<JobId, Vec<PathBuf>> = framework_jobs
            .iter()
            .chain(app_jobs.iter())
            .map(|j| (j.id, cleanup_paths(j)))
            .collect();

        let parallelism = config.effective_parallelism();
        obs::emit_run_started(&run_id, config.mode_name(), next_id, parallelism);

        let executor = ExecutionRunner::new(config.execution.clone(), Arc::clone(&self.runner))
            .with_trace(self.trace.clone());
        let scheduler = Scheduler::new(Arc::new(adapter), Arc::new(executor), parallelism);

        let path_map = apps.map(|s| s.path_map).unwrap_or_default();
        let mut aggregator = Aggregator::new(self.run_id, started_at)
            .with_perf(config.measure_perf)
            .with_path_map(path_map);

        for (phase, jobs) in [("framework", framework_jobs), ("applications", app_jobs)] {
            if jobs.is_empty() {
                continue;
            }
            info!(phase, jobs = jobs.len(), "scheduling phase");
            let ScheduleOutcome {
                results,
                tool_errors,
            } = scheduler.run(jobs, cancel).await;
            aggregator.extend(results);
            for e in tool_errors {
                aggregator.push_tool_error(e);
            }
        }

        let report = aggregator.finalize();
        let artifacts = report.write_artifacts(&config.output)?;
        info!(
            report = %artifacts.json.display(),
            digest = %artifacts.digest,
            "report written"
        );

        METRICS.flush();
        obs::emit_run_finished(
            &run_id,
            clock.elapsed().as_millis() as u64,
            report.counts.total,
            report.failures.len(),
            report.is_success(),
        );

        if !config.no_cleanup {
            remove_successful_outputs(&report, &cleanup).await;
        }

        Ok(RunOutcome { report, artifacts })
    }

    /// Framework targets (if any) and application targets (if any).
    fn discover(&self, config: &HarnessConfig) -> Result<(Option<DiscoveredSet>, Option<DiscoveredSet>)> {
        let mut app_options = config.discovery_options();
        if let Some(core_root) = &config.core_root {
            app_options.reference_paths.push(core_root.clone());
        }

        let framework_options = {
            let mut o = config.discovery_options();
            o.filter = None;
            o.managed_only = true;
            o.modes.use_framework = false;
            o.reference_paths = config.core_root.iter().cloned().collect();
            o
        };

        if config.mode == DiscoveryMode::Framework {
            let root = config.core_root.clone().unwrap_or_else(|| config.input.clone());
            let mut options = framework_options;
            options.filter = config.filter.clone();
            let set = Discoverer::new(root, DiscoveryMode::Framework, options).discover()?;
            return Ok((Some(set), None));
        }

        let framework = match (&config.core_root, config.precompile_framework) {
            (Some(core_root), true) => Some(
                Discoverer::new(core_root, DiscoveryMode::Framework, framework_options).discover()?,
            ),
            _ => None,
        };
        let apps = Discoverer::new(&config.input, config.mode.clone(), app_options).discover()?;
        Ok((framework, Some(apps)))
    }
}

/// Response files can ask for composite output on their own; the legacy
/// compiler cannot produce it, so the run stops before anything is queued.
fn reject_composite<'a>(sets: impl Iterator<Item = &'a DiscoveredSet>) -> Result<()> {
    if let Some(target) = sets.flat_map(DiscoveredSet::iter).find(|t| t.is_composite()) {
        return Err(ConfigError::Invalid(format!(
            "target {} is composite, which the legacy compiler does not support",
            target.name
        ))
        .into());
    }
    Ok(())
}

/// One job per target and backend. Framework targets never run and have no
/// JIT baseline.
fn build_jobs(
    config: &HarnessConfig,
    set: &DiscoveredSet,
    backends: &[BackendKind],
    issues: &IssueFilter,
    next_id: &mut usize,
) -> Vec<BuildJob> {
    let mut jobs = Vec::new();
    for target in set.iter() {
        let classification = issues.classify(target);
        let framework = target.origin == TargetOrigin::Framework;

        for &backend in backends {
            if framework && backend == BackendKind::Jit {
                continue;
            }
            let root = config.backend_root(backend);
            let target = with_framework_reference(target, &root, backend);
            let job = BuildJob::new(JobId(*next_id), target, backend, root)
                .with_compile_timeout(config.compile_timeout())
                .with_execution(config.execute && !framework, config.execution_timeout())
                .with_issue(classification.record.clone());
            *next_id += 1;
            jobs.push(job);
        }
    }
    jobs
}

fn with_framework_reference(
    target: &CompilationTarget,
    backend_root: &std::path::Path,
    backend: BackendKind,
) -> CompilationTarget {
    let mut target = target.clone();
    if target.modes.use_framework && backend.compiles() && target.origin == TargetOrigin::Application {
        target
            .reference_paths
            .insert(0, backend_root.join(FRAMEWORK_TARGET));
    }
    target
}

fn cleanup_paths(job: &BuildJob) -> Vec<PathBuf> {
    let artifacts = job.artifacts();
    let mut paths = artifacts.clone();
    // Next-gen writes one response file per artifact.
    if job.backend == BackendKind::NextGen {
        paths.extend(artifacts.iter().map(|artifact| {
            let mut rsp = artifact.clone().into_os_string();
            rsp.push(".rsp");
            PathBuf::from(rsp)
        }));
    }
    paths
}

/// Delete the outputs of jobs that succeeded. Failures keep their outputs
/// for investigation.
async fn remove_successful_outputs(report: &RunReport, cleanup: &HashMap<JobId, Vec<PathBuf>>) {
    for result in report.results.iter().filter(|r| r.status.is_success()) {
        let Some(paths) = cleanup.get(&result.job_id) else {
            continue;
        };
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output"),
            }
        }
    }
}
