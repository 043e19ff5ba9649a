//! Scheduler behaviour against a scripted process runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use r2rtest_core::fakes::{ScriptedProcessRunner, ScriptedResponse};
use r2rtest_core::{
    Aggregator, BackendAdapter, BackendConfig, BackendKind, BuildJob, CancelSource, CancelToken,
    CommandSpec, CompilationTarget, CompileOptions, ExecutionConfig, ExecutionRunner, FailureKind,
    JobId, JobStatus, ModeFlags, ProcessOutcome, ProcessRunner, Scheduler,
};
use tempfile::TempDir;
use uuid::Uuid;

fn tools() -> BackendConfig {
    BackendConfig {
        legacy_path: Some(PathBuf::from("/tools/crossgen")),
        next_gen_path: Some(PathBuf::from("/tools/crossgen2")),
        ..BackendConfig::default()
    }
}

fn scheduler(runner: Arc<dyn ProcessRunner>, parallelism: usize) -> Scheduler {
    let backend = BackendAdapter::new(tools(), CompileOptions::default(), Arc::clone(&runner));
    let executor = ExecutionRunner::new(ExecutionConfig::default(), runner);
    Scheduler::new(Arc::new(backend), Arc::new(executor), parallelism)
}

fn library(id: usize, name: &str, backend: BackendKind, out: &Path) -> BuildJob {
    let target = CompilationTarget::new(name, vec![PathBuf::from(format!("/in/{name}"))], "", ModeFlags::default())
        .unwrap();
    BuildJob::new(JobId(id), target, backend, out.join(backend.name()))
}

fn program(id: usize, name: &str, out: &Path, timeout: Duration) -> BuildJob {
    let input = PathBuf::from(format!("/in/{name}"));
    let target = CompilationTarget::new(name, vec![input.clone()], "", ModeFlags::default())
        .unwrap()
        .with_entry_point(Some(input));
    BuildJob::new(JobId(id), target, BackendKind::NextGen, out.join("crossgen2"))
        .with_execution(true, Some(timeout))
}

fn statuses(results: &[r2rtest_core::JobResult]) -> BTreeMap<String, JobStatus> {
    results.iter().map(|r| (r.target.clone(), r.status)).collect()
}

#[tokio::test]
async fn test_three_assemblies_compile_on_legacy() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedProcessRunner::new());
    let jobs = ["a.dll", "b.dll", "c.dll"]
        .iter()
        .enumerate()
        .map(|(i, n)| library(i, n, BackendKind::Legacy, tmp.path()))
        .collect();

    let outcome = scheduler(runner.clone(), 2).run(jobs, &CancelToken::never()).await;

    let mut agg = Aggregator::new(Uuid::new_v4(), Utc::now());
    agg.extend(outcome.results);
    let report = agg.finalize();
    assert_eq!(report.counts.total, 3);
    assert_eq!(report.counts.compiled, 3);
    assert!(report.failures.is_empty());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(runner.invocations().len(), 3);
}

#[tokio::test]
async fn test_tool_failure_is_isolated() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(
        ScriptedProcessRunner::new().on("b.dll", ScriptedResponse::fail_with(1, "error: bad IL in b.dll")),
    );
    let jobs = ["a.dll", "b.dll", "c.dll"]
        .iter()
        .enumerate()
        .map(|(i, n)| library(i, n, BackendKind::Legacy, tmp.path()))
        .collect();

    let outcome = scheduler(runner, 2).run(jobs, &CancelToken::never()).await;
    let by_name = statuses(&outcome.results);
    assert_eq!(by_name["a.dll"], JobStatus::Compiled);
    assert_eq!(by_name["b.dll"], JobStatus::CompileFailed);
    assert_eq!(by_name["c.dll"], JobStatus::Compiled);

    let b = outcome.results.iter().find(|r| r.target == "b.dll").unwrap();
    assert_eq!(b.failure, Some(FailureKind::ToolFailure));
    let diag = b.compile.as_ref().unwrap();
    assert_eq!(diag.exit_code, Some(1));
    assert!(diag.stderr.contains("bad IL"));
    assert!(diag.command_line.contains("/in/b.dll"));

    let mut agg = Aggregator::new(Uuid::new_v4(), Utc::now());
    agg.extend(outcome.results);
    let report = agg.finalize();
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn test_execution_timeout_terminates_only_that_program() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(
        ScriptedProcessRunner::new().on_all(["DOTNET_ReadyToRun", "b.exe"], ScriptedResponse::Hang),
    );
    let limit = Duration::from_millis(200);
    let jobs = ["a.exe", "b.exe", "c.exe"]
        .iter()
        .enumerate()
        .map(|(i, n)| program(i, n, tmp.path(), limit))
        .collect();

    let outcome = scheduler(runner.clone(), 3).run(jobs, &CancelToken::never()).await;
    let by_name = statuses(&outcome.results);
    assert_eq!(by_name["a.exe"], JobStatus::Passed);
    assert_eq!(by_name["b.exe"], JobStatus::ExecutionTimedOut);
    assert_eq!(by_name["c.exe"], JobStatus::Passed);
    assert_eq!(runner.terminated(), 1);
    assert_eq!(runner.active(), 0);
}

#[tokio::test]
async fn test_compile_timeout_kills_compiler() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedProcessRunner::new().on("slow.dll", ScriptedResponse::Hang));
    let jobs = vec![
        library(0, "slow.dll", BackendKind::NextGen, tmp.path())
            .with_compile_timeout(Some(Duration::from_millis(150))),
        library(1, "fast.dll", BackendKind::NextGen, tmp.path())
            .with_compile_timeout(Some(Duration::from_millis(150))),
    ];

    let outcome = scheduler(runner.clone(), 2).run(jobs, &CancelToken::never()).await;
    let by_name = statuses(&outcome.results);
    assert_eq!(by_name["slow.dll"], JobStatus::CompileTimedOut);
    assert_eq!(by_name["fast.dll"], JobStatus::Compiled);
    assert_eq!(runner.terminated(), 1);
}

#[tokio::test]
async fn test_statuses_do_not_depend_on_parallelism() {
    let names = ["a.dll", "b.dll", "c.dll", "d.dll", "e.dll", "f.dll"];
    let mut seen = Vec::new();
    for p in [1, 2, 4] {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedProcessRunner::new()
                .on("b.dll", ScriptedResponse::exit(1))
                .on("e.dll", ScriptedResponse::exit_after(0, Duration::from_millis(20)))
                .otherwise(ScriptedResponse::exit_after(0, Duration::from_millis(5))),
        );
        let jobs = names
            .iter()
            .enumerate()
            .map(|(i, n)| library(i, n, BackendKind::NextGen, tmp.path()))
            .collect();
        let outcome = scheduler(runner, p).run(jobs, &CancelToken::never()).await;
        assert_eq!(outcome.results.len(), names.len());
        seen.push(statuses(&outcome.results));
    }
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_parallelism() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(
        ScriptedProcessRunner::new().otherwise(ScriptedResponse::exit_after(0, Duration::from_millis(30))),
    );
    let jobs = (0..10)
        .map(|i| library(i, &format!("lib{i}.dll"), BackendKind::NextGen, tmp.path()))
        .collect();

    let outcome = scheduler(runner.clone(), 3).run(jobs, &CancelToken::never()).await;
    assert_eq!(outcome.results.len(), 10);
    assert!(runner.peak_concurrency() <= 3);
    assert!(runner.peak_concurrency() >= 1);
}

#[tokio::test]
async fn test_cancel_resolves_every_job() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedProcessRunner::new().otherwise(ScriptedResponse::Hang));
    let jobs = (0..6)
        .map(|i| library(i, &format!("lib{i}.dll"), BackendKind::NextGen, tmp.path()))
        .collect();

    let source = CancelSource::new();
    let token = source.token();
    let trigger = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            while runner.active() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            source.cancel();
        })
    };

    let outcome = tokio::time::timeout(Duration::from_secs(10), scheduler(runner.clone(), 2).run(jobs, &token))
        .await
        .expect("scheduler did not stop after cancel");
    trigger.await.unwrap();

    assert_eq!(outcome.results.len(), 6);
    assert!(outcome.results.iter().all(|r| r.status == JobStatus::Cancelled));
    assert_eq!(runner.invocations().len(), 2);
    assert_eq!(runner.terminated(), 2);
    assert_eq!(runner.active(), 0);
}

#[tokio::test]
async fn test_missing_tool_reported_once_per_backend() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedProcessRunner::new().otherwise(ScriptedResponse::NotFound));
    let jobs = (0..3)
        .map(|i| library(i, &format!("lib{i}.dll"), BackendKind::NextGen, tmp.path()))
        .collect();

    let outcome = scheduler(runner.clone(), 1).run(jobs, &CancelToken::never()).await;
    assert_eq!(outcome.tool_errors.len(), 1);
    assert_eq!(outcome.tool_errors[0].backend, BackendKind::NextGen);
    assert!(outcome
        .results
        .iter()
        .all(|r| r.failure == Some(FailureKind::ToolNotFound)));
    assert_eq!(runner.invocations().len(), 1);
}

/// Runner that panics for one input and succeeds otherwise.
struct PanickingRunner;

#[async_trait]
impl ProcessRunner for PanickingRunner {
    async fn invoke(
        &self,
        command: &CommandSpec,
        _timeout: Option<Duration>,
        _cancel: &CancelToken,
    ) -> std::io::Result<ProcessOutcome> {
        if command.display().contains("boom.dll") {
            panic!("runner exploded");
        }
        Ok(ProcessOutcome::Exited(r2rtest_core::ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        }))
    }
}

#[tokio::test]
async fn test_panic_in_one_job_does_not_stop_the_run() {
    let tmp = TempDir::new().unwrap();
    let jobs = ["a.dll", "boom.dll", "c.dll"]
        .iter()
        .enumerate()
        .map(|(i, n)| library(i, n, BackendKind::NextGen, tmp.path()))
        .collect();

    let outcome = scheduler(Arc::new(PanickingRunner), 2)
        .run(jobs, &CancelToken::never())
        .await;
    let by_name = statuses(&outcome.results);
    assert_eq!(by_name.len(), 3);
    assert_eq!(by_name["a.dll"], JobStatus::Compiled);
    assert_eq!(by_name["c.dll"], JobStatus::Compiled);
    assert_eq!(by_name["boom.dll"], JobStatus::CompileFailed);

    let boom = outcome.results.iter().find(|r| r.target == "boom.dll").unwrap();
    assert_eq!(boom.failure, Some(FailureKind::Internal));
    let message = boom.compile.as_ref().and_then(|d| d.message.clone()).unwrap();
    assert!(message.contains("runner exploded"));
}

/// Runner that trips the cancel source while serving the compile step.
struct CancelDuringCompile {
    source: CancelSource,
}

#[async_trait]
impl ProcessRunner for CancelDuringCompile {
    async fn invoke(
        &self,
        command: &CommandSpec,
        _timeout: Option<Duration>,
        _cancel: &CancelToken,
    ) -> std::io::Result<ProcessOutcome> {
        if !command.display().contains("DOTNET_ReadyToRun") {
            self.source.cancel();
        }
        Ok(ProcessOutcome::Exited(r2rtest_core::ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        }))
    }
}

#[tokio::test]
async fn test_cancel_between_compile_and_execute_is_not_a_pass() {
    let tmp = TempDir::new().unwrap();
    let source = CancelSource::new();
    let token = source.token();
    let runner = Arc::new(CancelDuringCompile { source });
    let jobs = vec![program(0, "app.exe", tmp.path(), Duration::from_secs(5))];

    let outcome = scheduler(runner, 1).run(jobs, &token).await;
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].status, JobStatus::Cancelled);
    assert!(outcome.results[0].execution.is_none());

    let mut agg = Aggregator::new(Uuid::new_v4(), Utc::now());
    agg.extend(outcome.results);
    assert_ne!(agg.finalize().exit_code(), 0);
}
