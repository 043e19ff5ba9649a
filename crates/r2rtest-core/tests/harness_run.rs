//! End-to-end harness runs over a temporary input tree with scripted tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use r2rtest_core::fakes::{write_managed_assembly, ScriptedProcessRunner, ScriptedResponse};
use r2rtest_core::{
    BackendError, BackendKind, CancelToken, ConfigError, DiscoveryMode, Harness, HarnessConfig,
    HarnessError, JobStatus, RunReport,
};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
}

impl Fixture {
    /// `in/{a,b,c}.dll` plus a placeholder legacy compiler.
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        for name in ["a.dll", "b.dll", "c.dll"] {
            write_managed_assembly(&root.join("in").join(name), false).unwrap();
        }
        std::fs::create_dir_all(root.join("tools")).unwrap();
        std::fs::write(root.join("tools/crossgen"), b"").unwrap();
        std::fs::write(root.join("tools/crossgen2"), b"").unwrap();
        Self { _tmp: tmp, root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn legacy_config(&self) -> HarnessConfig {
        let mut config = HarnessConfig {
            mode: DiscoveryMode::Flat,
            input: self.path("in"),
            output: self.path("out"),
            parallelism: Some(2),
            ..HarnessConfig::default()
        };
        config.backends.legacy = true;
        config.backends.next_gen = false;
        config.tools.legacy_path = Some(self.path("tools/crossgen"));
        config
    }
}

fn read_report(path: &Path) -> RunReport {
    let text = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_all_assemblies_compile() {
    let fx = Fixture::new();
    let runner = Arc::new(ScriptedProcessRunner::new());

    let outcome = Harness::new(fx.legacy_config())
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.counts.total, 3);
    assert_eq!(outcome.report.counts.compiled, 3);
    assert!(outcome.report.failures.is_empty());
    assert_eq!(runner.invocations().len(), 3);

    assert!(outcome.artifacts.markdown.exists());
    let on_disk = read_report(&outcome.artifacts.json);
    assert_eq!(on_disk, outcome.report);
    assert_eq!(on_disk.run_id, outcome.report.run_id);
}

#[tokio::test]
async fn test_compiler_failure_fails_the_run() {
    let fx = Fixture::new();
    let runner = Arc::new(ScriptedProcessRunner::new().on("b.dll", ScriptedResponse::fail_with(1, "bad IL at 0x12")));

    let outcome = Harness::new(fx.legacy_config())
        .with_runner(runner)
        .run(&CancelToken::never())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.report.counts.compiled, 2);
    assert_eq!(outcome.report.counts.failed, 1);

    let failure = &outcome.report.failures[0];
    assert_eq!(failure.target, "b.dll");
    assert_eq!(failure.backend, BackendKind::Legacy);
    assert_eq!(failure.exit_code, Some(1));
    assert!(failure.output_tail.contains("bad IL"));
    assert!(failure.command_line.contains("b.dll"));
}

#[tokio::test]
async fn test_known_issue_is_skipped_and_never_dispatched() {
    let fx = Fixture::new();
    let issues = fx.path("issues.txt");
    std::fs::write(&issues, "# tracked failures\nb.dll | flaky on arm64\n").unwrap();
    let mut config = fx.legacy_config();
    config.issues = vec![issues];
    let runner = Arc::new(ScriptedProcessRunner::new());

    let outcome = Harness::new(config)
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.counts.skipped, 1);
    let skipped = outcome
        .report
        .results
        .iter()
        .find(|r| r.status == JobStatus::Skipped)
        .unwrap();
    assert_eq!(skipped.target, "b.dll");
    assert_eq!(skipped.issue.as_ref().unwrap().reason, "flaky on arm64");
    assert_eq!(runner.invocations().len(), 2);
    assert_eq!(runner.count_matching("b.dll"), 0);
}

#[tokio::test]
async fn test_missing_compiler_aborts_before_scheduling() {
    let fx = Fixture::new();
    let mut config = fx.legacy_config();
    config.tools.legacy_path = Some(fx.path("tools/no-such-crossgen"));
    let runner = Arc::new(ScriptedProcessRunner::new());

    let err = Harness::new(config)
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Backend(BackendError::ToolNotFound { .. })));
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn test_empty_input_is_a_setup_error() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.path("empty")).unwrap();
    let mut config = fx.legacy_config();
    config.input = fx.path("empty");

    let err = Harness::new(config)
        .with_runner(Arc::new(ScriptedProcessRunner::new()))
        .run(&CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Discovery(_)));
}

#[tokio::test]
async fn test_framework_compiles_first_and_is_referenced() {
    let fx = Fixture::new();
    let core_root = fx.path("core");
    write_managed_assembly(&core_root.join("System.Runtime.dll"), false).unwrap();

    let mut config = fx.legacy_config();
    config.backends.legacy = false;
    config.backends.next_gen = true;
    config.tools.next_gen_path = Some(fx.path("tools/crossgen2"));
    config.core_root = Some(core_root);
    config.precompile_framework = true;
    config.modes.use_framework = true;
    config.no_cleanup = true;
    config.sequential = true;
    let runner = Arc::new(ScriptedProcessRunner::new());

    let outcome = Harness::new(config)
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.counts.total, 4);

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 4);
    assert!(invocations[0].display().contains("framework"));

    let app_rsp = fx.path("out/crossgen2/a.dll.rsp");
    let text = std::fs::read_to_string(app_rsp).unwrap();
    let framework_ref = fx.path("out/crossgen2/framework").join("*.dll");
    assert!(text.contains(&format!("-r:{}", framework_ref.display())));
}

#[tokio::test]
async fn test_cleanup_removes_successful_outputs_only() {
    let fx = Fixture::new();
    let mut config = fx.legacy_config();
    config.backends.legacy = false;
    config.backends.jit = true;

    let outcome = Harness::new(config.clone())
        .with_runner(Arc::new(ScriptedProcessRunner::new()))
        .run(&CancelToken::never())
        .await
        .unwrap();
    assert_eq!(outcome.report.counts.compiled, 3);
    assert!(!fx.path("out/jit/a.dll").exists());
    assert!(fx.path("out/report.json").exists());

    config.no_cleanup = true;
    Harness::new(config)
        .with_runner(Arc::new(ScriptedProcessRunner::new()))
        .run(&CancelToken::never())
        .await
        .unwrap();
    assert!(fx.path("out/jit/a.dll").exists());
}

#[tokio::test]
async fn test_core_root_alone_locates_compiler_and_host() {
    let fx = Fixture::new();
    let core_root = fx.path("core");
    std::fs::create_dir_all(core_root.join("crossgen2")).unwrap();
    std::fs::write(core_root.join("crossgen2/crossgen2.dll"), b"").unwrap();
    std::fs::write(core_root.join(if cfg!(windows) { "corerun.exe" } else { "corerun" }), b"").unwrap();

    let config = HarnessConfig {
        mode: DiscoveryMode::Flat,
        input: fx.path("in"),
        output: fx.path("out"),
        core_root: Some(core_root.clone()),
        ..HarnessConfig::default()
    };
    let runner = Arc::new(ScriptedProcessRunner::new());

    let outcome = Harness::new(config)
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.counts.compiled, 3);
    let first = &runner.invocations()[0];
    assert!(first.program.starts_with(&core_root));
    assert!(first.program.to_string_lossy().contains("corerun"));
    assert!(first.args[0].ends_with("crossgen2.dll"));
}

#[tokio::test]
async fn test_composite_response_file_rejected_with_legacy() {
    let fx = Fixture::new();
    let rsp = fx.path("app.rsp");
    let lines = format!(
        "{}\n{}\n--composite\n",
        fx.path("in/a.dll").display(),
        fx.path("in/b.dll").display()
    );
    std::fs::write(&rsp, lines).unwrap();

    let mut config = fx.legacy_config();
    config.mode = DiscoveryMode::ResponseFiles { files: vec![rsp] };
    let runner = Arc::new(ScriptedProcessRunner::new());

    let err = Harness::new(config)
        .with_runner(runner.clone())
        .run(&CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::Invalid(_))));
    assert!(runner.invocations().is_empty());
}
