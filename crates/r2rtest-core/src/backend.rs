//! Compiler backends.
//!
//! [`BackendAdapter`] turns a [`BuildJob`] into concrete compiler
//! invocations and runs them through a [`ProcessRunner`]. Per-job failures
//! come back as a [`CompileOutcome`]; only setup problems are errors.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::job::{BackendKind, BuildJob};
use crate::domain::result::{tail, Diagnostics};
use crate::error::BackendError;
use crate::process::{tool_exists, CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner};

/// Locations of the external tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Legacy compiler executable.
    pub legacy_path: Option<PathBuf>,

    /// Next-gen compiler, either a native executable or a `.dll` run
    /// through `dotnet_host`.
    pub next_gen_path: Option<PathBuf>,

    pub dotnet_host: Option<PathBuf>,

    /// Optional R2R dump tool run after each successful compile.
    pub dump_path: Option<PathBuf>,
}

impl BackendConfig {
    pub fn tool_path(&self, backend: BackendKind) -> Option<&Path> {
        match backend {
            BackendKind::Jit => None,
            BackendKind::Legacy => self.legacy_path.as_deref(),
            BackendKind::NextGen => self.next_gen_path.as_deref(),
        }
    }
}

/// Compiler options that apply to every job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileOptions {
    /// Parallelism hint passed to the next-gen compiler.
    pub parallelism: Option<usize>,

    /// Ask the next-gen compiler for a map file.
    pub map: bool,

    pub target_os: Option<String>,
    pub target_arch: Option<String>,

    /// Skip compilation when every artifact already exists.
    pub reuse_existing: bool,
}

/// One compiler command, plus the response file it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: CommandSpec,
    pub response_file: Option<ResponseFileContents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFileContents {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Result of compiling one job.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Success {
        diagnostics: Option<Diagnostics>,
        elapsed: Duration,
        dump: Option<PathBuf>,
    },

    /// The compiler ran and failed.
    ToolFailure {
        diagnostics: Diagnostics,
        elapsed: Duration,
    },

    /// The compiler binary could not be launched. `first` is set only for
    /// the job that discovered it.
    ToolNotFound {
        backend: BackendKind,
        path: PathBuf,
        first: bool,
    },

    TimedOut {
        diagnostics: Diagnostics,
        elapsed: Duration,
    },

    Cancelled {
        elapsed: Duration,
    },
}

impl CompileOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            CompileOutcome::Success { elapsed, .. }
            | CompileOutcome::ToolFailure { elapsed, .. }
            | CompileOutcome::TimedOut { elapsed, .. }
            | CompileOutcome::Cancelled { elapsed } => *elapsed,
            CompileOutcome::ToolNotFound { .. } => Duration::ZERO,
        }
    }
}

/// Uniform front for the Jit, Legacy and NextGen backends.
pub struct BackendAdapter {
    config: BackendConfig,
    options: CompileOptions,
    runner: Arc<dyn ProcessRunner>,
    missing: Mutex<HashSet<BackendKind>>,
}

impl std::fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("config", &self.config)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BackendAdapter {
    pub fn new(config: BackendConfig, options: CompileOptions, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config,
            options,
            runner,
            missing: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Verify every compiling backend in `backends` can be launched.
    pub fn preflight(&self, backends: &[BackendKind]) -> Result<(), BackendError> {
        for &backend in backends.iter().filter(|b| b.compiles()) {
            let tool = self
                .config
                .tool_path(backend)
                .ok_or(BackendError::ToolNotConfigured { backend })?;
            if !tool_exists(tool) {
                return Err(BackendError::ToolNotFound {
                    backend,
                    path: tool.to_path_buf(),
                });
            }
            if is_managed_tool(tool) {
                let host = self
                    .config
                    .dotnet_host
                    .as_deref()
                    .ok_or_else(|| BackendError::HostRequired {
                        tool: tool.to_path_buf(),
                    })?;
                if !tool_exists(host) {
                    return Err(BackendError::ToolNotFound {
                        backend,
                        path: host.to_path_buf(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Commands that compile `job`, in order. Empty for the JIT baseline.
    pub fn build_invocations(&self, job: &BuildJob) -> Result<Vec<Invocation>, BackendError> {
        match job.backend {
            BackendKind::Jit => Ok(Vec::new()),
            BackendKind::Legacy => self.legacy_invocations(job),
            BackendKind::NextGen => self.next_gen_invocations(job),
        }
    }

    fn tool(&self, backend: BackendKind) -> Result<&Path, BackendError> {
        self.config
            .tool_path(backend)
            .ok_or(BackendError::ToolNotConfigured { backend })
    }

    fn legacy_invocations(&self, job: &BuildJob) -> Result<Vec<Invocation>, BackendError> {
        if job.target.is_composite() {
            return Err(BackendError::UnsupportedMode {
                backend: BackendKind::Legacy,
                mode: "composite",
            });
        }
        let tool = self.tool(BackendKind::Legacy)?;
        let out_dir = job.target.output_dir(job.output_root());
        let platform_paths = legacy_reference_dirs(&job.target.reference_paths);

        Ok(job
            .target
            .inputs
            .iter()
            .map(|input| {
                let mut cmd = CommandSpec::new(tool)
                    .arg("/nologo")
                    .arg("/MissingDependenciesOK");
                if job.target.modes.large_bubble {
                    cmd = cmd.arg("/largeversionbubble");
                }
                if !platform_paths.is_empty() {
                    cmd = cmd.arg("/Platform_Assemblies_Paths").arg(platform_paths.clone());
                }
                let output = out_dir.join(input.file_name().unwrap_or(input.as_os_str()));
                let command = cmd
                    .arg("/in")
                    .arg(input.to_string_lossy())
                    .arg("/out")
                    .arg(output.to_string_lossy());
                Invocation {
                    command,
                    response_file: None,
                }
            })
            .collect())
    }

    /// Composite targets compile in one invocation. Other targets get one
    /// invocation per input so that each input maps to its own output; the
    /// sibling inputs are passed as references.
    fn next_gen_invocations(&self, job: &BuildJob) -> Result<Vec<Invocation>, BackendError> {
        let tool = self.tool(BackendKind::NextGen)?;
        let command = if is_managed_tool(tool) {
            let host = self
                .config
                .dotnet_host
                .as_deref()
                .ok_or_else(|| BackendError::HostRequired {
                    tool: tool.to_path_buf(),
                })?;
            CommandSpec::new(host).arg(tool.to_string_lossy())
        } else {
            CommandSpec::new(tool)
        };

        let target = &job.target;
        let units: Vec<(Vec<&Path>, PathBuf)> = if target.is_composite() {
            let inputs = target.inputs.iter().map(PathBuf::as_path).collect();
            vec![(inputs, job.output_path())]
        } else {
            let out_dir = target.output_dir(job.output_root());
            target
                .inputs
                .iter()
                .map(|input| {
                    let output = out_dir.join(input.file_name().unwrap_or(input.as_os_str()));
                    (vec![input.as_path()], output)
                })
                .collect()
        };

        Ok(units
            .into_iter()
            .map(|(inputs, output)| {
                let rsp_path = append_extension(&output, "rsp");
                let lines = self.next_gen_response_lines(job, &inputs, &output);
                Invocation {
                    command: command.clone().arg(format!("@{}", rsp_path.display())),
                    response_file: Some(ResponseFileContents {
                        path: rsp_path,
                        lines,
                    }),
                }
            })
            .collect())
    }

    fn next_gen_response_lines(&self, job: &BuildJob, inputs: &[&Path], output: &Path) -> Vec<String> {
        let target = &job.target;
        let mut lines: Vec<String> = inputs.iter().map(|i| i.display().to_string()).collect();
        lines.push(format!("--out:{}", output.display()));
        if target.is_composite() {
            lines.push("--composite".to_string());
        } else {
            for sibling in target.inputs.iter().filter(|i| !inputs.contains(&i.as_path())) {
                lines.push(format!("-r:{}", sibling.display()));
            }
        }
        for reference in &target.reference_paths {
            lines.push(format!("-r:{}", reference_glob(reference)));
        }
        if target.modes.release {
            lines.push("-O".to_string());
        }
        if target.modes.large_bubble {
            lines.push("--inputbubble".to_string());
        }
        if let Some(n) = self.options.parallelism {
            lines.push(format!("--parallelism:{n}"));
        }
        if self.options.map {
            lines.push("--map".to_string());
        }
        if let Some(os) = &self.options.target_os {
            lines.push(format!("--targetos:{os}"));
        }
        if let Some(arch) = &self.options.target_arch {
            lines.push(format!("--targetarch:{arch}"));
        }
        lines.extend(target.extra_args.iter().cloned());
        lines
    }

    fn is_missing(&self, backend: BackendKind) -> bool {
        self.missing
            .lock()
            .map(|set| set.contains(&backend))
            .unwrap_or(false)
    }

    /// Record a vanished tool. Returns whether this call recorded it first.
    fn mark_missing(&self, backend: BackendKind) -> bool {
        match self.missing.lock() {
            Ok(mut set) => set.insert(backend),
            Err(poisoned) => poisoned.into_inner().insert(backend),
        }
    }

    /// Compile one job under its compile timeout.
    pub async fn compile(&self, job: &BuildJob, cancel: &CancelToken) -> CompileOutcome {
        let start = Instant::now();

        if self.options.reuse_existing && job.artifacts().iter().all(|a| a.exists()) {
            debug!(job = %job.id, "reusing existing artifacts");
            return CompileOutcome::Success {
                diagnostics: None,
                elapsed: start.elapsed(),
                dump: None,
            };
        }

        if job.backend == BackendKind::Jit {
            return self.copy_inputs(job, start).await;
        }

        if self.is_missing(job.backend) {
            let path = self
                .config
                .tool_path(job.backend)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            return CompileOutcome::ToolNotFound {
                backend: job.backend,
                path,
                first: false,
            };
        }

        let invocations = match self.build_invocations(job) {
            Ok(invocations) => invocations,
            Err(e) => {
                return CompileOutcome::ToolFailure {
                    diagnostics: Diagnostics::message(String::new(), e.to_string()),
                    elapsed: start.elapsed(),
                }
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(job.target.output_dir(job.output_root())).await {
            return CompileOutcome::ToolFailure {
                diagnostics: Diagnostics::message(String::new(), format!("creating output directory: {e}")),
                elapsed: start.elapsed(),
            };
        }

        let mut last = None;
        for invocation in invocations {
            let command_line = invocation.command.display();
            if let Some(rsp) = &invocation.response_file {
                let mut text = rsp.lines.join("\n");
                text.push('\n');
                if let Err(e) = tokio::fs::write(&rsp.path, text).await {
                    return CompileOutcome::ToolFailure {
                        diagnostics: Diagnostics::message(
                            command_line,
                            format!("writing {}: {e}", rsp.path.display()),
                        ),
                        elapsed: start.elapsed(),
                    };
                }
            }

            let remaining = match job.compile_timeout {
                Some(limit) => match limit.checked_sub(start.elapsed()) {
                    Some(left) => Some(left),
                    None => {
                        return CompileOutcome::TimedOut {
                            diagnostics: Diagnostics::message(command_line, "compile timeout exhausted"),
                            elapsed: start.elapsed(),
                        }
                    }
                },
                None => None,
            };

            debug!(job = %job.id, command = %command_line, "invoking compiler");
            match self.runner.invoke(&invocation.command, remaining, cancel).await {
                Ok(ProcessOutcome::Exited(out)) if out.success() => {
                    last = Some(diagnostics(&command_line, &out));
                }
                Ok(ProcessOutcome::Exited(out)) => {
                    return CompileOutcome::ToolFailure {
                        diagnostics: diagnostics(&command_line, &out),
                        elapsed: start.elapsed(),
                    }
                }
                Ok(ProcessOutcome::TimedOut { stdout, stderr, .. }) => {
                    return CompileOutcome::TimedOut {
                        diagnostics: Diagnostics {
                            command_line,
                            stdout: tail(&stdout),
                            stderr: tail(&stderr),
                            message: Some("compilation timed out".to_string()),
                            ..Diagnostics::default()
                        },
                        elapsed: start.elapsed(),
                    }
                }
                Ok(ProcessOutcome::Cancelled { .. }) => {
                    return CompileOutcome::Cancelled {
                        elapsed: start.elapsed(),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let first = self.mark_missing(job.backend);
                    return CompileOutcome::ToolNotFound {
                        backend: job.backend,
                        path: invocation.command.program.clone(),
                        first,
                    };
                }
                Err(e) => {
                    return CompileOutcome::ToolFailure {
                        diagnostics: Diagnostics::message(command_line, format!("failed to launch: {e}")),
                        elapsed: start.elapsed(),
                    }
                }
            }
        }

        let dump = self.dump(job, start, cancel).await;
        CompileOutcome::Success {
            diagnostics: last,
            elapsed: start.elapsed(),
            dump,
        }
    }

    /// JIT baseline: place the IL next to where compiled code would go.
    async fn copy_inputs(&self, job: &BuildJob, start: Instant) -> CompileOutcome {
        let dir = job.target.output_dir(job.output_root());
        let fail = |msg: String| CompileOutcome::ToolFailure {
            diagnostics: Diagnostics::message("copy", msg),
            elapsed: start.elapsed(),
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return fail(format!("creating {}: {e}", dir.display()));
        }
        for input in &job.target.inputs {
            let Some(name) = input.file_name() else { continue };
            let dest = dir.join(name);
            if let Err(e) = tokio::fs::copy(input, &dest).await {
                return fail(format!("copying {} to {}: {e}", input.display(), dest.display()));
            }
        }
        CompileOutcome::Success {
            diagnostics: None,
            elapsed: start.elapsed(),
            dump: None,
        }
    }

    /// Best effort: a failed dump is logged and otherwise ignored. The dump
    /// shares whatever is left of the job's compile budget.
    async fn dump(&self, job: &BuildJob, start: Instant, cancel: &CancelToken) -> Option<PathBuf> {
        let tool = self.config.dump_path.as_deref()?;
        let artifact = job
            .entry_artifact()
            .or_else(|| job.artifacts().into_iter().next())?;
        let out = append_extension(&artifact, "r2rdump");
        let cmd = CommandSpec::new(tool)
            .arg("--in")
            .arg(artifact.to_string_lossy())
            .arg("--out")
            .arg(out.to_string_lossy());

        let remaining = match job.compile_timeout {
            Some(limit) => match limit.checked_sub(start.elapsed()) {
                Some(left) => Some(left),
                None => {
                    warn!(job = %job.id, "compile budget exhausted before r2r dump");
                    return None;
                }
            },
            None => None,
        };

        match self.runner.invoke(&cmd, remaining, cancel).await {
            Ok(ProcessOutcome::Exited(o)) if o.success() => Some(out),
            Ok(other) => {
                warn!(job = %job.id, outcome = ?other, "r2r dump failed");
                None
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "r2r dump could not be launched");
                None
            }
        }
    }
}

fn diagnostics(command_line: &str, out: &ProcessOutput) -> Diagnostics {
    Diagnostics {
        command_line: command_line.to_string(),
        exit_code: out.exit_code,
        signal: out.signal,
        stdout: tail(&out.stdout),
        stderr: tail(&out.stderr),
        message: None,
    }
}

fn is_managed_tool(tool: &Path) -> bool {
    tool.extension()
        .map(|e| e.eq_ignore_ascii_case("dll"))
        .unwrap_or(false)
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// `-r:` argument for a reference entry: directories become `<dir>/*.dll`.
fn reference_glob(reference: &Path) -> String {
    let text = reference.display().to_string();
    if text.contains('*') || has_assembly_extension(reference) {
        text
    } else {
        reference.join("*.dll").display().to_string()
    }
}

fn has_assembly_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("dll") || e.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

/// Directories for `/Platform_Assemblies_Paths`, joined with the platform
/// path-list separator.
fn legacy_reference_dirs(references: &[PathBuf]) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut dirs: Vec<String> = Vec::new();
    for reference in references {
        let dir = if reference.to_string_lossy().contains('*') || has_assembly_extension(reference) {
            reference.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            reference.clone()
        };
        let dir = dir.display().to_string();
        if !dir.is_empty() && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs.join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobId;
    use crate::domain::target::{CompilationTarget, ModeFlags};
    use crate::fakes::{ScriptedProcessRunner, ScriptedResponse};

    fn target(composite: bool) -> CompilationTarget {
        let inputs = vec![PathBuf::from("/in/app.exe"), PathBuf::from("/in/lib.dll")];
        let modes = ModeFlags {
            release: true,
            large_bubble: true,
            ..ModeFlags::default()
        };
        let t = if composite {
            CompilationTarget::composite("app", inputs, "app", modes)
        } else {
            CompilationTarget::new("app", inputs, "app", modes)
        };
        t.unwrap().with_references(vec![PathBuf::from("/in"), PathBuf::from("/fx/*.dll")])
    }

    fn adapter(runner: Arc<dyn ProcessRunner>) -> BackendAdapter {
        BackendAdapter::new(
            BackendConfig {
                legacy_path: Some(PathBuf::from("/tools/crossgen")),
                next_gen_path: Some(PathBuf::from("/tools/crossgen2/crossgen2.dll")),
                dotnet_host: Some(PathBuf::from("/usr/bin/dotnet")),
                dump_path: None,
            },
            CompileOptions {
                parallelism: Some(4),
                target_os: Some("linux".into()),
                ..CompileOptions::default()
            },
            runner,
        )
    }

    #[test]
    fn test_next_gen_response_file() {
        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let job = BuildJob::new(JobId(0), target(true), BackendKind::NextGen, "/out/crossgen2");
        let inv = a.build_invocations(&job).unwrap();
        assert_eq!(inv.len(), 1);

        let cmd = &inv[0].command;
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/dotnet"));
        assert_eq!(cmd.args[0], "/tools/crossgen2/crossgen2.dll");
        assert_eq!(cmd.args[1], "@/out/crossgen2/app/app.r2r.dll.rsp");

        let lines = &inv[0].response_file.as_ref().unwrap().lines;
        assert_eq!(
            lines,
            &vec![
                "/in/app.exe".to_string(),
                "/in/lib.dll".to_string(),
                "--out:/out/crossgen2/app/app.r2r.dll".to_string(),
                "--composite".to_string(),
                "-r:/in/*.dll".to_string(),
                "-r:/fx/*.dll".to_string(),
                "-O".to_string(),
                "--inputbubble".to_string(),
                "--parallelism:4".to_string(),
                "--targetos:linux".to_string(),
            ]
        );
    }

    #[test]
    fn test_legacy_one_invocation_per_input() {
        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let job = BuildJob::new(JobId(0), target(false), BackendKind::Legacy, "/out/crossgen");
        let inv = a.build_invocations(&job).unwrap();
        assert_eq!(inv.len(), 2);
        let args = &inv[0].command.args;
        assert_eq!(args[0], "/nologo");
        assert!(args.contains(&"/largeversionbubble".to_string()));
        let paths = args.iter().position(|a| a == "/Platform_Assemblies_Paths").unwrap();
        assert!(args[paths + 1].contains("/fx"));
        assert_eq!(args[args.len() - 1], "/out/crossgen/app/app.exe");
        assert!(inv[0].response_file.is_none());
    }

    #[test]
    fn test_next_gen_non_composite_compiles_each_input() {
        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let job = BuildJob::new(JobId(0), target(false), BackendKind::NextGen, "/out/crossgen2");
        let inv = a.build_invocations(&job).unwrap();
        assert_eq!(inv.len(), 2);
        assert_eq!(inv[0].command.args[1], "@/out/crossgen2/app/app.exe.rsp");
        assert_eq!(inv[1].command.args[1], "@/out/crossgen2/app/lib.dll.rsp");

        let first = &inv[0].response_file.as_ref().unwrap().lines;
        assert_eq!(first[0], "/in/app.exe");
        assert_eq!(first[1], "--out:/out/crossgen2/app/app.exe");
        assert!(first.contains(&"-r:/in/lib.dll".to_string()));
        assert!(!first.contains(&"--composite".to_string()));
        assert!(!first.contains(&"/in/lib.dll".to_string()));
    }

    #[test]
    fn test_legacy_rejects_composite() {
        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let job = BuildJob::new(JobId(0), target(true), BackendKind::Legacy, "/out/crossgen");
        assert!(matches!(
            a.build_invocations(&job),
            Err(BackendError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn test_managed_tool_without_host() {
        let a = BackendAdapter::new(
            BackendConfig {
                next_gen_path: Some(PathBuf::from("/tools/crossgen2.dll")),
                ..BackendConfig::default()
            },
            CompileOptions::default(),
            Arc::new(ScriptedProcessRunner::new()),
        );
        let job = BuildJob::new(JobId(0), target(true), BackendKind::NextGen, "/out");
        assert!(matches!(
            a.build_invocations(&job),
            Err(BackendError::HostRequired { .. })
        ));
    }

    #[test]
    fn test_preflight_reports_missing_tool() {
        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let err = a.preflight(&[BackendKind::Jit, BackendKind::Legacy]).unwrap_err();
        assert!(matches!(err, BackendError::ToolNotFound { backend: BackendKind::Legacy, .. }));
        assert!(a.preflight(&[BackendKind::Jit]).is_ok());
    }

    #[tokio::test]
    async fn test_compile_writes_rsp_and_succeeds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        let a = adapter(runner.clone());
        let job = BuildJob::new(
            JobId(0),
            target(true),
            BackendKind::NextGen,
            tmp.path().join("crossgen2"),
        );
        let outcome = a.compile(&job, &CancelToken::never()).await;
        assert!(matches!(outcome, CompileOutcome::Success { .. }));

        let rsp = tmp.path().join("crossgen2/app/app.r2r.dll.rsp");
        let text = std::fs::read_to_string(rsp).unwrap();
        assert!(text.contains("--composite"));
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_tool_recorded_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new().on("crossgen2", ScriptedResponse::NotFound));
        let a = adapter(runner.clone());
        let job = BuildJob::new(JobId(0), target(true), BackendKind::NextGen, tmp.path());

        let first = a.compile(&job, &CancelToken::never()).await;
        let second = a.compile(&job, &CancelToken::never()).await;
        assert!(matches!(first, CompileOutcome::ToolNotFound { first: true, .. }));
        assert!(matches!(second, CompileOutcome::ToolNotFound { first: false, .. }));
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_jit_copies_inputs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("in/app.exe");
        std::fs::create_dir_all(input.parent().unwrap()).unwrap();
        std::fs::write(&input, b"il").unwrap();
        let t = CompilationTarget::new("app.exe", vec![input], "", ModeFlags::default()).unwrap();
        let job = BuildJob::new(JobId(0), t, BackendKind::Jit, tmp.path().join("jit"));

        let a = adapter(Arc::new(ScriptedProcessRunner::new()));
        let outcome = a.compile(&job, &CancelToken::never()).await;
        assert!(matches!(outcome, CompileOutcome::Success { .. }));
        assert!(tmp.path().join("jit/app.exe").exists());
    }

    #[tokio::test]
    async fn test_dump_shares_compile_budget() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedProcessRunner::new()
                .on("/tools/r2rdump", ScriptedResponse::Hang)
                .otherwise(ScriptedResponse::exit_after(0, Duration::from_millis(50))),
        );
        let mut a = adapter(runner.clone());
        a.config.dump_path = Some(PathBuf::from("/tools/r2rdump"));
        let job = BuildJob::new(JobId(0), target(true), BackendKind::NextGen, tmp.path())
            .with_compile_timeout(Some(Duration::from_millis(200)));

        let outcome = a.compile(&job, &CancelToken::never()).await;
        let CompileOutcome::Success { dump, elapsed, .. } = outcome else {
            panic!("compile should still succeed: {outcome:?}");
        };
        assert!(dump.is_none());
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(runner.terminated(), 1);
    }

    #[test]
    fn test_reference_glob() {
        assert_eq!(reference_glob(Path::new("/fx")), "/fx/*.dll");
        assert_eq!(reference_glob(Path::new("/fx/a.dll")), "/fx/a.dll");
        assert_eq!(reference_glob(Path::new("/fx/*.dll")), "/fx/*.dll");
    }
}
