//! r2rtest - ahead-of-time compile-and-run test harness
//!
//! ## Commands
//!
//! - `compile-directory`: every assembly in one directory
//! - `compile-subtree`: every directory below a root, one target each
//! - `compile-framework`: the managed assemblies of CORE_ROOT
//! - `compile-nuget`: packages from a list over a restored package root
//! - `compile-crossgen-rsp`: existing compiler response files
//!
//! Exit status is 0 when every non-skipped job succeeded, 1 when any job
//! failed, and 2 when the run could not be set up.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn, Level};

use r2rtest_core::obs::RunSpan;
use r2rtest_core::telemetry::init_tracing;
use r2rtest_core::{
    CancelSource, DiscoveryMode, Harness, HarnessConfig, MatchMode, PathRewrite, RunOutcome,
};

#[derive(Parser)]
#[command(name = "r2rtest")]
#[command(author = "Stevedores Org")]
#[command(version = r2rtest_core::VERSION)]
#[command(about = "Compile managed assemblies ahead of time and run them", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile (and run) every assembly in a directory
    CompileDirectory {
        /// Directory holding the input assemblies
        #[arg(short = 'i', long = "input-directory")]
        input: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Compile (and run) every directory of assemblies below a root
    CompileSubtree {
        /// Root of the directory tree
        #[arg(short = 'i', long = "input-directory")]
        input: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Compile the framework assemblies in CORE_ROOT
    CompileFramework {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Compile restored packages named in a package list
    CompileNuget {
        /// Root the packages were restored into
        #[arg(short = 'i', long = "input-directory")]
        input: PathBuf,

        /// File with one package name per line
        #[arg(long)]
        package_list: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Re-run compilations described by existing response files
    CompileCrossgenRsp {
        /// Response files to replay
        #[arg(long = "crossgen-response-file", required = true, num_args = 1..)]
        response_files: Vec<PathBuf>,

        /// Path prefix to replace inside the response files
        #[arg(long, requires = "rewrite_new_path")]
        rewrite_old_path: Vec<String>,

        /// Replacement for the matching --rewrite-old-path
        #[arg(long, requires = "rewrite_old_path")]
        rewrite_new_path: Vec<String>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchArg {
    Exact,
    Substring,
    Glob,
}

impl From<MatchArg> for MatchMode {
    fn from(m: MatchArg) -> Self {
        match m {
            MatchArg::Exact => MatchMode::Exact,
            MatchArg::Substring => MatchMode::Substring,
            MatchArg::Glob => MatchMode::Glob,
        }
    }
}

/// Flags shared by every command.
#[derive(Args, Clone)]
struct CommonArgs {
    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Runtime directory holding corerun and the framework
    #[arg(long = "core-root-directory", env = "CORE_ROOT")]
    core_root: Option<PathBuf>,

    /// Where compiled outputs and reports go
    #[arg(short = 'o', long = "output-directory")]
    output: Option<PathBuf>,

    /// Also compile with the legacy compiler
    #[arg(long)]
    crossgen: bool,

    /// Legacy compiler executable
    #[arg(long)]
    crossgen_path: Option<PathBuf>,

    /// Next-gen compiler (executable or .dll)
    #[arg(long)]
    crossgen2_path: Option<PathBuf>,

    /// dotnet host used to launch a managed compiler
    #[arg(long)]
    dotnet_cli: Option<PathBuf>,

    /// Do not compile with the next-gen compiler
    #[arg(long)]
    nocrossgen2: bool,

    /// Do not run the JIT baseline
    #[arg(long)]
    nojit: bool,

    /// Reuse existing compiled outputs and only execute
    #[arg(long)]
    exe: bool,

    /// Compile only, never execute
    #[arg(long)]
    noexe: bool,

    /// Disable trace capture
    #[arg(long)]
    noetw: bool,

    /// Keep outputs of successful jobs
    #[arg(long)]
    nocleanup: bool,

    /// Ask the compiler for map files
    #[arg(long)]
    map: bool,

    /// Worker count (default: logical cores)
    #[arg(long)]
    degree_of_parallelism: Option<usize>,

    /// Run one job at a time
    #[arg(long)]
    sequential: bool,

    /// Precompile the CORE_ROOT framework first
    #[arg(long)]
    framework: bool,

    /// Reference the precompiled framework when compiling applications
    #[arg(long)]
    use_framework: bool,

    /// Optimized code generation
    #[arg(long)]
    release: bool,

    /// Compile every input into one version bubble
    #[arg(long)]
    large_bubble: bool,

    /// Produce composite images
    #[arg(long)]
    composite: bool,

    /// Parallelism hint for the next-gen compiler
    #[arg(long)]
    crossgen2_parallelism: Option<usize>,

    /// Extra reference directories
    #[arg(short = 'r', long)]
    reference_path: Vec<PathBuf>,

    /// Known-issue lists (.txt or MSBuild .targets)
    #[arg(long)]
    issues_path: Vec<PathBuf>,

    /// How issue patterns match targets
    #[arg(long, value_enum)]
    match_mode: Option<MatchArg>,

    /// Compile timeout in minutes (0 = none)
    #[arg(long)]
    compilation_timeout_minutes: Option<u64>,

    /// Execution timeout in minutes (0 = none)
    #[arg(long)]
    execution_timeout_minutes: Option<u64>,

    /// R2R dump tool run after each successful compile
    #[arg(long)]
    r2r_dump_path: Option<PathBuf>,

    /// Write a per-target timing table
    #[arg(long)]
    measure_perf: bool,

    /// Only assemblies whose file name contains this text
    #[arg(long)]
    input_file_search_string: Option<String>,

    /// DOTNET_GCStress value for executed programs
    #[arg(long)]
    gcstress: Option<String>,

    /// Exit code that counts as a pass
    #[arg(long)]
    expected_exit_code: Option<i32>,

    /// Target OS passed to the next-gen compiler
    #[arg(long)]
    target_os: Option<String>,

    /// Target architecture passed to the next-gen compiler
    #[arg(long)]
    target_arch: Option<String>,
}

impl CommonArgs {
    /// Load the base config and apply the flags that were given.
    ///
    /// Without `--config` the base executes programs and runs the JIT
    /// baseline. With it, the file decides and flags only override.
    fn into_config(self, mode: DiscoveryMode, input: Option<PathBuf>) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => {
                let mut base = HarnessConfig {
                    execute: true,
                    ..HarnessConfig::default()
                };
                base.backends.jit = true;
                base
            }
        };

        config.mode = mode;
        if let Some(input) = input {
            config.input = input;
        }
        if let Some(core_root) = self.core_root {
            config.core_root = Some(core_root);
        }
        if let Some(output) = self.output {
            config.output = output;
        }

        config.backends.legacy |= self.crossgen;
        if self.nocrossgen2 {
            config.backends.next_gen = false;
        }
        if self.noexe {
            config.execute = false;
        }
        if self.nojit || !config.execute {
            config.backends.jit = false;
        }
        config.compile.reuse_existing |= self.exe;
        config.compile.map |= self.map;
        if self.crossgen2_parallelism.is_some() {
            config.compile.parallelism = self.crossgen2_parallelism;
        }
        if self.target_os.is_some() {
            config.compile.target_os = self.target_os;
        }
        if self.target_arch.is_some() {
            config.compile.target_arch = self.target_arch;
        }

        if self.crossgen_path.is_some() {
            config.tools.legacy_path = self.crossgen_path;
        }
        if self.crossgen2_path.is_some() {
            config.tools.next_gen_path = self.crossgen2_path;
        }
        if self.dotnet_cli.is_some() {
            config.tools.dotnet_host = self.dotnet_cli;
        }
        if self.r2r_dump_path.is_some() {
            config.tools.dump_path = self.r2r_dump_path;
        }

        if self.degree_of_parallelism.is_some() {
            config.parallelism = self.degree_of_parallelism;
        }
        config.sequential |= self.sequential;
        config.precompile_framework |= self.framework;
        config.modes.use_framework |= self.use_framework;
        config.modes.release |= self.release;
        config.modes.large_bubble |= self.large_bubble;
        config.modes.composite |= self.composite;

        config.reference_paths.extend(self.reference_path);
        config.issues.extend(self.issues_path);
        if let Some(m) = self.match_mode {
            config.match_mode = m.into();
        }
        if let Some(m) = self.compilation_timeout_minutes {
            config.compile_timeout_minutes = m;
        }
        if let Some(m) = self.execution_timeout_minutes {
            config.execution_timeout_minutes = m;
        }
        if self.gcstress.is_some() {
            config.execution.gc_stress = self.gcstress;
        }
        if let Some(code) = self.expected_exit_code {
            config.execution.expected_exit_code = code;
        }

        config.measure_perf |= self.measure_perf;
        if self.measure_perf {
            config.trace = true;
        }
        if self.noetw || !config.measure_perf {
            config.trace = false;
        }
        config.no_cleanup |= self.nocleanup;
        if self.input_file_search_string.is_some() {
            config.filter = self.input_file_search_string;
        }
        Ok(config)
    }
}

fn build_config(command: Commands) -> Result<HarnessConfig> {
    match command {
        Commands::CompileDirectory { input, common } => {
            common.into_config(DiscoveryMode::Flat, Some(input))
        }
        Commands::CompileSubtree { input, common } => {
            common.into_config(DiscoveryMode::Subtree, Some(input))
        }
        Commands::CompileFramework { common } => {
            let core_root = common.core_root.clone();
            common.into_config(DiscoveryMode::Framework, core_root)
        }
        Commands::CompileNuget {
            input,
            package_list,
            common,
        } => common.into_config(DiscoveryMode::Packages { list: package_list }, Some(input)),
        Commands::CompileCrossgenRsp {
            response_files,
            rewrite_old_path,
            rewrite_new_path,
            common,
        } => {
            if rewrite_old_path.len() != rewrite_new_path.len() {
                anyhow::bail!("--rewrite-old-path and --rewrite-new-path must be given in pairs");
            }
            let mut config = common.into_config(
                DiscoveryMode::ResponseFiles {
                    files: response_files,
                },
                None,
            )?;
            config.rewrites.extend(
                rewrite_old_path
                    .into_iter()
                    .zip(rewrite_new_path)
                    .map(|(old, new)| PathRewrite::new(old, new)),
            );
            Ok(config)
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

fn print_summary(outcome: &RunOutcome) {
    let c = &outcome.report.counts;
    println!(
        "total {} | passed {} | compiled {} | failed {} | skipped {} | timed out {} | cancelled {}",
        c.total, c.passed, c.compiled, c.failed, c.skipped, c.timed_out, c.cancelled
    );
    for e in &outcome.report.tool_errors {
        println!("tool error: {}", e.message);
    }
    for f in &outcome.report.failures {
        println!("  {} {} [{}] {}", f.status, f.target, f.backend, f.command_line);
    }
    println!("report: {}", outcome.artifacts.json.display());
}

async fn run(command: Commands) -> Result<i32> {
    let config = build_config(command)?;
    let harness = Harness::new(config);
    let _span = RunSpan::enter(&harness.run_id().to_string());

    let source = CancelSource::new();
    let on_signal = source.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received, cancelling run");
        on_signal.cancel();
    });

    let outcome = harness
        .run(&source.token())
        .await
        .context("harness setup failed")?;
    print_summary(&outcome);
    info!(exit_code = outcome.exit_code(), "run complete");
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match run(cli.command).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!(error = %format!("{e:#}"), "run failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2rtest_core::BackendKind;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse args")
    }

    #[test]
    fn test_compile_directory_defaults() {
        let cli = parse(&["r2rtest", "compile-directory", "-i", "/tests", "--core-root-directory", "/core"]);
        let config = build_config(cli.command).unwrap();
        assert_eq!(config.mode, DiscoveryMode::Flat);
        assert_eq!(config.input, PathBuf::from("/tests"));
        assert!(config.execute);
        assert_eq!(
            config.enabled_backends(),
            vec![BackendKind::Jit, BackendKind::NextGen]
        );
    }

    #[test]
    fn test_noexe_disables_jit() {
        let cli = parse(&[
            "r2rtest",
            "compile-subtree",
            "-i",
            "/tests",
            "--noexe",
            "--crossgen",
            "--large-bubble",
        ]);
        let config = build_config(cli.command).unwrap();
        assert!(!config.execute);
        assert_eq!(
            config.enabled_backends(),
            vec![BackendKind::Legacy, BackendKind::NextGen]
        );
        assert!(config.modes.large_bubble);
    }

    #[test]
    fn test_config_file_values_survive_absent_flags() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("r2rtest.toml");
        std::fs::write(
            &file,
            "execute = false\nmeasure_perf = true\ntrace = true\n\n[backends]\njit = false\nlegacy = true\nnext_gen = true\n",
        )
        .unwrap();
        let file = file.to_string_lossy().into_owned();

        let cli = parse(&["r2rtest", "compile-directory", "-i", "/t", "--config", &file]);
        let config = build_config(cli.command).unwrap();
        assert!(!config.execute);
        assert!(config.trace);
        assert_eq!(
            config.enabled_backends(),
            vec![BackendKind::Legacy, BackendKind::NextGen]
        );

        let cli = parse(&[
            "r2rtest",
            "compile-directory",
            "-i",
            "/t",
            "--config",
            &file,
            "--nocrossgen2",
            "--noetw",
        ]);
        let config = build_config(cli.command).unwrap();
        assert!(!config.trace);
        assert_eq!(config.enabled_backends(), vec![BackendKind::Legacy]);
    }

    #[test]
    fn test_rsp_rewrites_pair_up() {
        let cli = parse(&[
            "r2rtest",
            "compile-crossgen-rsp",
            "--crossgen-response-file",
            "/a.rsp",
            "/b.rsp",
            "--rewrite-old-path",
            "D:/work",
            "--rewrite-new-path",
            "/mnt/work",
        ]);
        let config = build_config(cli.command).unwrap();
        assert_eq!(config.rewrites, vec![PathRewrite::new("D:/work", "/mnt/work")]);
        match config.mode {
            DiscoveryMode::ResponseFiles { files } => assert_eq!(files.len(), 2),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_timeouts_and_match_mode() {
        let cli = parse(&[
            "r2rtest",
            "compile-directory",
            "-i",
            "/t",
            "--compilation-timeout-minutes",
            "0",
            "--execution-timeout-minutes",
            "3",
            "--match-mode",
            "glob",
            "--degree-of-parallelism",
            "7",
        ]);
        let config = build_config(cli.command).unwrap();
        assert_eq!(config.compile_timeout(), None);
        assert_eq!(config.execution_timeout_minutes, 3);
        assert_eq!(config.match_mode, MatchMode::Glob);
        assert_eq!(config.effective_parallelism(), 7);
    }
}
