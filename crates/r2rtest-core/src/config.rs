//! Harness configuration.
//!
//! A [`HarnessConfig`] can be written by hand as TOML, loaded with
//! [`HarnessConfig::load`], and then overridden field by field by the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, CompileOptions};
use crate::discovery::{DiscoveryMode, DiscoveryOptions, PathRewrite};
use crate::domain::job::BackendKind;
use crate::domain::target::ModeFlags;
use crate::error::ConfigError;
use crate::execution::ExecutionConfig;
use crate::issues::MatchMode;
use crate::scheduler::default_parallelism;

pub const DEFAULT_COMPILE_TIMEOUT_MINUTES: u64 = 10;
pub const DEFAULT_EXECUTION_TIMEOUT_MINUTES: u64 = 10;

/// Which backends get a job per target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSelection {
    pub jit: bool,
    pub legacy: bool,
    pub next_gen: bool,
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self {
            jit: false,
            legacy: false,
            next_gen: true,
        }
    }
}

impl BackendSelection {
    /// Enabled backends in report order.
    pub fn enabled(&self) -> Vec<BackendKind> {
        [
            (self.jit, BackendKind::Jit),
            (self.legacy, BackendKind::Legacy),
            (self.next_gen, BackendKind::NextGen),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect()
    }
}

/// Everything one harness run needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub mode: DiscoveryMode,

    /// Input root (directory, subtree, package root or CORE_ROOT).
    pub input: PathBuf,

    /// Output root; every backend writes below `<output>/<backend>`.
    pub output: PathBuf,

    pub core_root: Option<PathBuf>,

    pub backends: BackendSelection,
    pub tools: BackendConfig,
    pub modes: ModeFlags,

    /// Compile the CORE_ROOT framework before the applications.
    pub precompile_framework: bool,

    pub parallelism: Option<usize>,
    pub sequential: bool,

    /// Minutes; 0 disables the timeout.
    pub compile_timeout_minutes: u64,
    pub execution_timeout_minutes: u64,

    pub issues: Vec<PathBuf>,
    pub match_mode: MatchMode,

    /// Run compiled programs that have an entry point.
    pub execute: bool,
    pub execution: ExecutionConfig,
    pub trace: bool,

    pub compile: CompileOptions,

    pub measure_perf: bool,
    pub no_cleanup: bool,

    /// Case-insensitive file name substring.
    pub filter: Option<String>,
    pub managed_only: bool,
    pub reference_paths: Vec<PathBuf>,
    pub rewrites: Vec<PathRewrite>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Flat,
            input: PathBuf::from("."),
            output: PathBuf::from("r2rtest-out"),
            core_root: None,
            backends: BackendSelection::default(),
            tools: BackendConfig::default(),
            modes: ModeFlags::default(),
            precompile_framework: false,
            parallelism: None,
            sequential: false,
            compile_timeout_minutes: DEFAULT_COMPILE_TIMEOUT_MINUTES,
            execution_timeout_minutes: DEFAULT_EXECUTION_TIMEOUT_MINUTES,
            issues: Vec::new(),
            match_mode: MatchMode::default(),
            execute: false,
            execution: ExecutionConfig::default(),
            trace: false,
            compile: CompileOptions::default(),
            measure_perf: false,
            no_cleanup: false,
            filter: None,
            managed_only: true,
            reference_paths: Vec::new(),
            rewrites: Vec::new(),
        }
    }
}

fn minutes(m: u64) -> Option<Duration> {
    (m > 0).then(|| Duration::from_secs(m * 60))
}

impl HarnessConfig {
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Reject combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_backends().is_empty() {
            return Err(ConfigError::Invalid("no backend enabled".into()));
        }
        if self.modes.composite && self.backends.legacy {
            return Err(ConfigError::Invalid(
                "composite compilation is not supported by the legacy compiler".into(),
            ));
        }
        if self.parallelism == Some(0) {
            return Err(ConfigError::Invalid("degree of parallelism must be at least 1".into()));
        }
        if self.compile.parallelism == Some(0) {
            return Err(ConfigError::Invalid("compiler parallelism must be at least 1".into()));
        }
        let needs_core_root = self.precompile_framework || matches!(self.mode, DiscoveryMode::Framework);
        if needs_core_root && self.core_root.is_none() {
            return Err(ConfigError::Invalid("framework compilation requires a core root".into()));
        }
        if matches!(self.mode, DiscoveryMode::ResponseFiles { ref files } if files.is_empty()) {
            return Err(ConfigError::Invalid("no response files given".into()));
        }
        Ok(())
    }

    /// Jobs are built for these backends, in this order.
    pub fn enabled_backends(&self) -> Vec<BackendKind> {
        self.backends.enabled()
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.sequential {
            1
        } else {
            self.parallelism.unwrap_or_else(default_parallelism).max(1)
        }
    }

    pub fn compile_timeout(&self) -> Option<Duration> {
        minutes(self.compile_timeout_minutes)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        minutes(self.execution_timeout_minutes)
    }

    /// Output root for one backend.
    pub fn backend_root(&self, backend: BackendKind) -> PathBuf {
        self.output.join(backend.name())
    }

    /// Fill unset tool and host paths from the core root layout.
    pub fn apply_core_root_defaults(&mut self) {
        let Some(core_root) = self.core_root.clone() else {
            return;
        };
        if self.tools.legacy_path.is_none() {
            self.tools.legacy_path = Some(core_root.join(exe("crossgen")));
        }
        if self.tools.next_gen_path.is_none() {
            self.tools.next_gen_path = Some(core_root.join("crossgen2").join("crossgen2.dll"));
        }
        // corerun hosts the managed compiler when no dotnet CLI is given.
        if self.tools.dotnet_host.is_none() {
            self.tools.dotnet_host = Some(core_root.join(exe("corerun")));
        }
        if self.execution.host.is_none() {
            self.execution.host = Some(core_root.join(exe("corerun")));
        }
        if self.execution.core_root.is_none() {
            self.execution.core_root = Some(core_root);
        }
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            filter: self.filter.clone(),
            managed_only: self.managed_only,
            modes: self.modes,
            reference_paths: self.reference_paths.clone(),
            rewrites: self.rewrites.clone(),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            DiscoveryMode::Flat => "directory",
            DiscoveryMode::Subtree => "subtree",
            DiscoveryMode::Framework => "framework",
            DiscoveryMode::Packages { .. } => "packages",
            DiscoveryMode::ResponseFiles { .. } => "response-files",
        }
    }
}

fn exe(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}
