//! Error taxonomy for the harness.
//!
//! Only setup-time failures surface as errors. Everything that happens to a
//! single job after scheduling is captured as a [`crate::JobResult`] instead.

use std::path::PathBuf;

use crate::domain::job::BackendKind;

/// Failures while turning an input root into compilation targets.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("input root does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no compilation targets found under {0}")]
    NoTargets(PathBuf),

    #[error("package {name} is not present under {root}")]
    PackageMissing { name: String, root: PathBuf },

    #[error("malformed response file {path}: {reason}")]
    MalformedResponseFile { path: PathBuf, reason: String },
}

/// Failures while loading known-issue lists.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("failed to read issues file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid issue pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Backend configuration problems detected before any job starts.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{backend} compiler path is not configured")]
    ToolNotConfigured { backend: BackendKind },

    #[error("{backend} compiler not found at {path}")]
    ToolNotFound { backend: BackendKind, path: PathBuf },

    #[error("{tool} is a managed assembly and needs a dotnet host")]
    HostRequired { tool: PathBuf },

    #[error("{backend} does not support {mode} compilation")]
    UnsupportedMode {
        backend: BackendKind,
        mode: &'static str,
    },
}

/// Invalid or unreadable harness configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level harness errors. Any of these aborts the run before scheduling.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("issues error: {0}")]
    Issues(#[from] IssueError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
