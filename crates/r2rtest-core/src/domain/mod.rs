//! Domain model: targets, jobs, and their terminal results.

pub mod job;
pub mod result;
pub mod target;

pub use job::{BackendKind, BuildJob, JobId, JobState, TransitionError};
pub use result::{Diagnostics, FailureKind, JobResult, JobStatus};
pub use target::{normalize_path, CompilationTarget, ModeFlags, TargetOrigin};
