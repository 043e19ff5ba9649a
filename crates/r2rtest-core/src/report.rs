//! Result aggregation and run artifacts.
//!
//! [`Aggregator`] collects terminal [`JobResult`]s in any order;
//! [`Aggregator::finalize`] sorts them by job id into a [`RunReport`], so the
//! same set of results always serialises to the same bytes.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::discovery::PathMapEntry;
use crate::domain::job::{BackendKind, JobId};
use crate::domain::result::{FailureKind, JobResult, JobStatus};
use crate::scheduler::ToolError;

pub const SCHEMA_VERSION: &str = "1.0";

pub const REPORT_JSON: &str = "report.json";
pub const REPORT_MD: &str = "report.md";
pub const PERF_TSV: &str = "perf.tsv";
pub const PATH_MAP_TXT: &str = "path-map.txt";

/// Aggregate status counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub total: usize,
    pub passed: usize,
    pub compiled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl RunCounts {
    fn add(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Passed => self.passed += 1,
            JobStatus::Compiled => self.compiled += 1,
            JobStatus::CompileFailed | JobStatus::ExecutionFailed => self.failed += 1,
            JobStatus::CompileTimedOut | JobStatus::ExecutionTimedOut => self.timed_out += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Reproduction details for one unsuccessful job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureEntry {
    pub job_id: JobId,
    pub target: String,
    pub backend: BackendKind,
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: Option<u64>,
    pub output_tail: String,
}

impl FailureEntry {
    fn from_result(result: &JobResult) -> Self {
        let diag = result.deciding_diagnostics();
        let output_tail = diag
            .map(|d| {
                let mut out = String::new();
                if let Some(msg) = &d.message {
                    out.push_str(msg);
                    out.push('\n');
                }
                out.push_str(&d.stdout);
                if !d.stderr.is_empty() {
                    out.push_str(&d.stderr);
                }
                out
            })
            .unwrap_or_default();
        Self {
            job_id: result.job_id,
            target: result.target.clone(),
            backend: result.backend,
            status: result.status,
            failure: result.failure,
            command_line: diag.map(|d| d.command_line.clone()).unwrap_or_default(),
            exit_code: diag.and_then(|d| d.exit_code),
            elapsed_ms: result.deciding_elapsed_ms(),
            output_tail,
        }
    }
}

/// One row of the performance table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerfEntry {
    pub target: String,
    pub backend: BackendKind,
    pub compile_ms: Option<u64>,
    pub execution_ms: Option<u64>,
}

/// Final record of one harness invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub results: Vec<JobResult>,
    pub failures: Vec<FailureEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf: Option<Vec<PerfEntry>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_errors: Vec<ToolError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_map: Vec<PathMapEntry>,
}

/// Paths of the artifacts [`RunReport::write_artifacts`] produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportArtifacts {
    pub json: PathBuf,
    pub markdown: PathBuf,
    pub perf: Option<PathBuf>,
    pub path_map: Option<PathBuf>,
    pub digest: String,
}

impl RunReport {
    /// Every non-skipped job succeeded and no compiler went missing.
    pub fn is_success(&self) -> bool {
        self.tool_errors.is_empty()
            && self
                .results
                .iter()
                .filter(|r| r.status != JobStatus::Skipped)
                .all(|r| r.status.is_success())
    }

    /// Process exit status for the run: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the JSON serialisation, hex encoded.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let json = self.to_json()?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }

    /// Markdown summary with the failure list.
    pub fn to_markdown(&self) -> String {
        let c = &self.counts;
        let mut out = String::new();
        out.push_str("# R2R Test Run\n\n");
        let _ = writeln!(out, "- run: `{}`", self.run_id);
        let _ = writeln!(out, "- started: {}", self.started_at.to_rfc3339());
        let _ = writeln!(
            out,
            "- total: {} | passed: {} | compiled: {} | failed: {} | skipped: {} | timed out: {} | cancelled: {}\n",
            c.total, c.passed, c.compiled, c.failed, c.skipped, c.timed_out, c.cancelled
        );

        if !self.tool_errors.is_empty() {
            out.push_str("## Tool Errors\n");
            for e in &self.tool_errors {
                let _ = writeln!(out, "- {}: {}", e.backend, e.message);
            }
            out.push('\n');
        }

        if !self.failures.is_empty() {
            out.push_str("## Failures\n");
            for f in &self.failures {
                let _ = writeln!(out, "### {} `{}` ({}) {}", f.job_id, f.target, f.backend, f.status);
                if let Some(code) = f.exit_code {
                    let _ = writeln!(out, "- exit code: {code}");
                }
                if let Some(ms) = f.elapsed_ms {
                    let _ = writeln!(out, "- elapsed: {ms} ms");
                }
                if !f.command_line.is_empty() {
                    let _ = writeln!(out, "- command: `{}`", f.command_line);
                }
                if !f.output_tail.trim().is_empty() {
                    let _ = writeln!(out, "\n```\n{}\n```", f.output_tail.trim_end());
                }
                out.push('\n');
            }
        }

        let skipped: Vec<_> = self
            .results
            .iter()
            .filter(|r| r.status == JobStatus::Skipped)
            .collect();
        if !skipped.is_empty() {
            out.push_str("## Skipped\n");
            for r in skipped {
                let reason = r.issue.as_ref().map(|i| i.reason.as_str()).unwrap_or("");
                let _ = writeln!(out, "- `{}` ({}): {}", r.target, r.backend, reason);
            }
        }
        out
    }

    /// Tab-separated performance table, or `None` when not measured.
    pub fn perf_tsv(&self) -> Option<String> {
        let perf = self.perf.as_ref()?;
        let mut out = String::from("target\tbackend\tcompile_ms\texecution_ms\n");
        for p in perf {
            let cell = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_default();
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}",
                p.target,
                p.backend,
                cell(p.compile_ms),
                cell(p.execution_ms)
            );
        }
        Some(out)
    }

    /// `original => rewritten` lines, or `None` when nothing was rewritten.
    pub fn path_map_text(&self) -> Option<String> {
        if self.path_map.is_empty() {
            return None;
        }
        let mut out = String::new();
        for entry in &self.path_map {
            let _ = writeln!(out, "{} => {}", entry.original, entry.rewritten);
        }
        Some(out)
    }

    /// Write the report files into `dir`.
    pub fn write_artifacts(&self, dir: &Path) -> std::io::Result<ReportArtifacts> {
        std::fs::create_dir_all(dir)?;
        let json = self.to_json()?;
        let digest = hex::encode(Sha256::digest(json.as_bytes()));

        let mut artifacts = ReportArtifacts {
            json: dir.join(REPORT_JSON),
            markdown: dir.join(REPORT_MD),
            digest,
            ..ReportArtifacts::default()
        };
        std::fs::write(&artifacts.json, json)?;
        std::fs::write(&artifacts.markdown, self.to_markdown())?;
        if let Some(tsv) = self.perf_tsv() {
            let path = dir.join(PERF_TSV);
            std::fs::write(&path, tsv)?;
            artifacts.perf = Some(path);
        }
        if let Some(text) = self.path_map_text() {
            let path = dir.join(PATH_MAP_TXT);
            std::fs::write(&path, text)?;
            artifacts.path_map = Some(path);
        }
        Ok(artifacts)
    }
}

/// Collects results for one run.
#[derive(Debug, Clone)]
pub struct Aggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    measure_perf: bool,
    path_map: Vec<PathMapEntry>,
    results: Vec<JobResult>,
    tool_errors: Vec<ToolError>,
}

impl Aggregator {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            measure_perf: false,
            path_map: Vec::new(),
            results: Vec::new(),
            tool_errors: Vec::new(),
        }
    }

    pub fn with_perf(mut self, measure_perf: bool) -> Self {
        self.measure_perf = measure_perf;
        self
    }

    pub fn with_path_map(mut self, path_map: Vec<PathMapEntry>) -> Self {
        self.path_map = path_map;
        self
    }

    pub fn push(&mut self, result: JobResult) {
        self.results.push(result);
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = JobResult>) {
        self.results.extend(results);
    }

    pub fn push_tool_error(&mut self, error: ToolError) {
        self.tool_errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Build the report. Does not consume or change the aggregator.
    pub fn finalize(&self) -> RunReport {
        let mut results = self.results.clone();
        results.sort_by_key(|r| r.job_id);

        let mut counts = RunCounts::default();
        for r in &results {
            counts.add(r.status);
        }

        let failures = results
            .iter()
            .filter(|r| !r.status.is_success() && r.status != JobStatus::Skipped)
            .map(FailureEntry::from_result)
            .collect();

        let perf = self.measure_perf.then(|| {
            results
                .iter()
                .filter(|r| r.compile_ms.is_some())
                .map(|r| PerfEntry {
                    target: r.target.clone(),
                    backend: r.backend,
                    compile_ms: r.compile_ms,
                    execution_ms: r.execution_ms,
                })
                .collect()
        });

        let mut tool_errors = self.tool_errors.clone();
        tool_errors.sort_by(|a, b| a.backend.cmp(&b.backend));
        let mut path_map = self.path_map.clone();
        path_map.sort();
        path_map.dedup();

        RunReport {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: self.run_id,
            started_at: self.started_at,
            counts,
            results,
            failures,
            perf,
            tool_errors,
            path_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::BuildJob;
    use crate::domain::result::Diagnostics;
    use crate::domain::target::{CompilationTarget, ModeFlags};
    use crate::issues::IssueRecord;

    fn result(id: usize, status: JobStatus) -> JobResult {
        let input = PathBuf::from(format!("/in/t{id}.dll"));
        let target = CompilationTarget::new(format!("t{id}.dll"), vec![input], "", ModeFlags::default()).unwrap();
        let job = BuildJob::new(JobId(id), target, BackendKind::NextGen, "/out");
        JobResult::for_job(&job, status)
    }

    fn aggregator() -> Aggregator {
        let started = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("parse RFC3339")
            .with_timezone(&Utc);
        Aggregator::new(Uuid::nil(), started)
    }

    #[test]
    fn test_counts_and_order() {
        let mut agg = aggregator();
        agg.push(result(2, JobStatus::CompileFailed));
        agg.push(result(0, JobStatus::Passed));
        agg.push(result(1, JobStatus::Skipped));
        agg.push(result(3, JobStatus::ExecutionTimedOut));

        let report = agg.finalize();
        let ids: Vec<_> = report.results.iter().map(|r| r.job_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(
            report.counts,
            RunCounts {
                total: 4,
                passed: 1,
                failed: 1,
                skipped: 1,
                timed_out: 1,
                ..RunCounts::default()
            }
        );
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut agg = aggregator();
        agg.push(result(1, JobStatus::Compiled));
        agg.push(result(0, JobStatus::Passed));
        let a = agg.finalize().to_json().unwrap();
        let b = agg.finalize().to_json().unwrap();
        assert_eq!(a, b);
        assert_eq!(agg.finalize().digest().unwrap(), agg.finalize().digest().unwrap());
    }

    #[test]
    fn test_skipped_does_not_fail_run() {
        let mut agg = aggregator();
        agg.push(result(0, JobStatus::Passed));
        let mut skipped = result(1, JobStatus::Skipped);
        skipped.issue = Some(IssueRecord::new("t1", "tracked elsewhere"));
        agg.push(skipped);

        let report = agg.finalize();
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert!(report.to_markdown().contains("tracked elsewhere"));
    }

    #[test]
    fn test_tool_error_fails_run() {
        let mut agg = aggregator();
        agg.push(result(0, JobStatus::Compiled));
        agg.push_tool_error(ToolError {
            backend: BackendKind::Legacy,
            path: PathBuf::from("/tools/crossgen"),
            message: "crossgen compiler not found".into(),
        });
        assert_eq!(agg.finalize().exit_code(), 1);
    }

    #[test]
    fn test_failure_entry_carries_diagnostics() {
        let mut failed = result(0, JobStatus::CompileFailed);
        failed.compile_ms = Some(42);
        failed.compile = Some(Diagnostics {
            command_line: "crossgen2 @/out/t0.dll.rsp".into(),
            exit_code: Some(1),
            stderr: "error: bad IL".into(),
            ..Diagnostics::default()
        });
        let mut agg = aggregator();
        agg.push(failed);

        let report = agg.finalize();
        let f = &report.failures[0];
        assert_eq!(f.exit_code, Some(1));
        assert_eq!(f.elapsed_ms, Some(42));
        assert!(f.command_line.contains("@/out/t0.dll.rsp"));
        assert!(f.output_tail.contains("bad IL"));
    }

    #[test]
    fn test_perf_and_path_map_artifacts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut r = result(0, JobStatus::Compiled);
        r.compile_ms = Some(10);
        let mut agg = aggregator()
            .with_perf(true)
            .with_path_map(vec![PathMapEntry {
                original: "D:/a".into(),
                rewritten: "/mnt/a".into(),
            }]);
        agg.push(r);

        let report = agg.finalize();
        let artifacts = report.write_artifacts(tmp.path()).unwrap();
        assert!(artifacts.json.exists());
        assert!(artifacts.markdown.exists());
        let tsv = std::fs::read_to_string(artifacts.perf.unwrap()).unwrap();
        assert!(tsv.contains("t0.dll\tcrossgen2\t10\t"));
        let map = std::fs::read_to_string(artifacts.path_map.unwrap()).unwrap();
        assert_eq!(map, "D:/a => /mnt/a\n");
        assert_eq!(artifacts.digest.len(), 64);
    }
}
