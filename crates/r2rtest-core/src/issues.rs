//! Known-issue suppression.
//!
//! Issue lists are loaded once before scheduling. A target matched by any
//! record is resolved to `Skipped` and never reaches a compiler.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::target::{normalize_path, CompilationTarget};
use crate::error::IssueError;

const DEFAULT_REASON: &str = "known issue";

/// A pattern plus the reason matching targets are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueRecord {
    pub pattern: String,
    pub reason: String,

    /// File the record was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl IssueRecord {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
            source: None,
        }
    }
}

/// How issue patterns are compared against target identities.
///
/// Patterns containing `*` or `?` are wildcards in every mode, so MSBuild
/// exclude lists work without picking a mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Pattern equals a file name, file stem, or target name.
    Exact,
    /// Pattern occurs anywhere in a name or path.
    #[default]
    Substring,
    /// Like `Substring` for plain patterns. Kept for configs that name it.
    Glob,
}

/// Outcome of [`IssueFilter::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub runnable: bool,
    pub record: Option<IssueRecord>,
}

impl Classification {
    fn runnable() -> Self {
        Self {
            runnable: true,
            record: None,
        }
    }

    fn skipped(record: &IssueRecord) -> Self {
        Self {
            runnable: false,
            record: Some(record.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Substring(String),
    Glob(Regex),
}

impl Matcher {
    fn compile(pattern: &str, mode: MatchMode) -> Result<Self, IssueError> {
        let needle = normalize_path(Path::new(pattern)).to_lowercase();
        if needle.contains(['*', '?']) {
            let mut expr = glob_to_regex(&needle);
            // Relative patterns may start at any path segment.
            if !needle.starts_with(['/', '*']) {
                expr.replace_range(..1, "^(?:.*/)?");
            }
            let re = Regex::new(&expr).map_err(|source| IssueError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(Matcher::Glob(re));
        }
        match mode {
            MatchMode::Exact => Ok(Matcher::Exact(needle)),
            MatchMode::Substring | MatchMode::Glob => Ok(Matcher::Substring(needle)),
        }
    }

    fn matches(&self, target: &CompilationTarget) -> bool {
        match self {
            Matcher::Exact(needle) => exact_identities(target).iter().any(|id| id == needle),
            Matcher::Substring(needle) => target.identities().iter().any(|id| id.contains(needle)),
            Matcher::Glob(re) => target.identities().iter().any(|id| re.is_match(id)),
        }
    }
}

fn exact_identities(target: &CompilationTarget) -> Vec<String> {
    let mut ids = vec![target.name.to_lowercase()];
    for input in &target.inputs {
        if let Some(name) = input.file_name() {
            ids.push(name.to_string_lossy().to_lowercase());
        }
        if let Some(stem) = input.file_stem() {
            ids.push(stem.to_string_lossy().to_lowercase());
        }
    }
    ids
}

/// Translate a wildcard pattern into an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Ordered list of known issues. First match wins.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    mode: MatchMode,
    entries: Vec<(IssueRecord, Matcher)>,
}

impl IssueFilter {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
        }
    }

    /// Load every existing file in `paths`. Missing files are skipped.
    pub fn load(paths: &[PathBuf], mode: MatchMode) -> Result<Self, IssueError> {
        let mut filter = Self::new(mode);
        for path in paths {
            if !path.exists() {
                debug!(path = %path.display(), "issues file not found, ignoring");
                continue;
            }
            let text = std::fs::read_to_string(path).map_err(|source| IssueError::Read {
                path: path.clone(),
                source,
            })?;
            let records = if is_msbuild(path, &text) {
                parse_targets(&text)
            } else {
                parse_text(&text)
            };
            debug!(path = %path.display(), records = records.len(), "loaded issues file");
            for mut record in records {
                record.source = Some(path.clone());
                filter.push(record)?;
            }
        }
        Ok(filter)
    }

    pub fn push(&mut self, record: IssueRecord) -> Result<(), IssueError> {
        let matcher = Matcher::compile(&record.pattern, self.mode)?;
        self.entries.push((record, matcher));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &IssueRecord> {
        self.entries.iter().map(|(r, _)| r)
    }

    pub fn classify(&self, target: &CompilationTarget) -> Classification {
        self.entries
            .iter()
            .find(|(_, m)| m.matches(target))
            .map(|(r, _)| Classification::skipped(r))
            .unwrap_or_else(Classification::runnable)
    }
}

fn is_msbuild(path: &Path, text: &str) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "targets" | "props" | "proj" | "xml")
        || text.trim_start().starts_with('<')
}

/// `pattern | reason` per line; `#` starts a comment.
pub fn parse_text(text: &str) -> Vec<IssueRecord> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let (pattern, reason) = match line.split_once('|') {
                Some((p, r)) => (p.trim(), r.trim()),
                None => (line, ""),
            };
            if pattern.is_empty() {
                return None;
            }
            let reason = if reason.is_empty() { DEFAULT_REASON } else { reason };
            Some(IssueRecord::new(pattern, reason))
        })
        .collect()
}

/// `<ExcludeList Include="...">` items with an optional `<Issue>` child.
pub fn parse_targets(text: &str) -> Vec<IssueRecord> {
    let item = Regex::new(
        r#"(?s)<ExcludeList\s+Include\s*=\s*"([^"]+)"\s*(?:/>|>(.*?)</ExcludeList>)"#,
    );
    let issue = Regex::new(r"(?s)<Issue>\s*(.*?)\s*</Issue>");
    let (Ok(item), Ok(issue)) = (item, issue) else {
        return Vec::new();
    };

    item.captures_iter(text)
        .map(|caps| {
            let pattern = strip_property_prefix(&caps[1]);
            let reason = caps
                .get(2)
                .and_then(|body| issue.captures(body.as_str()))
                .map(|c| c[1].to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_REASON.to_string());
            IssueRecord::new(pattern, reason)
        })
        .collect()
}

/// Drop a leading `$(Property)/` or `$(Property)\`.
fn strip_property_prefix(pattern: &str) -> String {
    let trimmed = pattern.trim();
    if trimmed.starts_with("$(") {
        if let Some(end) = trimmed.find(')') {
            let rest = &trimmed[end + 1..];
            return rest.trim_start_matches(['/', '\\']).to_string();
        }
    }
    trimmed.to_string()
}
