//! Compiler response files (`.rsp`) and cross-machine path rewriting.
//!
//! Accepts both the legacy slash syntax (`/r:`, `/out:`, `/in:`) and the
//! next-gen dash syntax (`-r:`, `--reference:`, `-o:`, `--out:`); bare lines
//! are inputs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::target::ModeFlags;
use crate::error::DiscoveryError;

/// Replace `old` with `new` in paths read from response files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathRewrite {
    pub old: String,
    pub new: String,
}

impl PathRewrite {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// One applied rewrite, recorded for the path map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathMapEntry {
    pub original: String,
    pub rewritten: String,
}

/// Apply the first matching rewrite. Returns the new path and, if anything
/// changed, the map entry.
pub fn rewrite_path(path: &str, rewrites: &[PathRewrite]) -> (String, Option<PathMapEntry>) {
    for rw in rewrites {
        if !rw.old.is_empty() && path.contains(&rw.old) {
            let rewritten = path.replacen(&rw.old, &rw.new, 1);
            let entry = PathMapEntry {
                original: path.to_string(),
                rewritten: rewritten.clone(),
            };
            return (rewritten, Some(entry));
        }
    }
    (path.to_string(), None)
}

/// Parsed contents of one response file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFile {
    pub inputs: Vec<PathBuf>,
    pub references: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub modes: ModeFlags,
    pub extra_args: Vec<String>,
    pub path_map: Vec<PathMapEntry>,
}

impl ResponseFile {
    pub fn load(path: &Path, rewrites: &[PathRewrite]) -> Result<Self, DiscoveryError> {
        let text = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = Self::parse(&text, rewrites);
        if parsed.inputs.is_empty() {
            return Err(DiscoveryError::MalformedResponseFile {
                path: path.to_path_buf(),
                reason: "no input assemblies".to_string(),
            });
        }
        Ok(parsed)
    }

    pub fn parse(text: &str, rewrites: &[PathRewrite]) -> Self {
        let mut rsp = ResponseFile::default();
        let mut lines = text
            .lines()
            .map(|l| unquote(l.trim()))
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        while let Some(line) = lines.next() {
            let (name, value) = split_option(&line);
            match name.as_deref() {
                None => {
                    let p = rsp.rewrite(&line, rewrites);
                    rsp.inputs.push(p);
                }
                Some("r" | "reference") => {
                    if let Some(v) = value.or_else(|| lines.next()) {
                        let p = rsp.rewrite(&v, rewrites);
                        rsp.references.push(p);
                    }
                }
                Some("o" | "out") => {
                    if let Some(v) = value.or_else(|| lines.next()) {
                        let p = rsp.rewrite(&v, rewrites);
                        rsp.output = Some(p);
                    }
                }
                Some("in") => {
                    if let Some(v) = value.or_else(|| lines.next()) {
                        let p = rsp.rewrite(&v, rewrites);
                        rsp.inputs.push(p);
                    }
                }
                Some("composite") => rsp.modes.composite = true,
                Some("inputbubble" | "largeversionbubble") => rsp.modes.large_bubble = true,
                Some("O" | "optimize") => rsp.modes.release = true,
                // harness-controlled or legacy-only switches
                Some("nologo" | "missingdependenciesok" | "parallelism") => {}
                Some(_) => {
                    if line.starts_with("--") {
                        rsp.extra_args.push(line.clone());
                    }
                }
            }
        }
        rsp
    }

    fn rewrite(&mut self, raw: &str, rewrites: &[PathRewrite]) -> PathBuf {
        let (path, entry) = rewrite_path(raw, rewrites);
        if let Some(entry) = entry {
            self.path_map.push(entry);
        }
        PathBuf::from(path)
    }
}

/// Split `--name:value`, `-n:value`, `/name:value` into `(name, value)`.
///
/// Absolute unix paths are inputs, not options: a leading `/` only starts an
/// option when the rest contains no further `/` before the `:`.
fn split_option(line: &str) -> (Option<String>, Option<String>) {
    let body = if let Some(rest) = line.strip_prefix("--") {
        rest
    } else if let Some(rest) = line.strip_prefix('-') {
        rest
    } else if let Some(rest) = line.strip_prefix('/') {
        let name_part = rest.split(':').next().unwrap_or(rest);
        if name_part.contains('/') || name_part.contains('.') {
            return (None, None);
        }
        rest
    } else {
        return (None, None);
    };

    let (name, value) = match body.split_once(':') {
        Some((n, v)) => (n, Some(v.to_string())),
        None => (body, None),
    };
    let name = if name.len() == 1 {
        name.to_string()
    } else {
        name.to_lowercase()
    };
    (Some(name), value.filter(|v| !v.is_empty()))
}

fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}
