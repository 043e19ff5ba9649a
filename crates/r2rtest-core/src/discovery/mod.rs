//! Work-item discovery: turn an input root into compilation targets.
//!
//! Discovery only reads the filesystem. Every call to
//! [`Discoverer::discover`] walks the tree again, so a discoverer can be
//! re-run after the inputs change.

pub mod pe;
pub mod response_file;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::target::{CompilationTarget, ModeFlags, TargetOrigin};
use crate::error::DiscoveryError;

pub use response_file::{rewrite_path, PathMapEntry, PathRewrite, ResponseFile};

/// Name and output directory of the framework composite image.
pub const FRAMEWORK_TARGET: &str = "framework";

/// How the input root is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Every assembly directly inside the root is its own target.
    Flat,

    /// Every directory holding assemblies is one application target.
    Subtree,

    /// The managed assemblies of a CORE_ROOT directory.
    Framework,

    /// Restored packages named in a list file, one target per package.
    Packages { list: PathBuf },

    /// Existing response files, one target per file.
    ResponseFiles { files: Vec<PathBuf> },
}

/// Knobs shared by all discovery modes.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Case-insensitive substring the assembly file name must contain.
    pub filter: Option<String>,

    /// Ignore files without a CLI header.
    pub managed_only: bool,

    pub modes: ModeFlags,

    /// References added to every target.
    pub reference_paths: Vec<PathBuf>,

    /// Rewrites applied to response-file paths.
    pub rewrites: Vec<PathRewrite>,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredSet {
    pub targets: Vec<CompilationTarget>,
    pub path_map: Vec<PathMapEntry>,
}

impl DiscoveredSet {
    pub fn iter(&self) -> std::slice::Iter<'_, CompilationTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl IntoIterator for DiscoveredSet {
    type Item = CompilationTarget;
    type IntoIter = std::vec::IntoIter<CompilationTarget>;

    fn into_iter(self) -> Self::IntoIter {
        self.targets.into_iter()
    }
}

/// An assembly found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Assembly {
    path: PathBuf,
    executable: bool,
}

/// Walks one input root according to a [`DiscoveryMode`].
#[derive(Debug, Clone)]
pub struct Discoverer {
    root: PathBuf,
    mode: DiscoveryMode,
    options: DiscoveryOptions,
}

impl Discoverer {
    pub fn new(root: impl Into<PathBuf>, mode: DiscoveryMode, options: DiscoveryOptions) -> Self {
        Self {
            root: root.into(),
            mode,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Produce the targets. Fails if the root is missing or yields nothing.
    pub fn discover(&self) -> Result<DiscoveredSet, DiscoveryError> {
        if !matches!(self.mode, DiscoveryMode::ResponseFiles { .. }) && !self.root.is_dir() {
            return Err(DiscoveryError::RootMissing(self.root.clone()));
        }

        let set = match &self.mode {
            DiscoveryMode::Flat => self.flat()?,
            DiscoveryMode::Subtree => self.subtree(&self.root, Path::new(""))?,
            DiscoveryMode::Framework => self.framework()?,
            DiscoveryMode::Packages { list } => self.packages(list)?,
            DiscoveryMode::ResponseFiles { files } => self.response_files(files)?,
        };

        if set.is_empty() {
            return Err(DiscoveryError::NoTargets(self.root.clone()));
        }
        info!(
            root = %self.root.display(),
            targets = set.len(),
            "discovered compilation targets"
        );
        Ok(set)
    }

    fn flat(&self) -> Result<DiscoveredSet, DiscoveryError> {
        let assemblies = self.assemblies_in(&self.root)?;
        let mut set = DiscoveredSet::default();
        if assemblies.is_empty() {
            return Ok(set);
        }

        if self.options.modes.composite {
            let name = dir_name(&self.root);
            let entry = assemblies.iter().find(|a| a.executable).map(|a| a.path.clone());
            let inputs = assemblies.into_iter().map(|a| a.path).collect();
            if let Some(t) = CompilationTarget::composite(name, inputs, "", self.options.modes) {
                set.targets.push(self.finish(t, Some(&self.root), entry));
            }
            return Ok(set);
        }

        for assembly in assemblies {
            let name = file_name(&assembly.path);
            let entry = assembly.executable.then(|| assembly.path.clone());
            if let Some(t) =
                CompilationTarget::new(name, vec![assembly.path], "", self.options.modes)
            {
                set.targets.push(self.finish(t, Some(&self.root), entry));
            }
        }
        Ok(set)
    }

    /// One application target per directory that holds assemblies. Output
    /// directories mirror `prefix` + the path relative to `base`.
    fn subtree(&self, base: &Path, prefix: &Path) -> Result<DiscoveredSet, DiscoveryError> {
        let mut set = DiscoveredSet::default();
        for dir in directories(base)? {
            let assemblies = self.assemblies_in(&dir)?;
            if assemblies.is_empty() {
                continue;
            }
            let relative = prefix.join(dir.strip_prefix(base).unwrap_or(Path::new("")));
            let name = if relative.as_os_str().is_empty() {
                dir_name(base)
            } else {
                crate::domain::normalize_path(&relative)
            };
            if let Some(target) = self.app_target(name, &relative, &dir, assemblies) {
                set.targets.push(target);
            }
        }
        Ok(set)
    }

    fn app_target(
        &self,
        name: String,
        relative: &Path,
        dir: &Path,
        assemblies: Vec<Assembly>,
    ) -> Option<CompilationTarget> {
        let entry = assemblies.iter().find(|a| a.executable).map(|a| a.path.clone());
        let inputs = assemblies.into_iter().map(|a| a.path).collect();
        let target = if self.options.modes.composite {
            CompilationTarget::composite(name, inputs, relative, self.options.modes)
        } else {
            CompilationTarget::new(name, inputs, relative, self.options.modes)
        }?;
        Some(self.finish(target, Some(dir), entry))
    }

    fn framework(&self) -> Result<DiscoveredSet, DiscoveryError> {
        let assemblies = self.assemblies_in(&self.root)?;
        let mut set = DiscoveredSet::default();
        if assemblies.is_empty() {
            return Ok(set);
        }
        let modes = self.options.modes;
        let relative = Path::new(FRAMEWORK_TARGET);

        if modes.composite {
            let inputs = assemblies.into_iter().map(|a| a.path).collect();
            if let Some(t) = CompilationTarget::composite("framework-r2r", inputs, relative, modes) {
                let t = self.finish(t, None, None).with_origin(TargetOrigin::Framework);
                set.targets.push(t);
            }
            return Ok(set);
        }

        for assembly in assemblies {
            let name = file_name(&assembly.path);
            if let Some(t) = CompilationTarget::new(name, vec![assembly.path], relative, modes) {
                let t = self.finish(t, None, None).with_origin(TargetOrigin::Framework);
                set.targets.push(t);
            }
        }
        Ok(set)
    }

    fn packages(&self, list: &Path) -> Result<DiscoveredSet, DiscoveryError> {
        let text = std::fs::read_to_string(list).map_err(|source| DiscoveryError::Unreadable {
            path: list.to_path_buf(),
            source,
        })?;

        let mut set = DiscoveredSet::default();
        for name in parse_package_list(&text) {
            let dir = [name.clone(), name.to_lowercase()]
                .into_iter()
                .map(|n| self.root.join(n))
                .find(|p| p.is_dir())
                .ok_or_else(|| DiscoveryError::PackageMissing {
                    name: name.clone(),
                    root: self.root.clone(),
                })?;

            let assemblies = walk(&dir)?
                .into_iter()
                .filter_map(|p| self.classify(p))
                .collect::<Vec<_>>();
            if assemblies.is_empty() {
                debug!(package = %name, "package holds no assemblies");
                continue;
            }
            if let Some(t) = self.app_target(name.clone(), Path::new(&name), &dir, assemblies) {
                set.targets.push(t);
            }
        }
        Ok(set)
    }

    fn response_files(&self, files: &[PathBuf]) -> Result<DiscoveredSet, DiscoveryError> {
        let mut set = DiscoveredSet::default();
        let mut files = files.to_vec();
        files.sort();

        for file in files {
            let rsp = ResponseFile::load(&file, &self.options.rewrites)?;
            let name = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name(&file));
            let modes = ModeFlags {
                composite: rsp.modes.composite || self.options.modes.composite,
                large_bubble: rsp.modes.large_bubble || self.options.modes.large_bubble,
                release: rsp.modes.release || self.options.modes.release,
                use_framework: self.options.modes.use_framework,
            };
            let target = if modes.composite {
                CompilationTarget::composite(name.clone(), rsp.inputs, name.as_str(), modes)
            } else {
                CompilationTarget::new(name.clone(), rsp.inputs, name.as_str(), modes)
            };
            let Some(mut target) = target else { continue };

            let mut refs = rsp.references;
            refs.extend(self.options.reference_paths.iter().cloned());
            target.reference_paths = refs;
            target.extra_args = rsp.extra_args;
            set.path_map.extend(rsp.path_map);
            set.targets.push(target);
        }
        Ok(set)
    }

    /// Attach reference paths (the source directory first) and entry point.
    fn finish(
        &self,
        target: CompilationTarget,
        source_dir: Option<&Path>,
        entry: Option<PathBuf>,
    ) -> CompilationTarget {
        let mut refs = Vec::new();
        if let Some(dir) = source_dir {
            refs.push(dir.to_path_buf());
        }
        refs.extend(self.options.reference_paths.iter().cloned());
        target.with_references(refs).with_entry_point(entry)
    }

    fn assemblies_in(&self, dir: &Path) -> Result<Vec<Assembly>, DiscoveryError> {
        Ok(files(dir)?
            .into_iter()
            .filter_map(|p| self.classify(p))
            .collect())
    }

    fn classify(&self, path: PathBuf) -> Option<Assembly> {
        if !has_assembly_extension(&path) {
            return None;
        }
        if let Some(filter) = &self.options.filter {
            if !file_name(&path).to_lowercase().contains(&filter.to_lowercase()) {
                return None;
            }
        }
        match pe::inspect_file(&path) {
            Some(info) if info.managed => Some(Assembly {
                path,
                executable: info.has_entry_point,
            }),
            _ if !self.options.managed_only => {
                let executable = path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("exe"))
                    .unwrap_or(false);
                Some(Assembly { path, executable })
            }
            _ => {
                debug!(path = %path.display(), "skipping non-managed file");
                None
            }
        }
    }
}

/// Package names from a list file: one per line, `#` comments allowed.
pub fn parse_package_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_assembly_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("dll") || e.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DiscoveryError::Unreadable {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Unreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Regular files directly inside `dir`, sorted.
fn files(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    Ok(read_dir_sorted(dir)?.into_iter().filter(|p| p.is_file()).collect())
}

/// `dir` and every directory below it, depth-first, sorted.
fn directories(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let mut dirs = vec![dir.to_path_buf()];
    for path in read_dir_sorted(dir)? {
        if path.is_dir() {
            dirs.extend(directories(&path)?);
        }
    }
    Ok(dirs)
}

/// Every file below `dir`, sorted.
fn walk(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let mut out = Vec::new();
    for d in directories(dir)? {
        out.extend(files(&d)?);
    }
    out.sort();
    Ok(out)
}
