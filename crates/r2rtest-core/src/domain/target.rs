//! Compilation targets: what gets fed to a compiler backend as one unit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Extension appended to composite image names.
pub const COMPOSITE_SUFFIX: &str = ".r2r.dll";

/// Mode flags that shape a compilation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct ModeFlags {
    /// Compile all inputs of a target into one composite image.
    pub composite: bool,

    /// Treat every input as part of a single version bubble.
    pub large_bubble: bool,

    /// Optimized (release) code generation.
    pub release: bool,

    /// Reference a previously compiled native framework instead of IL.
    pub use_framework: bool,
}

/// Where a target came from. Framework targets are compiled before
/// application targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TargetOrigin {
    Framework,
    Application,
}

/// One unit of compilation.
///
/// Composite targets hold at least one input and produce a single image.
/// Non-composite targets map every input to exactly one output file with the
/// same name inside [`CompilationTarget::output_dir`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilationTarget {
    /// Stable identity used in reports and issue matching.
    pub name: String,

    /// Source assemblies, sorted.
    pub inputs: Vec<PathBuf>,

    /// Directory, relative to a backend's output root, that mirrors the
    /// input layout.
    pub relative_dir: PathBuf,

    pub modes: ModeFlags,

    /// Directories (or explicit files / globs) to resolve references from.
    pub reference_paths: Vec<PathBuf>,

    /// Input assembly carrying a managed entry point, if any.
    pub entry_point: Option<PathBuf>,

    pub origin: TargetOrigin,

    /// Extra compiler arguments carried over from a response file.
    #[serde(default)]
    pub extra_args: Vec<String>,

    composite_image: Option<String>,
}

impl CompilationTarget {
    /// A non-composite target: every input compiles 1:1 into `relative_dir`.
    ///
    /// Returns `None` when `inputs` is empty.
    pub fn new(
        name: impl Into<String>,
        mut inputs: Vec<PathBuf>,
        relative_dir: impl Into<PathBuf>,
        modes: ModeFlags,
    ) -> Option<Self> {
        if inputs.is_empty() {
            return None;
        }
        inputs.sort();
        Some(Self {
            name: name.into(),
            inputs,
            relative_dir: relative_dir.into(),
            modes: ModeFlags {
                composite: false,
                ..modes
            },
            reference_paths: Vec::new(),
            entry_point: None,
            origin: TargetOrigin::Application,
            extra_args: Vec::new(),
            composite_image: None,
        })
    }

    /// A composite target whose inputs are merged into `<image>.r2r.dll`.
    ///
    /// Returns `None` when `inputs` is empty.
    pub fn composite(
        name: impl Into<String>,
        inputs: Vec<PathBuf>,
        relative_dir: impl Into<PathBuf>,
        modes: ModeFlags,
    ) -> Option<Self> {
        let name = name.into();
        let image = format!("{}{}", image_stem(&name), COMPOSITE_SUFFIX);
        let mut target = Self::new(name, inputs, relative_dir, modes)?;
        target.modes.composite = true;
        target.composite_image = Some(image);
        Some(target)
    }

    pub fn with_origin(mut self, origin: TargetOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_references(mut self, references: Vec<PathBuf>) -> Self {
        self.reference_paths = references;
        self
    }

    pub fn with_entry_point(mut self, entry_point: Option<PathBuf>) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub fn is_composite(&self) -> bool {
        self.modes.composite
    }

    /// File name of the composite image, if this is a composite target.
    pub fn composite_image(&self) -> Option<&str> {
        self.composite_image.as_deref()
    }

    /// Output directory under `output_root`.
    pub fn output_dir(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.relative_dir)
    }

    /// The path handed to the compiler as its output.
    ///
    /// Composite targets and multi-input targets write into a directory or
    /// image; a single-input target writes one file named after its input.
    pub fn output_path(&self, output_root: &Path) -> PathBuf {
        let dir = self.output_dir(output_root);
        match (&self.composite_image, self.inputs.as_slice()) {
            (Some(image), _) => dir.join(image),
            (None, [single]) => dir.join(file_name(single)),
            (None, _) => dir,
        }
    }

    /// Every artifact the compilation is expected to produce.
    pub fn artifacts(&self, output_root: &Path) -> Vec<PathBuf> {
        let dir = self.output_dir(output_root);
        match &self.composite_image {
            Some(image) => vec![dir.join(image)],
            None => self.inputs.iter().map(|i| dir.join(file_name(i))).collect(),
        }
    }

    /// Compiled counterpart of the entry-point assembly.
    pub fn entry_artifact(&self, output_root: &Path) -> Option<PathBuf> {
        self.entry_point
            .as_ref()
            .map(|entry| self.output_dir(output_root).join(file_name(entry)))
    }

    /// Lower-cased identity strings used for issue matching: the target
    /// name, every input file name, and every input path with `/`
    /// separators.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = vec![self.name.to_lowercase()];
        for input in &self.inputs {
            ids.push(file_name(input).to_lowercase());
            ids.push(normalize_path(input).to_lowercase());
        }
        ids
    }
}

/// Render a path with forward slashes regardless of platform.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn image_stem(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or("composite");
    last.trim_end_matches(".dll").trim_end_matches(".exe").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes() -> ModeFlags {
        ModeFlags::default()
    }

    #[test]
    fn test_new_rejects_empty_inputs() {
        assert!(CompilationTarget::new("x", vec![], "", modes()).is_none());
        assert!(CompilationTarget::composite("x", vec![], "", modes()).is_none());
    }

    #[test]
    fn test_single_input_maps_one_to_one() {
        let t = CompilationTarget::new("a.dll", vec![PathBuf::from("/in/a.dll")], "sub", modes())
            .unwrap();
        let root = Path::new("/out/crossgen2");
        assert_eq!(t.output_path(root), PathBuf::from("/out/crossgen2/sub/a.dll"));
        assert_eq!(t.artifacts(root), vec![PathBuf::from("/out/crossgen2/sub/a.dll")]);
        assert!(!t.is_composite());
    }

    #[test]
    fn test_multi_input_writes_into_directory() {
        let t = CompilationTarget::new(
            "app",
            vec![PathBuf::from("/in/b.dll"), PathBuf::from("/in/a.exe")],
            "app",
            modes(),
        )
        .unwrap();
        let root = Path::new("/out");
        assert_eq!(t.output_path(root), PathBuf::from("/out/app"));
        // inputs are sorted on construction
        assert_eq!(
            t.artifacts(root),
            vec![PathBuf::from("/out/app/a.exe"), PathBuf::from("/out/app/b.dll")]
        );
    }

    #[test]
    fn test_composite_has_single_image() {
        let t = CompilationTarget::composite(
            "tests/app1",
            vec![PathBuf::from("/in/a.dll"), PathBuf::from("/in/b.dll")],
            "tests/app1",
            modes(),
        )
        .unwrap();
        assert!(t.is_composite());
        assert_eq!(t.composite_image(), Some("app1.r2r.dll"));
        let root = Path::new("/out");
        assert_eq!(t.artifacts(root), vec![PathBuf::from("/out/tests/app1/app1.r2r.dll")]);
    }

    #[test]
    fn test_entry_artifact_lives_in_output_dir() {
        let t = CompilationTarget::new("app", vec![PathBuf::from("/in/app/main.exe")], "app", modes())
            .unwrap()
            .with_entry_point(Some(PathBuf::from("/in/app/main.exe")));
        assert_eq!(
            t.entry_artifact(Path::new("/out")),
            Some(PathBuf::from("/out/app/main.exe"))
        );
    }

    #[test]
    fn test_identities_are_lowercase_and_normalized() {
        let t = CompilationTarget::new("MyTest", vec![PathBuf::from("C:\\tests\\MyTest.dll")], "", modes())
            .unwrap();
        let ids = t.identities();
        assert!(ids.contains(&"mytest".to_string()));
        assert!(ids.iter().any(|id| id.contains("c:/tests/mytest.dll")));
    }
}
