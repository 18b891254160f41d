//! Glob-style marker matching over a repository tree.

use std::path::Path;

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

/// Directories never scanned for markers.
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "bin",
    "obj",
    ".venv",
    "venv",
    "__pycache__",
    ".patchloop",
];

/// Compiled marker globs.
///
/// `*` and `?` stay within one path segment; `**/` spans any number of
/// directories, including none.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    patterns: Vec<Pattern>,
}

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl MarkerSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let pattern = raw.trim().trim_start_matches("./");
                Pattern::new(pattern).with_context(|| format!("invalid marker pattern '{raw}'"))
            })
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_with(path, MATCH))
    }
}

/// Repository-relative file paths (with `/` separators), skipping vendored dirs.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        e.depth() == 0
            || !(e.file_type().is_dir()
                && SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
    }) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("strip prefix {}", root.display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

/// Whether any file matches any of the patterns.
pub fn exists_any(files: &[String], patterns: &[String]) -> Result<bool> {
    let markers = MarkerSet::new(patterns)?;
    Ok(files.iter().any(|f| markers.matches(f)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs_support_recursive_and_segment_wildcards() {
        let set = |p: &str| MarkerSet::new(&[p.to_string()]).expect("compile");

        let csproj = set("**/*.csproj");
        assert!(csproj.matches("App.csproj"));
        assert!(csproj.matches("src/App/App.csproj"));
        assert!(!csproj.matches("src/App.csproj.user"));

        let pyproject = set("./pyproject.toml");
        assert!(pyproject.matches("pyproject.toml"));
        assert!(!pyproject.matches("sub/pyproject.toml"));

        let flat = set("src/*.py");
        assert!(flat.matches("src/a.py"));
        assert!(!flat.matches("src/pkg/a.py"));

        assert!(MarkerSet::new(&["[".to_string()]).is_err());
    }

    #[test]
    fn list_files_skips_vendored_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("node_modules/x")).expect("mkdir");
        std::fs::write(temp.path().join("node_modules/x/index.js"), "").expect("write");
        std::fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        std::fs::write(temp.path().join("src/app.js"), "").expect("write");
        std::fs::write(temp.path().join("package.json"), "{}").expect("write");

        let files = list_files(temp.path()).expect("list");
        assert_eq!(files, vec!["package.json".to_string(), "src/app.js".to_string()]);
        assert!(exists_any(&files, &["**/*.js".to_string()]).expect("match"));
        assert!(!exists_any(&files, &["**/*.py".to_string()]).expect("match"));
    }
}
