//! Apply a [`PatchObject`] to the working tree.
//!
//! Full-content mode (`files`) is authoritative when present. Diff mode goes
//! through `git apply`; only a new-file, additions-only diff may be
//! reconstructed from its `+` lines when `git apply` refuses it.
//!
//! Every path is validated before the first write: a patch with one unsafe
//! path changes nothing.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::path::normalize_patch_path;
use crate::core::types::{FileOperation, PatchObject};
use crate::errors::PatchApplyError;
use crate::io::git::Git;

const EMPTY_FILE_MARKERS: &[&str] = &["(empty file)", "(archivo vacío)", "(archivo vacio)"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    Files,
    Diff,
}

/// Persisted as `patch.applied.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPatch {
    pub mode: ApplyMode,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    /// Paths changed through `git apply`.
    pub diffed: Vec<String>,
    /// Paths rebuilt from the `+` lines of a new-file diff.
    pub reconstructed: Vec<String>,
    pub notes: Vec<String>,
}

impl AppliedPatch {
    fn new(mode: ApplyMode) -> Self {
        Self {
            mode,
            written: Vec::new(),
            deleted: Vec::new(),
            diffed: Vec::new(),
            reconstructed: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn touched(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .written
            .iter()
            .chain(&self.deleted)
            .chain(&self.diffed)
            .chain(&self.reconstructed)
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

#[instrument(skip_all, fields(files = patch.files.len(), patches = patch.patches.len()))]
pub fn apply_patch(patch: &PatchObject, root: &Path, git: &Git) -> Result<AppliedPatch> {
    if patch.is_empty() {
        return Err(PatchApplyError {
            path: None,
            message: "patch has no files and no patches".to_string(),
        }
        .into());
    }
    validate_paths(patch)?;

    if !patch.files.is_empty() {
        let mut applied = apply_files(patch, root)?;
        if !patch.patches.is_empty() {
            applied.notes.push(format!(
                "ignored {} diff patch(es) because full file contents were provided",
                patch.patches.len()
            ));
        }
        info!(
            written = applied.written.len(),
            deleted = applied.deleted.len(),
            "applied full-content patch"
        );
        return Ok(applied);
    }

    let mut applied = AppliedPatch::new(ApplyMode::Diff);
    for entry in &patch.patches {
        let path = if entry.path.trim().is_empty() {
            header_paths(&entry.diff).into_iter().next()
        } else {
            Some(normalize_patch_path(&entry.path)?)
        };
        apply_one_diff(&entry.diff, path, root, git, &mut applied)?;
    }
    info!(
        diffed = applied.diffed.len(),
        reconstructed = applied.reconstructed.len(),
        "applied diff patch"
    );
    Ok(applied)
}

/// Reject the whole patch if any path it names is unsafe.
fn validate_paths(patch: &PatchObject) -> Result<()> {
    for path in patch.files.keys() {
        normalize_patch_path(path)?;
    }
    for entry in &patch.patches {
        if !entry.path.trim().is_empty() {
            normalize_patch_path(&entry.path)?;
        }
        for raw in raw_header_paths(&entry.diff) {
            normalize_patch_path(&raw)?;
        }
    }
    Ok(())
}

fn apply_files(patch: &PatchObject, root: &Path) -> Result<AppliedPatch> {
    let mut applied = AppliedPatch::new(ApplyMode::Files);
    for (raw, change) in &patch.files {
        let rel = normalize_patch_path(raw)?;
        let target = root.join(&rel);
        match change.operation {
            FileOperation::Delete => {
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!(path = %rel, "delete of missing file");
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("delete {}", target.display()));
                    }
                }
                applied.deleted.push(rel);
            }
            FileOperation::Add | FileOperation::Modify => {
                write_file(&target, &file_content(&change.content))?;
                applied.written.push(rel);
            }
        }
    }
    Ok(applied)
}

fn apply_one_diff(
    diff: &str,
    path: Option<String>,
    root: &Path,
    git: &Git,
    applied: &mut AppliedPatch,
) -> Result<()> {
    if is_empty_marker(diff) {
        let path = path.ok_or_else(|| PatchApplyError {
            path: None,
            message: "empty-file marker without a path".to_string(),
        })?;
        write_file(&root.join(&path), "")?;
        applied.written.push(path);
        return Ok(());
    }

    let git_error = if is_unified_diff(diff) {
        match git.apply_diff(diff) {
            Ok(()) => {
                let mut touched = header_paths(diff);
                if touched.is_empty() {
                    touched.extend(path);
                }
                applied.diffed.extend(touched);
                return Ok(());
            }
            Err(err) => {
                warn!(err = %err, "git apply rejected diff");
                Some(format!("{err:#}"))
            }
        }
    } else {
        None
    };

    let Some(path) = path else {
        return Err(PatchApplyError {
            path: None,
            message: "diff names no file and git apply could not use it".to_string(),
        }
        .into());
    };
    let target = root.join(&path);
    if !is_new_file_diff(diff) || !is_additions_only(diff) {
        let reason = git_error.unwrap_or_else(|| "not a unified diff".to_string());
        return Err(PatchApplyError {
            path: Some(path),
            message: format!("{reason}; only new-file additions can be reconstructed"),
        }
        .into());
    }

    let mut content = strip_added_lines(diff).trim_end().to_string();
    content.push('\n');
    write_file(&target, &content)?;
    applied
        .notes
        .push(format!("{path}: reconstructed from added lines"));
    applied.reconstructed.push(path);
    Ok(())
}

fn write_file(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(target, content).with_context(|| format!("write {}", target.display()))
}

/// Content as written to disk: markers and `""` become an empty file,
/// everything else ends with a newline.
fn file_content(content: &str) -> String {
    if content.is_empty() || is_empty_marker(content) {
        return String::new();
    }
    let mut text = content.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn is_empty_marker(text: &str) -> bool {
    let trimmed = text.trim();
    EMPTY_FILE_MARKERS
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
}

fn is_unified_diff(diff: &str) -> bool {
    let has = |prefix: &str| diff.lines().any(|l| l.starts_with(prefix));
    has("--- ") && has("+++ ") && has("@@ ")
}

fn is_new_file_diff(diff: &str) -> bool {
    diff.lines()
        .any(|l| l.starts_with("new file mode") || l.trim_end() == "--- /dev/null")
}

fn is_additions_only(diff: &str) -> bool {
    let mut added = 0usize;
    for line in body_lines(diff) {
        if line.starts_with('+') {
            added += 1;
        } else if !(line.is_empty() || line.starts_with("@@") || line.starts_with('\\')) {
            return false;
        }
    }
    added > 0
}

fn strip_added_lines(diff: &str) -> String {
    body_lines(diff)
        .filter_map(|l| l.strip_prefix('+'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Diff lines after the file headers.
fn body_lines(diff: &str) -> impl Iterator<Item = &str> {
    diff.lines().filter(|l| !is_header_line(l))
}

fn is_header_line(line: &str) -> bool {
    const HEADERS: &[&str] = &[
        "diff --git ",
        "--- ",
        "+++ ",
        "index ",
        "new file mode",
        "deleted file mode",
        "old mode",
        "new mode",
        "similarity index",
        "rename from ",
        "rename to ",
        "copy from ",
        "copy to ",
    ];
    HEADERS.iter().any(|h| line.starts_with(h))
}

/// Paths named by diff headers, as written (prefix stripped, not yet
/// validated). `/dev/null` is skipped.
fn raw_header_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            paths.extend(rest.split_whitespace().map(strip_side_prefix));
        } else if let Some(rest) = line
            .strip_prefix("+++ ")
            .or_else(|| line.strip_prefix("--- "))
        {
            // Timestamps follow a tab.
            let name = rest.split('\t').next().unwrap_or_default().trim();
            paths.push(strip_side_prefix(name));
        } else if let Some(rest) = ["rename from ", "rename to ", "copy from ", "copy to "]
            .iter()
            .find_map(|p| line.strip_prefix(p))
        {
            paths.push(rest.trim().to_string());
        }
    }
    paths.retain(|p| !p.is_empty() && p != "/dev/null" && p != "dev/null");
    paths
}

/// Normalized paths named by the headers, `+++` targets first, deduplicated.
fn header_paths(diff: &str) -> Vec<String> {
    let (targets, others): (Vec<&str>, Vec<&str>) =
        diff.lines().partition(|l| l.starts_with("+++ "));
    let mut out = Vec::new();
    let raw = raw_header_paths(&targets.join("\n"))
        .into_iter()
        .chain(raw_header_paths(&others.join("\n")));
    for raw in raw {
        if let Ok(path) = normalize_patch_path(&raw)
            && !out.contains(&path)
        {
            out.push(path);
        }
    }
    out
}

fn strip_side_prefix(name: &str) -> String {
    name.strip_prefix("a/")
        .or_else(|| name.strip_prefix("b/"))
        .unwrap_or(name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DiffPatch, FileChange};
    use crate::errors::UnsafePathError;
    use crate::test_support::TestRepo;

    fn files_patch(entries: &[(&str, FileOperation, &str)]) -> PatchObject {
        PatchObject {
            files: entries
                .iter()
                .map(|(path, operation, content)| {
                    (
                        path.to_string(),
                        FileChange {
                            operation: *operation,
                            content: content.to_string(),
                        },
                    )
                })
                .collect(),
            ..PatchObject::default()
        }
    }

    fn diff_patch(path: &str, diff: &str) -> PatchObject {
        PatchObject {
            patches: vec![DiffPatch {
                path: path.to_string(),
                diff: diff.to_string(),
            }],
            ..PatchObject::default()
        }
    }

    #[test]
    fn upsert_is_idempotent_and_adds_trailing_newline() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let patch = files_patch(&[
            ("src/app.py", FileOperation::Modify, "print('hi')"),
            ("empty.txt", FileOperation::Add, "(archivo vacío)"),
        ]);

        let first = apply_patch(&patch, repo.path(), &git).expect("apply");
        let second = apply_patch(&patch, repo.path(), &git).expect("apply again");
        assert_eq!(first, second);
        assert_eq!(first.mode, ApplyMode::Files);
        assert_eq!(repo.read("src/app.py"), "print('hi')\n");
        assert_eq!(repo.read("empty.txt"), "");
    }

    #[test]
    fn delete_tolerates_missing_files() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let patch = files_patch(&[
            ("README.md", FileOperation::Delete, ""),
            ("never.txt", FileOperation::Delete, ""),
        ]);
        let applied = apply_patch(&patch, repo.path(), &git).expect("apply");
        assert_eq!(applied.deleted.len(), 2);
        assert!(!repo.exists("README.md"));
    }

    #[test]
    fn unsafe_path_writes_nothing() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let patch = files_patch(&[
            ("a_ok.txt", FileOperation::Add, "fine"),
            ("../escape.txt", FileOperation::Add, "bad"),
        ]);
        let err = apply_patch(&patch, repo.path(), &git).unwrap_err();
        assert!(err.downcast_ref::<UnsafePathError>().is_some());
        assert!(!repo.exists("a_ok.txt"));

        let header_escape = diff_patch(
            "ok.txt",
            "--- a/ok.txt\n+++ b/.git/hooks/pre-commit\n@@ -0,0 +1 @@\n+boom\n",
        );
        let err = apply_patch(&header_escape, repo.path(), &git).unwrap_err();
        assert!(err.downcast_ref::<UnsafePathError>().is_some());
        assert!(!repo.exists("ok.txt"));
    }

    #[test]
    fn empty_patch_is_rejected() {
        let repo = TestRepo::new();
        let err = apply_patch(&PatchObject::default(), repo.path(), &Git::new(repo.path()))
            .unwrap_err();
        assert!(err.downcast_ref::<PatchApplyError>().is_some());
    }

    #[test]
    fn files_mode_ignores_diffs() {
        let repo = TestRepo::new();
        let mut patch = files_patch(&[("a.txt", FileOperation::Add, "a")]);
        patch.patches.push(DiffPatch {
            path: "b.txt".to_string(),
            diff: "+b".to_string(),
        });
        let applied = apply_patch(&patch, repo.path(), &Git::new(repo.path())).expect("apply");
        assert_eq!(applied.written, vec!["a.txt".to_string()]);
        assert!(!repo.exists("b.txt"));
        assert_eq!(applied.notes.len(), 1);
    }

    #[test]
    fn git_apply_handles_context_diffs() {
        let repo = TestRepo::new();
        let diff = "diff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n@@ -1 +1,2 @@\n # fixture\n+more\n";
        let applied = apply_patch(&diff_patch("", diff), repo.path(), &Git::new(repo.path()))
            .expect("apply");
        assert_eq!(applied.diffed, vec!["README.md".to_string()]);
        assert_eq!(repo.read("README.md"), "# fixture\nmore\n");
    }

    #[test]
    fn new_file_additions_are_reconstructed_when_git_apply_fails() {
        let repo = TestRepo::new();
        // Hunk header claims three lines but only two follow.
        let diff = "--- /dev/null\n+++ b/pkg/new.py\n@@ -0,0 +1,3 @@\n+def f():\n+    return 1\n";
        let applied = apply_patch(&diff_patch("pkg/new.py", diff), repo.path(), &Git::new(repo.path()))
            .expect("apply");
        assert_eq!(applied.reconstructed, vec!["pkg/new.py".to_string()]);
        assert_eq!(repo.read("pkg/new.py"), "def f():\n    return 1\n");
    }

    #[test]
    fn broken_edit_of_existing_file_is_an_error() {
        let repo = TestRepo::new();
        let diff = "--- a/README.md\n+++ b/README.md\n@@ -5 +5 @@\n-nope\n+yes\n";
        let err = apply_patch(&diff_patch("README.md", diff), repo.path(), &Git::new(repo.path()))
            .unwrap_err();
        let apply_err = err.downcast_ref::<PatchApplyError>().expect("typed");
        assert_eq!(apply_err.path.as_deref(), Some("README.md"));
        assert_eq!(repo.read("README.md"), "# fixture\n");
    }

    #[test]
    fn edit_hunk_against_missing_file_is_not_reconstructed() {
        let repo = TestRepo::new();
        let diff = "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -10,3 +10,5 @@\n+x = 1\n+y = 2\n";
        let err = apply_patch(&diff_patch("src/calc.py", diff), repo.path(), &Git::new(repo.path()))
            .unwrap_err();
        let apply_err = err.downcast_ref::<PatchApplyError>().expect("typed");
        assert_eq!(apply_err.path.as_deref(), Some("src/calc.py"));
        assert!(!repo.exists("src/calc.py"));
    }

    #[test]
    fn diff_without_path_is_an_error() {
        let repo = TestRepo::new();
        let err = apply_patch(&diff_patch("", "+orphan line"), repo.path(), &Git::new(repo.path()))
            .unwrap_err();
        assert!(err.downcast_ref::<PatchApplyError>().expect("typed").path.is_none());
    }
}
