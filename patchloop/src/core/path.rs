//! Patch path normalization and safety rules.

use std::path::{Component, Path};

use crate::errors::UnsafePathError;

/// Normalize a model-supplied path to a `/`-separated relative path.
///
/// Rejects empty paths, absolute or drive-prefixed paths, any `..` segment,
/// and anything inside `.git/`.
pub fn normalize_patch_path(raw: &str) -> Result<String, UnsafePathError> {
    let reject = |reason: &str| UnsafePathError {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim().replace('\\', "/");
    if trimmed.is_empty() {
        return Err(reject("path is empty"));
    }
    if trimmed.starts_with('/') || has_drive_prefix(&trimmed) {
        return Err(reject("absolute paths are not allowed"));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&trimmed).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::ParentDir => return Err(reject("parent traversal ('..') is not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(reject("absolute paths are not allowed"));
            }
        }
    }
    if parts.is_empty() {
        return Err(reject("path resolves to the repository root"));
    }
    if parts.iter().any(|p| p == ".git") {
        return Err(reject("writes inside .git are not allowed"));
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_relative_paths() {
        assert_eq!(normalize_patch_path("./src/app.py").expect("ok"), "src/app.py");
        assert_eq!(normalize_patch_path("src\\a\\b.cs").expect("ok"), "src/a/b.cs");
        assert_eq!(normalize_patch_path(" tests//t.py ").expect("ok"), "tests/t.py");
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        for raw in [
            "../secrets",
            "src/../../etc/passwd",
            "/etc/passwd",
            "C:/Windows/win.ini",
            "..\\up",
            "",
            ".",
            ".git/config",
            "sub/.git/hooks/pre-commit",
        ] {
            assert!(normalize_patch_path(raw).is_err(), "{raw:?} should be rejected");
        }
    }
}
