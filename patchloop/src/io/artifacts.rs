//! Run artifacts under `.patchloop/runs/<run_id>/`.
//!
//! The `.patchloop/` directory carries its own `.gitignore` so artifacts are
//! never committed and survive working-tree reverts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

pub const ARTIFACTS_DIR: &str = ".patchloop";

/// `YYYYMMDDTHHMMSSZ-<pid>`: sortable and unique per process.
pub fn new_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), std::process::id())
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
    run_id: String,
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn create(repo_root: &Path, run_id: &str) -> Result<Self> {
        let base = repo_root.join(ARTIFACTS_DIR);
        fs::create_dir_all(&base).with_context(|| format!("create {}", base.display()))?;
        let ignore = base.join(".gitignore");
        if !ignore.exists() {
            write_text(&ignore, "*\n")?;
        }
        let dir = base.join("runs").join(run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(name);
        write_json(&path, value)?;
        Ok(path)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path(name);
        write_text(&path, contents)?;
        Ok(path)
    }

    /// `iterations/<index>/`, created on demand.
    pub fn iteration(&self, index: u32) -> Result<IterationArtifacts> {
        let dir = self.dir.join("iterations").join(index.to_string());
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(IterationArtifacts { dir })
    }

    /// Scratch space for completion prompts and logs.
    pub fn completions_dir(&self) -> PathBuf {
        self.dir.join("completions")
    }
}

#[derive(Debug, Clone)]
pub struct IterationArtifacts {
    dir: PathBuf,
}

impl IterationArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        write_json(&self.dir.join(name), value)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<()> {
        write_text(&self.dir.join(name), contents)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
