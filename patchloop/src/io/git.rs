//! Git adapter for the iteration engine.
//!
//! The engine owns its working tree for the whole run, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_OUTPUT_LIMIT: usize = 64 * 1024;

/// Identity configured locally when the environment has none.
pub const BOT_NAME: &str = "patchloop[bot]";
pub const BOT_EMAIL: &str = "patchloop-bot@users.noreply.github.com";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree has no changes (untracked files included).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Paths changed relative to HEAD, sorted.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|e| e.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Whether `path` exists in HEAD.
    pub fn is_tracked(&self, path: &str) -> Result<bool> {
        let spec = format!("HEAD:{path}");
        Ok(self.run(&["cat-file", "-e", &spec])?.status.success())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Checkout `branch`, creating it from `base` when it exists neither
    /// locally nor on `origin`.
    #[instrument(skip_all, fields(branch = %branch, base = %base))]
    pub fn ensure_branch(&self, branch: &str, base: &str) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            return Ok(());
        }
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            self.run_checked(&["checkout", branch])?;
            return Ok(());
        }
        let remote = self.run(&["ls-remote", "--heads", "origin", branch])?;
        if remote.status.success() && !String::from_utf8_lossy(&remote.stdout).trim().is_empty() {
            debug!(branch, "fetching branch from origin");
            self.run_checked(&["fetch", "origin", &format!("{branch}:{branch}")])?;
            self.run_checked(&["checkout", branch])?;
            return Ok(());
        }
        debug!(branch, base, "creating branch");
        self.run_checked(&["checkout", "-b", branch, base])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Stage everything and commit.
    ///
    /// Returns `Ok(false)` when there is nothing to commit. A missing author
    /// identity is configured locally (never globally) and the commit retried.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        let output = self.run(&["commit", "-m", message])?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !is_missing_identity(&stderr) {
            return Err(anyhow!("git commit failed: {}", stderr.trim()));
        }
        info!("configuring local git identity");
        self.run_checked(&["config", "user.name", BOT_NAME])?;
        self.run_checked(&["config", "user.email", BOT_EMAIL])?;
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    pub fn push(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    /// Number of commits on `head` not reachable from `base`.
    ///
    /// Tries `origin/<base>` first after a best-effort fetch, then the local ref.
    pub fn commits_ahead(&self, base: &str, head: &str) -> Result<u32> {
        let fetch = self.run(&["fetch", "--no-tags", "--quiet", "origin", base])?;
        if !fetch.status.success() {
            debug!(base, "fetch failed; counting against local base");
        }
        let remote_base = format!("origin/{base}");
        for base_ref in [remote_base.as_str(), base] {
            let range = format!("{base_ref}..{head}");
            let out = self.run(&["rev-list", "--count", &range])?;
            if out.status.success() {
                let text = String::from_utf8_lossy(&out.stdout);
                return text
                    .trim()
                    .parse()
                    .with_context(|| format!("parse rev-list count '{}'", text.trim()));
            }
        }
        Err(anyhow!("cannot count commits between {base} and {head}"))
    }

    /// `git apply --whitespace=nowarn` with the diff on stdin.
    #[instrument(skip_all)]
    pub fn apply_diff(&self, diff: &str) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--whitespace=nowarn", "-"])
            .current_dir(&self.workdir);
        let mut text = diff.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let output = run_command_with_timeout(cmd, Some(text.as_bytes()), APPLY_TIMEOUT, APPLY_OUTPUT_LIMIT)
            .context("run git apply")?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!(
                "git apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    /// Drop every uncommitted change. Ignored files (the artifacts directory)
    /// survive.
    #[instrument(skip_all)]
    pub fn revert_worktree(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn is_missing_identity(stderr: &str) -> bool {
    stderr.contains("Author identity unknown")
        || stderr.contains("empty ident name")
        || stderr.contains("unable to auto-detect email address")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn porcelain_lines_keep_code_and_new_path() {
        let cases = [
            ("?? tests/test_loan.py", "??", "tests/test_loan.py"),
            (" M src/loan.py", " M", "src/loan.py"),
            ("R  src/old.py -> src/new.py", "R ", "src/new.py"),
        ];
        for (line, code, path) in cases {
            let entry = parse_status_line(line).expect("parse");
            assert_eq!(entry.code, code, "{line}");
            assert_eq!(entry.path, path, "{line}");
        }
        assert!(parse_status_line("M").is_err());
    }

    #[test]
    fn missing_identity_is_recognized() {
        assert!(is_missing_identity("*** Please tell me who you are.\n\nAuthor identity unknown\n"));
        assert!(!is_missing_identity("nothing to commit, working tree clean"));
    }

    #[test]
    fn commit_apply_and_revert_in_a_real_repo() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        repo.write("src/loan.py", "rate = 1\n");
        assert!(git.commit_all("add loan").expect("commit"));
        assert!(!git.commit_all("noop").expect("noop commit"));
        assert!(git.is_tracked("src/loan.py").expect("tracked"));

        git.apply_diff("--- a/src/loan.py\n+++ b/src/loan.py\n@@ -1 +1 @@\n-rate = 1\n+rate = 2\n")
            .expect("apply");
        assert_eq!(repo.read("src/loan.py"), "rate = 2\n");
        repo.write("tests/test_loan.py", "x");
        assert!(!git.is_tracked("tests/test_loan.py").expect("untracked"));
        assert_eq!(
            git.changed_paths().expect("status"),
            vec!["src/loan.py".to_string(), "tests/test_loan.py".to_string()]
        );
        assert!(git.ensure_clean().is_err());

        git.revert_worktree().expect("revert");
        assert_eq!(repo.read("src/loan.py"), "rate = 1\n");
        assert!(!repo.exists("tests/test_loan.py"));
        git.ensure_clean().expect("clean after revert");
        assert!(
            git.apply_diff("--- a/src/loan.py\n+++ b/src/loan.py\n@@ -1 +1 @@\n-nope\n+rate = 3\n")
                .is_err()
        );
    }

    #[test]
    fn ensure_branch_creates_then_reuses() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.ensure_branch("patchloop/issue-7", "main").expect("create");
        assert_eq!(git.current_branch().expect("branch"), "patchloop/issue-7");
        repo.write("b.txt", "b\n");
        git.commit_all("b").expect("commit");
        assert_eq!(git.commits_ahead("main", "patchloop/issue-7").expect("ahead"), 1);

        git.ensure_branch("main", "HEAD").expect("checkout base");
        assert!(!repo.exists("b.txt"));
        git.ensure_branch("patchloop/issue-7", "main").expect("reuse");
        assert!(repo.exists("b.txt"));
    }
}
