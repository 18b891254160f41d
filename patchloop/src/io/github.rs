//! Issue tracker adapter backed by the `gh` CLI.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::process::run_command_with_timeout;

const GH_TIMEOUT: Duration = Duration::from_secs(120);
const GH_OUTPUT_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSpec {
    /// `owner/name`.
    pub repo: String,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

pub trait IssueTracker {
    fn fetch_issue(&self, repo: &str, number: u64) -> Result<Issue>;
    /// Return the URL of the open pull request for `spec.head`, creating it
    /// when none exists.
    fn ensure_pull_request(&self, spec: &PullRequestSpec) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GhCli {
    pub workdir: PathBuf,
}

impl GhCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<(bool, String)> {
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, GH_TIMEOUT, GH_OUTPUT_LIMIT)
            .with_context(|| format!("gh {}", args.first().copied().unwrap_or_default()))?;
        if output.timed_out {
            return Err(anyhow!("gh {} timed out", args.join(" ")));
        }
        let success = output.status.success();
        let text = if success {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            String::from_utf8_lossy(&output.stderr).into_owned()
        };
        Ok((success, text.trim().to_string()))
    }
}

impl IssueTracker for GhCli {
    #[instrument(skip_all, fields(repo = %repo, number = number))]
    fn fetch_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let endpoint = format!("repos/{repo}/issues/{number}");
        let (ok, text) = self.run(&["api", &endpoint])?;
        if !ok {
            return Err(anyhow!("gh api {endpoint} failed: {text}"));
        }
        serde_json::from_str(&text).with_context(|| format!("parse issue {repo}#{number}"))
    }

    #[instrument(skip_all, fields(repo = %spec.repo, head = %spec.head))]
    fn ensure_pull_request(&self, spec: &PullRequestSpec) -> Result<String> {
        let (exists, url) = self.run(&[
            "pr", "view", &spec.head, "--repo", &spec.repo, "--json", "url", "-q", ".url",
        ])?;
        if exists && !url.is_empty() {
            info!(url, "reusing existing pull request");
            return Ok(url);
        }
        let (ok, text) = self.run(&[
            "pr", "create", "--repo", &spec.repo, "--head", &spec.head, "--base", &spec.base,
            "--title", &spec.title, "--body", &spec.body,
        ])?;
        if !ok {
            return Err(anyhow!("gh pr create failed: {text}"));
        }
        let url = text.lines().last().unwrap_or_default().trim().to_string();
        info!(url, "opened pull request");
        Ok(url)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
