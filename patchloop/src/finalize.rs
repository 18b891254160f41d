//! Finalize: publish the branch and write the run summary.
//!
//! The summary is written for every run, including runs that ended on an
//! error; publishing only happens when the loop itself finished.

use std::fmt::{self, Write as _};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::{IterationOutcome, IterationRecord};
use crate::errors::ErrorClass;
use crate::exit_codes;
use crate::io::github::PullRequestSpec;
use crate::looping::LoopStop;
use crate::run::{RunContext, RunInput};

/// Facts gathered while the run progresses. Fields stay `None` when the run
/// failed before reaching the stage that fills them.
#[derive(Debug, Clone, Default)]
pub struct RunFacts {
    pub run_id: String,
    pub repo: String,
    pub issue_number: u64,
    pub issue_title: Option<String>,
    pub branch: Option<String>,
    pub stack_id: Option<String>,
    pub language: Option<String>,
    pub max_iterations: Option<u32>,
    pub plan_summary: Option<String>,
    pub records: Vec<IterationRecord>,
    pub started_at: String,
}

impl RunFacts {
    pub fn new(input: &RunInput, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            repo: input.repo.clone(),
            issue_number: input.issue_number,
            started_at: Utc::now().to_rfc3339(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Tests pass and every acceptance criterion is met.
    Verified,
    Stuck,
    /// Iteration ceiling reached without verification.
    Exhausted,
    /// Ended on an error after the request was accepted.
    Failed,
    /// The request, stack or command was rejected.
    Invalid,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Verified => exit_codes::OK,
            RunStatus::Failed => exit_codes::FAILED,
            RunStatus::Invalid => exit_codes::INVALID,
            RunStatus::Stuck => exit_codes::STUCK,
            RunStatus::Exhausted => exit_codes::EXHAUSTED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Verified => "verified",
            RunStatus::Stuck => "stuck",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Failed => "failed",
            RunStatus::Invalid => "invalid",
        }
    }

    fn from_stop(stop: LoopStop) -> Self {
        match stop {
            LoopStop::Verified => RunStatus::Verified,
            LoopStop::Stuck => RunStatus::Stuck,
            LoopStop::Exhausted => RunStatus::Exhausted,
        }
    }

    fn from_error(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Input | ErrorClass::Security => RunStatus::Invalid,
            _ => RunStatus::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// `input`, `contract`, `policy`, `execution`, `security` or `internal`.
    pub class: String,
    pub message: String,
}

/// Persisted as `summary.json` (and rendered into `summary.md`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub repo: String,
    pub issue_number: u64,
    pub issue_title: Option<String>,
    pub branch: Option<String>,
    pub stack_id: Option<String>,
    pub language: Option<String>,
    pub max_iterations: Option<u32>,
    pub plan_summary: Option<String>,
    pub iterations: Vec<IterationRecord>,
    pub pushed: bool,
    pub pull_request_url: Option<String>,
    pub error: Option<RunError>,
    pub started_at: String,
    pub finished_at: String,
}

impl RunSummary {
    fn new(facts: &RunFacts, status: RunStatus) -> Self {
        Self {
            run_id: facts.run_id.clone(),
            status,
            exit_code: status.exit_code(),
            repo: facts.repo.clone(),
            issue_number: facts.issue_number,
            issue_title: facts.issue_title.clone(),
            branch: facts.branch.clone(),
            stack_id: facts.stack_id.clone(),
            language: facts.language.clone(),
            max_iterations: facts.max_iterations,
            plan_summary: facts.plan_summary.clone(),
            iterations: facts.records.clone(),
            pushed: false,
            pull_request_url: None,
            error: None,
            started_at: facts.started_at.clone(),
            finished_at: String::new(),
        }
    }

    fn set_error(&mut self, err: &anyhow::Error) {
        let class = ErrorClass::of(err);
        self.status = RunStatus::from_error(class);
        self.exit_code = self.status.exit_code();
        self.error = Some(RunError {
            class: class.as_str().to_string(),
            message: format!("{err:#}"),
        });
    }
}

/// Publish (when the loop finished) and persist the summary.
#[instrument(skip_all)]
pub fn finalize(ctx: &RunContext<'_>, facts: &RunFacts, result: Result<LoopStop>) -> Result<RunSummary> {
    let mut summary = match result {
        Ok(stop) => {
            let mut summary = RunSummary::new(facts, RunStatus::from_stop(stop));
            if let Err(err) = publish(ctx, &mut summary) {
                warn!(err = %format!("{err:#}"), "publishing failed");
                summary.set_error(&err);
            }
            summary
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "run failed");
            let mut summary = RunSummary::new(facts, RunStatus::Failed);
            summary.set_error(&err);
            summary
        }
    };
    summary.finished_at = Utc::now().to_rfc3339();

    ctx.artifacts.write_json("summary.json", &summary)?;
    ctx.artifacts.write_text("summary.md", &render_markdown(&summary))?;
    Ok(summary)
}

/// Push the work branch and open (or reuse) its pull request when it has
/// commits the base does not.
fn publish(ctx: &RunContext<'_>, summary: &mut RunSummary) -> Result<()> {
    let git_settings = &ctx.config.settings.git;
    let Some(branch) = summary.branch.clone() else {
        return Ok(());
    };
    let ahead = ctx.git.commits_ahead(&git_settings.base_branch, &branch)?;
    if ahead == 0 {
        info!("no commits ahead of base; nothing to publish");
        return Ok(());
    }
    if !git_settings.push {
        info!(ahead, "push disabled; leaving branch local");
        return Ok(());
    }
    ctx.git.push(&branch).with_context(|| format!("push {branch}"))?;
    summary.pushed = true;

    let title = match summary.issue_title.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(title) => format!("patchloop: {} (#{})", title.trim(), summary.issue_number),
        None => format!("patchloop: issue #{}", summary.issue_number),
    };
    let url = ctx.services.tracker.ensure_pull_request(&PullRequestSpec {
        repo: summary.repo.clone(),
        head: branch,
        base: git_settings.base_branch.clone(),
        title,
        body: pull_request_body(summary),
    })?;
    info!(url = %url, "pull request ready");
    summary.pull_request_url = Some(url);
    Ok(())
}

fn pull_request_body(summary: &RunSummary) -> String {
    let mut body = format!("Closes #{}\n\n", summary.issue_number);
    if let Some(plan) = &summary.plan_summary {
        let _ = writeln!(body, "{plan}\n");
    }
    let _ = writeln!(
        body,
        "Status: **{}** after {} iteration(s).",
        summary.status,
        summary.iterations.len()
    );
    body
}

fn outcome_label(outcome: IterationOutcome) -> &'static str {
    match outcome {
        IterationOutcome::Continue => "continue",
        IterationOutcome::NoChange => "no change",
        IterationOutcome::PolicyReverted => "policy reverted",
        IterationOutcome::EarlyStop => "verified",
        IterationOutcome::Stuck => "stuck",
    }
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# patchloop run {}\n", summary.run_id);
    let _ = writeln!(out, "- Status: **{}** (exit {})", summary.status, summary.exit_code);
    let _ = writeln!(out, "- Issue: {}#{}", summary.repo, summary.issue_number);
    if let Some(title) = &summary.issue_title {
        let _ = writeln!(out, "- Title: {title}");
    }
    if let Some(branch) = &summary.branch {
        let _ = writeln!(out, "- Branch: `{branch}`");
    }
    if let Some(stack) = &summary.stack_id {
        let language = summary.language.as_deref().unwrap_or("unknown");
        let _ = writeln!(out, "- Stack: `{stack}` ({language})");
    }
    if let Some(url) = &summary.pull_request_url {
        let _ = writeln!(out, "- Pull request: {url}");
    }

    if let Some(error) = &summary.error {
        let _ = writeln!(out, "\n## Error\n\n`{}`: {}", error.class, error.message);
    }

    if !summary.iterations.is_empty() {
        let max = summary
            .max_iterations
            .map(|m| m.to_string())
            .unwrap_or_else(|| "?".to_string());
        let _ = writeln!(out, "\n## Iterations ({} of {max})\n", summary.iterations.len());
        let _ = writeln!(out, "| # | outcome | exit | failure | changed files | note |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for record in &summary.iterations {
            let exit = record
                .test_exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            let failure = record
                .failure
                .as_ref()
                .map(|f| f.kind.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                record.index,
                outcome_label(record.outcome),
                exit,
                failure,
                record.changed_files.len(),
                record.note.replace('|', "\\|")
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureKind, FailureMeta};

    fn record(index: u32, outcome: IterationOutcome) -> IterationRecord {
        IterationRecord {
            index,
            changed_files: vec!["src/loan.py".to_string()],
            test_exit_code: Some(1),
            test_output: String::new(),
            failure: Some(FailureMeta {
                kind: FailureKind::FloatPrecisionMismatch,
                hints: Vec::new(),
                signature: "float_precision_mismatch:abc".to_string(),
                matched_rule_id: None,
            }),
            outcome,
            note: "tests failed | twice".to_string(),
            stuck_count: 1,
            started_at: String::new(),
            duration_ms: 5,
        }
    }

    #[test]
    fn status_maps_to_stable_exit_codes() {
        assert_eq!(RunStatus::Verified.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Invalid.exit_code(), 2);
        assert_eq!(RunStatus::Stuck.exit_code(), 3);
        assert_eq!(RunStatus::Exhausted.exit_code(), 4);
        assert_eq!(RunStatus::from_error(ErrorClass::Security), RunStatus::Invalid);
        assert_eq!(RunStatus::from_error(ErrorClass::Policy), RunStatus::Failed);
    }

    #[test]
    fn markdown_lists_iterations_and_errors() {
        let facts = RunFacts {
            run_id: "run-1".to_string(),
            repo: "acme/loans".to_string(),
            issue_number: 7,
            branch: Some("patchloop/issue-7".to_string()),
            stack_id: Some("python-pytest".to_string()),
            language: Some("python".to_string()),
            max_iterations: Some(3),
            records: vec![record(1, IterationOutcome::Continue), record(2, IterationOutcome::Stuck)],
            ..RunFacts::default()
        };
        let mut summary = RunSummary::new(&facts, RunStatus::Stuck);
        summary.set_error(&anyhow::anyhow!("push rejected"));

        let md = render_markdown(&summary);
        assert!(md.contains("- Status: **failed** (exit 1)"));
        assert!(md.contains("## Iterations (2 of 3)"));
        assert!(md.contains("| 2 | stuck | 1 | float_precision_mismatch | 1 | tests failed \\| twice |"));
        assert!(md.contains("`internal`: push rejected"));
    }
}
