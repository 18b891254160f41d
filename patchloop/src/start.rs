//! Everything before the first patch: request, issue, branch, stack, contract
//! lock and plan.
//!
//! Nothing in the repository is touched until the request is parsed. A stack that
//! cannot be resolved fails before any completion call.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::contract::ContractSnapshot;
use crate::core::request::{RunRequest, extract_run_request};
use crate::core::types::Plan;
use crate::finalize::RunFacts;
use crate::io::github::Issue;
use crate::io::prompt::{PlanPromptInputs, read_snapshot};
use crate::io::snapshot::capture_snapshot;
use crate::run::{RunContext, RunInput};
use crate::stack::bootstrap::{PreflightOptions, preflight};
use crate::stack::markers::{MarkerSet, list_files};
use crate::stack::resolve::{ResolveOptions, resolve_stack};
use crate::stack::spec::StackSpec;
use crate::validate::validate_plan;

/// Repository files quoted into the planning prompt besides the markers.
const PLAN_CONTEXT_FILES: &[&str] = &["README.md", "README", "readme.md"];

/// State handed to the iteration loop.
#[derive(Debug, Clone)]
pub struct Started {
    pub request: RunRequest,
    pub issue: Issue,
    pub branch: String,
    pub stack: StackSpec,
    pub plan: Plan,
    /// Public surface captured before the first patch.
    pub lock: ContractSnapshot,
}

#[instrument(skip_all, fields(issue = input.issue_number))]
pub fn start_run(ctx: &RunContext<'_>, input: &RunInput, facts: &mut RunFacts) -> Result<Started> {
    let settings = &ctx.config.settings;
    let artifacts = ctx.artifacts;

    let request = extract_run_request(&input.comment_body, &settings.iterations, &ctx.config.schemas)?;
    artifacts.write_json("request.json", &request)?;
    facts.max_iterations = Some(request.max_iterations);

    let issue = ctx
        .services
        .tracker
        .fetch_issue(&input.repo, input.issue_number)
        .with_context(|| format!("fetch issue {}#{}", input.repo, input.issue_number))?;
    facts.issue_title = Some(issue.title.clone());

    ctx.git.ensure_clean()?;
    let branch = format!("{}{}", settings.git.branch_prefix, input.issue_number);
    ctx.git
        .ensure_branch(&branch, &settings.git.base_branch)
        .with_context(|| format!("prepare branch {branch}"))?;
    facts.branch = Some(branch.clone());

    let resolution = resolve_stack(
        &request,
        ctx.root,
        &ctx.config.catalog,
        &ResolveOptions {
            require_test_command: true,
            runners: settings.test_runners.clone(),
        },
    )?;
    artifacts.write_json("stack.json", &resolution)?;
    let stack = resolution.spec;
    facts.stack_id = Some(stack.stack_id.clone());
    facts.language = Some(stack.language.clone());
    info!(stack = %stack.stack_id, test_command = %stack.test_command(), "stack resolved");

    let report = preflight(
        &stack,
        ctx.root,
        PreflightOptions {
            command_timeout: settings.bootstrap_timeout(),
            output_limit_bytes: settings.output_limit_bytes,
        },
    )?;
    artifacts.write_json("preflight.json", &report)?;
    if report.bootstrap_applied {
        let message = format!("patchloop: bootstrap {} project", stack.stack_id);
        if ctx.git.commit_all(&message)? {
            info!(files = report.created_files.len(), "committed bootstrap");
        }
    }

    let lock = capture_snapshot(ctx.root)?;
    artifacts.write_json("contract.lock.json", &lock)?;

    let plan = make_plan(ctx, &request, &stack, &issue)?;
    facts.plan_summary = Some(plan.summary.clone());

    Ok(Started {
        request,
        issue,
        branch,
        stack,
        plan,
        lock,
    })
}

fn make_plan(ctx: &RunContext<'_>, request: &RunRequest, stack: &StackSpec, issue: &Issue) -> Result<Plan> {
    let tree = list_files(ctx.root)?;
    let context_files = plan_context_files(&tree, &stack.markers.any_of)?;
    let snapshot = read_snapshot(
        ctx.root,
        &context_files,
        ctx.config.settings.snapshot_file_limit_bytes,
    )?;
    let pack = ctx.prompts.build_plan(&PlanPromptInputs {
        request,
        stack,
        issue: Some(issue),
        tree: &tree,
        snapshot: &snapshot,
    })?;
    let raw = ctx.complete(pack).context("planning completion")?;
    ctx.artifacts.write_json("plan.raw.json", &raw)?;

    let validation = ctx.validation(&request.acceptance_criteria, ctx.artifacts.dir());
    let plan = validate_plan(&validation, raw)?;
    ctx.artifacts.write_json("plan.json", &plan.json)?;
    info!(tasks = plan.value.tasks.len(), repaired = plan.repaired, "plan accepted");
    Ok(plan.value)
}

/// Marker files (manifests, project files) plus a README, in tree order.
fn plan_context_files(tree: &[String], markers: &[String]) -> Result<Vec<String>> {
    let markers = MarkerSet::new(markers)?;
    Ok(tree
        .iter()
        .filter(|path| PLAN_CONTEXT_FILES.contains(&path.as_str()) || markers.matches(path))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_context_keeps_markers_and_readme() {
        let tree = vec![
            "README.md".to_string(),
            "pyproject.toml".to_string(),
            "src/loan.py".to_string(),
            "tests/test_loan.py".to_string(),
        ];
        let files = plan_context_files(&tree, &["pyproject.toml".to_string(), "**/*.csproj".to_string()])
            .expect("context");
        assert_eq!(files, vec!["README.md", "pyproject.toml"]);
    }
}
