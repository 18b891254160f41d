//! `patchloop run`: one issue, one branch, one pull request.
//!
//! `run_agent` drives start, the iteration loop and finalize, and always
//! produces a [`RunSummary`], also when a stage fails.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use tracing::{info, instrument};

use crate::engine::EngineConfig;
use crate::finalize::{RunFacts, RunSummary, finalize};
use crate::io::artifacts::RunArtifacts;
use crate::io::completion::{CompletionRequest, CompletionService};
use crate::io::git::Git;
use crate::io::github::IssueTracker;
use crate::io::prompt::{PromptBuilder, PromptPack};
use crate::io::test_runner::TestRunner;
use crate::looping::{LoopStop, run_loop};
use crate::start::start_run;
use crate::validate::Validation;

/// What to work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInput {
    /// `owner/name`.
    pub repo: String,
    pub issue_number: u64,
    /// Comment that triggered the run; carries the `/agent run {...}` request.
    pub comment_body: String,
    pub workdir: PathBuf,
}

/// External collaborators, swapped for scripted fakes in tests.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub completion: &'a dyn CompletionService,
    pub tests: &'a dyn TestRunner,
    pub tracker: &'a dyn IssueTracker,
}

/// Shared by every stage of one run.
pub struct RunContext<'a> {
    pub config: &'a EngineConfig,
    pub services: Services<'a>,
    pub artifacts: &'a RunArtifacts,
    pub root: &'a Path,
    pub git: Git,
    pub prompts: PromptBuilder,
}

impl<'a> RunContext<'a> {
    pub fn new(
        config: &'a EngineConfig,
        services: Services<'a>,
        artifacts: &'a RunArtifacts,
        root: &'a Path,
    ) -> Self {
        Self {
            config,
            services,
            artifacts,
            root,
            git: Git::new(root),
            prompts: PromptBuilder::new(config.settings.prompt_budget_bytes),
        }
    }

    /// Send a rendered prompt with its contract schema attached.
    pub fn complete(&self, pack: PromptPack) -> Result<Value> {
        let request = CompletionRequest {
            contract: pack.contract,
            system: pack.system,
            user: pack.user,
            schema: pack.contract.schema_source().map(str::to_string),
        };
        self.services.completion.complete(&request)
    }

    pub fn validation<'b>(&'b self, acceptance_criteria: &'b [String], dir: &'b Path) -> Validation<'b> {
        Validation {
            schemas: &self.config.schemas,
            completion: self.services.completion,
            prompts: &self.prompts,
            acceptance_criteria,
            artifacts_dir: dir,
        }
    }
}

/// Run the agent end to end. Stage failures end up in the summary; only
/// failing to write the summary itself is returned as an error.
#[instrument(skip_all, fields(repo = %input.repo, issue = input.issue_number, run_id = %artifacts.run_id()))]
pub fn run_agent(
    input: &RunInput,
    config: &EngineConfig,
    services: Services<'_>,
    artifacts: &RunArtifacts,
) -> Result<RunSummary> {
    let ctx = RunContext::new(config, services, artifacts, &input.workdir);
    let mut facts = RunFacts::new(input, artifacts.run_id());
    let result = drive(&ctx, input, &mut facts);
    let summary = finalize(&ctx, &facts, result)?;
    info!(status = %summary.status, iterations = summary.iterations.len(), "run finished");
    Ok(summary)
}

fn drive(ctx: &RunContext<'_>, input: &RunInput, facts: &mut RunFacts) -> Result<LoopStop> {
    let started = start_run(ctx, input, facts)?;
    run_loop(ctx, &started, facts)
}
