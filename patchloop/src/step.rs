//! One loop iteration: implement, apply, police, commit, test, report, decide.
//!
//! Every stage leaves its artifact under `iterations/<n>/`. Iterations that
//! are rejected (unusable patch, policy violation) revert the working tree so
//! the next one starts from the last commit.

use std::fs;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::authenticity::{AddedTestFile, is_test_path};
use crate::core::classifier::{failure_signature, summarize_hints};
use crate::core::contract::ContractSnapshot;
use crate::core::decide::{TestVerdict, decide, decide_policy_revert};
use crate::core::stuck::StuckTracker;
use crate::core::types::{FailureKind, FailureMeta, IterationOutcome, IterationRecord, PatchObject};
use crate::errors::{ContractViolationError, PatchApplyError};
use crate::io::artifacts::IterationArtifacts;
use crate::io::config::ContractMode;
use crate::io::patch_apply::apply_patch;
use crate::io::prompt::{ImplementPromptInputs, TestReportPromptInputs, read_snapshot};
use crate::io::snapshot::capture_snapshot;
use crate::io::test_runner::TestRequest;
use crate::run::RunContext;
use crate::start::Started;
use crate::validate::{validate_patch, validate_report};

const NO_CHANGE_HINT: &str =
    "The last patch changed no files. Produce concrete file contents that move the tests forward.";
const CONTRACT_HINT: &str =
    "Keep every existing public function, method, class and endpoint with its signature; add new ones instead.";

/// Carried from one iteration to the next.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub tracker: StuckTracker,
    /// Fed into the next implementation prompt.
    pub hints: Vec<String>,
    pub recommended_patch: Option<PatchObject>,
    pub previous_output: Option<String>,
    pub last_changed: Vec<String>,
    pub lock: ContractSnapshot,
}

impl LoopState {
    pub fn new(lock: ContractSnapshot) -> Self {
        Self {
            lock,
            ..Self::default()
        }
    }
}

/// Run iteration `index`. Fatal conditions (unsafe paths or commands, terminal
/// schema failures, contract violations in abort mode, I/O) are returned as
/// errors; everything else ends up in the record's outcome.
#[instrument(skip_all, fields(iteration = index))]
pub fn run_step(
    ctx: &RunContext<'_>,
    started: &Started,
    index: u32,
    state: &mut LoopState,
) -> Result<IterationRecord> {
    let clock = Instant::now();
    let mut record = IterationRecord {
        index,
        changed_files: Vec::new(),
        test_exit_code: None,
        test_output: String::new(),
        failure: None,
        outcome: IterationOutcome::Continue,
        note: String::new(),
        stuck_count: 0,
        started_at: Utc::now().to_rfc3339(),
        duration_ms: 0,
    };
    let dir = ctx.artifacts.iteration(index)?;
    let outcome = iterate(ctx, started, index, state, &dir, &mut record)?;
    record.outcome = outcome;
    record.stuck_count = state.tracker.count();
    record.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
    dir.write_json("record.json", &record)?;
    info!(outcome = ?record.outcome, stuck = record.stuck_count, "iteration finished");
    Ok(record)
}

fn iterate(
    ctx: &RunContext<'_>,
    started: &Started,
    index: u32,
    state: &mut LoopState,
    dir: &IterationArtifacts,
    record: &mut IterationRecord,
) -> Result<IterationOutcome> {
    let settings = &ctx.config.settings;
    let thresholds = &settings.stuck;
    let criteria = &started.request.acceptance_criteria;
    let validation = ctx.validation(criteria, dir.dir());

    // Implement.
    let snapshot_paths = implement_context_files(&started.plan.files_to_touch, &state.last_changed);
    let snapshot = read_snapshot(ctx.root, &snapshot_paths, settings.snapshot_file_limit_bytes)?;
    let pack = ctx.prompts.build_implement(&ImplementPromptInputs {
        iteration: index,
        max_iterations: started.request.max_iterations,
        request: &started.request,
        stack: &started.stack,
        plan: &started.plan,
        hints: &state.hints,
        recommended_patch: state.recommended_patch.as_ref(),
        snapshot: &snapshot,
        previous_output: state.previous_output.as_deref(),
    })?;
    let raw = ctx.complete(pack)?;
    dir.write_json("patch.model.json", &raw)?;
    let patch = validate_patch(&validation, raw)?;
    dir.write_json("patch.json", &patch.json)?;

    // Apply.
    let applied = match apply_patch(&patch.value, ctx.root, &ctx.git) {
        Ok(applied) => applied,
        Err(err) => {
            ctx.git.revert_worktree()?;
            let Some(rejected) = err.downcast_ref::<PatchApplyError>() else {
                return Err(err);
            };
            warn!(err = %rejected, "patch rejected");
            let targets = patch_targets(&patch.value);
            let failure = FailureMeta {
                kind: FailureKind::PatchRejected,
                hints: vec![
                    format!("The last patch could not be applied: {rejected}"),
                    "Send complete file contents in `files` instead of diffs that do not match the tree."
                        .to_string(),
                ],
                signature: failure_signature(&FailureKind::PatchRejected, &rejected.to_string()),
                matched_rule_id: None,
            };
            dir.write_json("failure.json", &failure)?;
            let verdict = TestVerdict {
                exit_code: 1,
                report_passed: false,
                all_criteria_met: false,
            };
            let outcome = decide(&verdict, Some(&failure), &targets, &mut state.tracker, thresholds);
            state.hints = summarize_hints(&failure.hints, settings.hint_limit);
            record.changed_files = targets;
            record.note = format!("patch rejected: {rejected}");
            record.failure = Some(failure);
            return Ok(outcome);
        }
    };
    dir.write_json("patch.applied.json", &applied)?;

    let changed = ctx.git.changed_paths()?;
    dir.write_text("changed_files.txt", &lines(&changed))?;
    record.changed_files = changed.clone();
    if changed.is_empty() {
        warn!("patch produced no file changes; skipping tests");
        let mut hints = vec![NO_CHANGE_HINT.to_string()];
        hints.extend(state.hints.iter().cloned());
        state.hints = summarize_hints(&hints, settings.hint_limit);
        record.note = "patch produced no file changes; tests skipped".to_string();
        return Ok(IterationOutcome::NoChange);
    }

    // Contract check against the lock.
    let current = capture_snapshot(ctx.root)?;
    let violations = state.lock.violations(&current);
    if !violations.is_empty() {
        dir.write_json("contract.snapshot.json", &current)?;
        ctx.git.revert_worktree()?;
        warn!(count = violations.len(), "breaking contract change reverted");
        if settings.contract_mode == ContractMode::Abort {
            return Err(ContractViolationError {
                iteration: index,
                violations,
            }
            .into());
        }
        record.note = format!("breaking change reverted: {}", violations.join("; "));
        return Ok(policy_revert(ctx, state, record, violations, CONTRACT_HINT));
    }

    // Test authenticity on newly added test files.
    let added = added_test_files(ctx, &changed)?;
    if !added.is_empty() {
        for policy in &ctx.config.policies {
            let violations = policy.check(&added);
            if violations.is_empty() {
                continue;
            }
            ctx.git.revert_worktree()?;
            warn!(policy = policy.name(), count = violations.len(), "test authenticity violation reverted");
            record.note = format!("{} violation: {}", policy.name(), violations.join("; "));
            return Ok(policy_revert(ctx, state, record, violations, policy.remediation()));
        }
    }

    let message = format!(
        "patchloop: iteration {index} for #{}",
        started.issue.number
    );
    ctx.git.commit_all(&message)?;

    // Test.
    let run = ctx.services.tests.run(&TestRequest {
        workdir: ctx.root.to_path_buf(),
        command: started.stack.test_command().to_string(),
        runners: settings.test_runners.clone(),
        allowed_prefixes: started.stack.allowed_test_prefixes.clone(),
        timeout: settings.test_timeout(),
        output_limit_bytes: settings.output_limit_bytes,
    })?;
    dir.write_text("test_output.txt", &run.output)?;
    let output_tail = tail(&run.output, settings.test_output_tail_bytes);
    record.test_exit_code = Some(run.exit_code);
    record.test_output = output_tail.clone();

    // Classify.
    let failure = (run.exit_code != 0).then(|| {
        let mut meta = ctx.config.rules.classify(&run.output, &started.stack.language);
        meta.hints = summarize_hints(&meta.hints, settings.hint_limit);
        meta
    });
    if let Some(failure) = &failure {
        debug!(kind = %failure.kind, signature = %failure.signature, "test failure classified");
        dir.write_json("failure.json", failure)?;
        dir.write_json("failure_hints.json", &failure.hints)?;
    }
    let classifier_hints = failure.as_ref().map(|f| f.hints.clone()).unwrap_or_default();

    // Report.
    let pack = ctx.prompts.build_test_report(&TestReportPromptInputs {
        request: &started.request,
        test_command: started.stack.test_command(),
        exit_code: run.exit_code,
        test_output: &output_tail,
        hints: &classifier_hints,
    })?;
    let raw = ctx.complete(pack)?;
    dir.write_json("test_report.raw.json", &raw)?;
    let report = validate_report(&validation, raw)?;
    dir.write_json("test_report.json", &report.json)?;

    // Decide.
    let verdict = TestVerdict {
        exit_code: run.exit_code,
        report_passed: report.value.passed,
        all_criteria_met: report.value.all_criteria_met(),
    };
    let outcome = decide(&verdict, failure.as_ref(), &changed, &mut state.tracker, thresholds);

    if run.exit_code == 0 {
        match state.lock.merge_additive(&current) {
            Ok(lock) => {
                state.lock = lock;
                ctx.artifacts.write_json("contract.lock.json", &state.lock)?;
            }
            Err(violations) => warn!(?violations, "lock not extended"),
        }
    }

    let mut hints = classifier_hints;
    hints.extend(report.value.failure_hints.iter().cloned());
    state.hints = summarize_hints(&hints, settings.hint_limit);
    state.recommended_patch = report.value.recommended_patch.clone().filter(|p| !p.is_empty());
    state.previous_output = Some(output_tail);
    state.last_changed = changed;

    record.note = if verdict.verified() {
        "tests pass and every acceptance criterion is met".to_string()
    } else if run.timed_out {
        "test run timed out".to_string()
    } else {
        report.value.summary.trim().to_string()
    };
    record.failure = failure;
    Ok(outcome)
}

/// Record a reverted iteration as a policy violation.
fn policy_revert(
    ctx: &RunContext<'_>,
    state: &mut LoopState,
    record: &mut IterationRecord,
    violations: Vec<String>,
    remediation: &str,
) -> IterationOutcome {
    let settings = &ctx.config.settings;
    let signature = failure_signature(&FailureKind::PolicyViolation, &violations.join("\n"));
    let mut hints = vec![remediation.to_string()];
    hints.extend(violations);
    let failure = FailureMeta {
        kind: FailureKind::PolicyViolation,
        hints: summarize_hints(&hints, settings.hint_limit),
        signature,
        matched_rule_id: None,
    };
    let outcome = decide_policy_revert(&failure, &record.changed_files, &mut state.tracker, &settings.stuck);
    state.hints = failure.hints.clone();
    record.failure = Some(failure);
    outcome
}

/// Test files the iteration created (not present in HEAD).
fn added_test_files(ctx: &RunContext<'_>, changed: &[String]) -> Result<Vec<AddedTestFile>> {
    let mut added = Vec::new();
    for path in changed.iter().filter(|p| is_test_path(p)) {
        let full = ctx.root.join(path);
        if !full.is_file() || ctx.git.is_tracked(path)? {
            continue;
        }
        let bytes = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
        added.push(AddedTestFile {
            path: path.clone(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(added)
}

/// Files the plan names plus the ones touched last time, deduplicated.
fn implement_context_files(planned: &[String], last_changed: &[String]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in planned.iter().chain(last_changed) {
        let path = path.trim().trim_start_matches("./");
        if !path.is_empty() && !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}

fn patch_targets(patch: &PatchObject) -> Vec<String> {
    let mut paths: Vec<String> = patch
        .files
        .keys()
        .cloned()
        .chain(patch.patches.iter().map(|p| p.path.clone()).filter(|p| !p.is_empty()))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

fn lines(paths: &[String]) -> String {
    let mut out = paths.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Last `limit` bytes of `text`, cut at a char boundary.
fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("aéb", 2), "b");
    }

    #[test]
    fn implement_context_merges_plan_and_last_changes() {
        let planned = vec!["./src/loan.py".to_string(), "tests/test_loan.py".to_string()];
        let last = vec!["src/loan.py".to_string(), "src/rates.py".to_string()];
        assert_eq!(
            implement_context_files(&planned, &last),
            vec!["src/loan.py", "tests/test_loan.py", "src/rates.py"]
        );
    }

    #[test]
    fn patch_targets_cover_files_and_diffs() {
        let patch: PatchObject = serde_json::from_value(serde_json::json!({
            "files": {"b.py": {"operation": "add", "content": "x"}},
            "patches": [{"path": "a.py", "diff": "--- a/a.py\n+++ b/a.py\n"}, {"path": "b.py", "diff": "x"}]
        }))
        .expect("patch");
        assert_eq!(patch_targets(&patch), vec!["a.py", "b.py"]);
    }
}
