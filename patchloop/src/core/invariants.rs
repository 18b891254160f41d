//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::{FileOperation, PatchObject, Plan, TestReport};

/// Minimum task id length accepted in a plan.
pub const MIN_TASK_ID_LEN: usize = 2;

/// Check plan invariants:
/// - at least one task
/// - ids unique and at least [`MIN_TASK_ID_LEN`] chars
/// - task title and description non-empty
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.summary.trim().is_empty() {
        errors.push("plan summary must not be empty".to_string());
    }
    if plan.test_strategy.trim().is_empty() {
        errors.push("plan test_strategy must not be empty".to_string());
    }
    if plan.tasks.is_empty() {
        errors.push("plan must contain at least one task".to_string());
    }
    let mut seen = HashSet::new();
    for (i, task) in plan.tasks.iter().enumerate() {
        let id = task.id.trim();
        if id.chars().count() < MIN_TASK_ID_LEN {
            errors.push(format!(
                "tasks[{i}]: id '{id}' shorter than {MIN_TASK_ID_LEN} chars"
            ));
        }
        if !seen.insert(id.to_string()) {
            errors.push(format!("tasks[{i}]: duplicate id '{id}'"));
        }
        if task.title.trim().is_empty() {
            errors.push(format!("tasks[{i}]: title must not be empty"));
        }
        if task.description.trim().is_empty() {
            errors.push(format!("tasks[{i}]: description must not be empty"));
        }
    }
    errors
}

/// Check patch invariants: non-empty, no diff without text.
pub fn validate_patch(patch: &PatchObject) -> Vec<String> {
    let mut errors = Vec::new();
    if patch.is_empty() {
        errors.push("patch has no files and no patches".to_string());
    }
    for (path, change) in &patch.files {
        if path.trim().is_empty() {
            errors.push("files: empty path key".to_string());
        }
        if change.operation == FileOperation::Delete && !change.content.is_empty() {
            errors.push(format!("files['{path}']: delete must not carry content"));
        }
    }
    for (i, diff) in patch.patches.iter().enumerate() {
        if diff.diff.trim().is_empty() {
            errors.push(format!("patches[{i}]: diff must not be empty"));
        }
    }
    errors
}

/// Check that every requested criterion is reported.
pub fn validate_report(report: &TestReport, acceptance_criteria: &[String]) -> Vec<String> {
    let mut errors = Vec::new();
    let reported: HashSet<String> = report
        .acceptance_criteria_status
        .iter()
        .map(|c| c.criterion.trim().to_lowercase())
        .collect();
    for criterion in acceptance_criteria {
        if !reported.contains(&criterion.trim().to_lowercase()) {
            errors.push(format!("acceptance criterion not reported: '{criterion}'"));
        }
    }
    if let Some(patch) = &report.recommended_patch
        && !patch.is_empty()
    {
        errors.extend(
            validate_patch(patch)
                .into_iter()
                .map(|e| format!("recommended_patch: {e}")),
        );
    }
    errors
}
