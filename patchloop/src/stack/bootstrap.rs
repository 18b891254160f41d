//! Preflight: scaffold stack markers that are missing from the repository.
//!
//! Templates are written only when absent. Bootstrap commands run shell-free
//! with a timeout; their failures are reported, not raised.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::command_safety::SHELL_METACHARACTERS;
use crate::core::path::normalize_patch_path;
use crate::io::process::run_command_with_timeout;
use crate::stack::markers::{exists_any, list_files};
use crate::stack::spec::{Bootstrap, StackSpec};

const COMMAND_OUTPUT_TAIL: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapCommandRun {
    pub command: String,
    pub exit_code: Option<i32>,
    pub output_tail: String,
}

/// Persisted as `preflight.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub stack_id: String,
    pub language: String,
    pub markers_any_of: Vec<String>,
    pub markers_found: bool,
    pub bootstrap_kind: String,
    pub bootstrap_applied: bool,
    pub created_files: Vec<String>,
    pub commands_run: Vec<BootstrapCommandRun>,
    pub markers_found_after: Option<bool>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
}

#[instrument(skip_all, fields(stack_id = %spec.stack_id))]
pub fn preflight(spec: &StackSpec, root: &Path, options: PreflightOptions) -> Result<PreflightReport> {
    let markers = spec.markers.any_of.clone();
    let mut report = PreflightReport {
        stack_id: spec.stack_id.clone(),
        language: spec.language.clone(),
        markers_any_of: markers.clone(),
        bootstrap_kind: spec.bootstrap.kind().to_string(),
        ..PreflightReport::default()
    };

    if markers.is_empty() {
        report
            .notes
            .push("no markers declared for this stack; skipping bootstrap".to_string());
        return Ok(report);
    }
    report.markers_found = exists_any(&list_files(root)?, &markers)?;
    if report.markers_found {
        report.notes.push("markers present; skipping bootstrap".to_string());
        return Ok(report);
    }

    report.notes.push("markers missing; attempting bootstrap".to_string());
    match &spec.bootstrap {
        Bootstrap::None => {
            report
                .notes
                .push("bootstrap is none; cannot scaffold automatically".to_string());
        }
        Bootstrap::Templates { templates } => {
            // Validate every path before writing anything.
            let paths = templates
                .iter()
                .map(|t| normalize_patch_path(&t.path))
                .collect::<Result<Vec<_>, _>>()?;
            for (rel, template) in paths.iter().zip(templates) {
                let target = root.join(rel);
                if target.exists() {
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&target, &template.content)
                    .with_context(|| format!("write {}", target.display()))?;
                report.created_files.push(rel.clone());
            }
            report.bootstrap_applied = true;
            info!(created = report.created_files.len(), "template bootstrap applied");
        }
        Bootstrap::Commands { commands } => {
            for command in commands.iter().filter(|c| !c.trim().is_empty()) {
                report.commands_run.push(run_bootstrap_command(command, root, options)?);
            }
            report.bootstrap_applied = true;
        }
    }

    let found_after = exists_any(&list_files(root)?, &markers)?;
    if !found_after {
        warn!("markers still missing after bootstrap");
        report
            .notes
            .push("markers still missing after bootstrap".to_string());
    }
    report.markers_found_after = Some(found_after);
    Ok(report)
}

fn run_bootstrap_command(
    command: &str,
    root: &Path,
    options: PreflightOptions,
) -> Result<BootstrapCommandRun> {
    if command.contains(SHELL_METACHARACTERS) {
        warn!(command, "skipping bootstrap command with shell syntax");
        return Ok(BootstrapCommandRun {
            command: command.to_string(),
            exit_code: None,
            output_tail: "skipped: shell metacharacters are not allowed".to_string(),
        });
    }
    let argv: Vec<&str> = command.split_whitespace().collect();
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]).current_dir(root);
    match run_command_with_timeout(cmd, None, options.command_timeout, options.output_limit_bytes)
    {
        Ok(out) => Ok(BootstrapCommandRun {
            command: command.to_string(),
            exit_code: Some(out.exit_code()),
            output_tail: tail(&out.combined_text("bootstrap"), COMMAND_OUTPUT_TAIL),
        }),
        Err(err) => {
            warn!(command, err = %err, "bootstrap command failed to start");
            Ok(BootstrapCommandRun {
                command: command.to_string(),
                exit_code: None,
                output_tail: format!("{err:#}"),
            })
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
