//! Completion service abstraction.
//!
//! The [`CompletionService`] trait decouples the loop from the model backend
//! (currently `codex exec`). Tests use scripted services that return canned
//! JSON without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::schema::Contract;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// One structured-output request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub contract: Contract,
    pub system: String,
    pub user: String,
    /// JSON Schema the answer must satisfy, when the contract has one.
    pub schema: Option<String>,
}

/// Abstraction over model backends. Implementations return the raw JSON
/// value; normalization and validation happen in the caller.
pub trait CompletionService {
    fn complete(&self, request: &CompletionRequest) -> Result<Value>;
}

/// Completion service that spawns `codex exec` in a read-only sandbox.
#[derive(Debug)]
pub struct CodexCompletion {
    /// Repository the model may read.
    pub workdir: PathBuf,
    /// Prompt, schema, output and log files land here.
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    calls: AtomicU32,
}

impl CodexCompletion {
    pub fn new(
        workdir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
            output_limit_bytes,
            calls: AtomicU32::new(0),
        }
    }
}

impl CompletionService for CodexCompletion {
    #[instrument(skip_all, fields(contract = %request.contract, timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, request: &CompletionRequest) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let stem = format!("{call:02}-{}", request.contract.name());
        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        let output_path = self.scratch_dir.join(format!("{stem}.out.json"));
        let log_path = self.scratch_dir.join(format!("{stem}.log"));
        let prompt = format!("{}\n\n{}", request.system.trim(), request.user.trim());
        fs::write(self.scratch_dir.join(format!("{stem}.prompt.md")), &prompt)
            .context("write completion prompt")?;

        info!(workdir = %self.workdir.display(), "starting codex exec");
        let mut cmd = Command::new("codex");
        cmd.arg("exec")
            .arg("-c")
            .arg("model_reasoning_effort=medium")
            .arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check");
        if let Some(schema) = &request.schema {
            let schema_path = self.scratch_dir.join(format!("{stem}.schema.json"));
            fs::write(&schema_path, schema).context("write output schema")?;
            cmd.arg("--output-schema").arg(&schema_path);
        }
        cmd.arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&self.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run codex exec")?;
        write_completion_log(&log_path, &output, self.output_limit_bytes)?;

        if output.timed_out {
            warn!("codex exec timed out");
            return Err(anyhow!("codex exec timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?}",
                output.status.code()
            ));
        }
        let text = fs::read_to_string(&output_path)
            .with_context(|| format!("read completion output {}", output_path.display()))?;
        debug!(bytes = text.len(), "codex exec completed");
        parse_completion_json(&text)
    }
}

/// Parse a model answer as JSON, tolerating code fences and prose around
/// the object.
pub fn parse_completion_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .context("parse JSON object in completion output"),
        _ => Err(anyhow!("completion output contains no JSON object")),
    }
}

fn write_completion_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    let mut buf = output.combined_text("codex");
    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }
    fs::write(path, buf).with_context(|| format!("write completion log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_and_fenced_json() {
        assert_eq!(
            parse_completion_json(" {\"passed\": true} ").expect("plain"),
            json!({"passed": true})
        );
        let fenced = "Here you go:\n```json\n{\"summary\": \"x\", \"tasks\": []}\n```\n";
        assert_eq!(
            parse_completion_json(fenced).expect("fenced"),
            json!({"summary": "x", "tasks": []})
        );
    }

    #[test]
    fn rejects_output_without_object() {
        let err = parse_completion_json("I could not do it").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }
}
