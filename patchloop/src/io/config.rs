//! Agent settings (TOML), usually pointed at by `PATCHLOOP_CONFIG`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::command_safety::default_runners;
use crate::core::request::IterationLimits;
use crate::core::stuck::StuckThresholds;

/// What to do when a patch breaks the locked public contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractMode {
    /// Revert and end the run.
    #[default]
    Abort,
    /// Revert and keep iterating with the violations as hints.
    Revert,
}

/// Agent settings (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Truncate captured process output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Test output kept in iteration records and prompts.
    pub test_output_tail_bytes: usize,
    /// Byte budget for a rendered prompt.
    pub prompt_budget_bytes: usize,
    /// Per-file cap when quoting repository files into prompts.
    pub snapshot_file_limit_bytes: usize,
    pub hint_limit: usize,
    pub contract_mode: ContractMode,
    /// Executables allowed to start a test command.
    pub test_runners: Vec<String>,

    // Tables last so the TOML output stays valid.
    pub iterations: IterationLimits,
    pub stuck: StuckThresholds,
    pub timeouts: TimeoutSettings,
    pub git: GitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub completion_secs: u64,
    pub test_secs: u64,
    pub bootstrap_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            completion_secs: 15 * 60,
            test_secs: 20 * 60,
            bootstrap_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitSettings {
    pub base_branch: String,
    /// Work branch is `<prefix><issue number>`.
    pub branch_prefix: String,
    pub push: bool,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: "patchloop/issue-".to_string(),
            push: true,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            output_limit_bytes: 200_000,
            test_output_tail_bytes: 12_000,
            prompt_budget_bytes: 60_000,
            snapshot_file_limit_bytes: 8_000,
            hint_limit: crate::core::classifier::DEFAULT_HINT_LIMIT,
            contract_mode: ContractMode::default(),
            test_runners: default_runners(),
            iterations: IterationLimits::default(),
            stuck: StuckThresholds::default(),
            timeouts: TimeoutSettings::default(),
            git: GitSettings::default(),
        }
    }
}

impl AgentSettings {
    pub fn validate(&self) -> Result<()> {
        let it = &self.iterations;
        if it.min == 0 || it.min > it.max {
            return Err(anyhow!("iterations: need 1 <= min <= max"));
        }
        if it.default < it.min || it.default > it.max {
            return Err(anyhow!("iterations.default must lie within [min, max]"));
        }
        if self.stuck.default == 0 || self.stuck.per_kind.values().any(|t| *t == 0) {
            return Err(anyhow!("stuck thresholds must be > 0"));
        }
        let t = &self.timeouts;
        if t.completion_secs == 0 || t.test_secs == 0 || t.bootstrap_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 || self.prompt_budget_bytes == 0 {
            return Err(anyhow!("output_limit_bytes and prompt_budget_bytes must be > 0"));
        }
        if self.git.base_branch.trim().is_empty() {
            return Err(anyhow!("git.base_branch must not be empty"));
        }
        if self.test_runners.iter().all(|r| r.trim().is_empty()) {
            return Err(anyhow!("test_runners must name at least one executable"));
        }
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.completion_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.test_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.bootstrap_secs)
    }
}

/// Load settings from a TOML file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<AgentSettings> {
    if !path.exists() {
        let settings = AgentSettings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: AgentSettings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings {}", path.display()))?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &AgentSettings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(settings, AgentSettings::default());
        assert_eq!(settings.stuck, StuckThresholds::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/settings.toml");
        let mut settings = AgentSettings::default();
        settings.contract_mode = ContractMode::Revert;
        settings.stuck.per_kind.insert("build_failure".to_string(), 4);
        write_settings(&path, &settings).expect("write");
        assert_eq!(load_settings(&path).expect("load"), settings);
    }

    #[test]
    fn partial_file_keeps_defaults_and_is_validated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        fs::write(&path, "contract_mode = \"revert\"\n[iterations]\nmax = 3\n").expect("write");
        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.contract_mode, ContractMode::Revert);
        assert_eq!(settings.iterations.max, 3);
        assert_eq!(settings.iterations.min, 1);

        fs::write(&path, "[iterations]\nmin = 4\nmax = 3\n").expect("write");
        assert!(load_settings(&path).is_err());
    }
}
