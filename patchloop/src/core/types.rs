//! Shared deterministic types for the iteration engine.
//!
//! These types define stable contracts between components and the JSON the
//! completion service must produce. They do not depend on I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Planning output: what to change and how to verify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub files_to_touch: Vec<String>,
    pub test_strategy: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Free text folded from fields the contract does not know about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// File operation in full-content mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub operation: FileOperation,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPatch {
    #[serde(default)]
    pub path: String,
    pub diff: String,
}

/// A proposed change set, either full file contents or unified diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchObject {
    #[serde(default)]
    pub files: BTreeMap<String, FileChange>,
    #[serde(default)]
    pub patches: Vec<DiffPatch>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl PatchObject {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.patches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionStatus {
    pub criterion: String,
    pub met: bool,
    #[serde(default)]
    pub evidence: String,
}

/// Structured verdict on one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub failure_hints: Vec<String>,
    pub acceptance_criteria_status: Vec<CriterionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_patch: Option<PatchObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl TestReport {
    pub fn all_criteria_met(&self) -> bool {
        self.acceptance_criteria_status.iter().all(|c| c.met)
    }
}

/// Classified failure kind. Serialized as its snake_case tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    FloatPrecisionMismatch,
    MissingDependency,
    BuildFailure,
    RunnerMissing,
    PatchRejected,
    PolicyViolation,
    Unknown,
    /// Tag supplied by an external rule that has no built-in meaning.
    Custom(String),
}

impl FailureKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "float_precision_mismatch" => FailureKind::FloatPrecisionMismatch,
            "missing_dependency" | "missing_module" => FailureKind::MissingDependency,
            "build_failure" => FailureKind::BuildFailure,
            "runner_missing" => FailureKind::RunnerMissing,
            "patch_rejected" => FailureKind::PatchRejected,
            "policy_violation" => FailureKind::PolicyViolation,
            "" | "unknown" => FailureKind::Unknown,
            other => FailureKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FailureKind::FloatPrecisionMismatch => "float_precision_mismatch",
            FailureKind::MissingDependency => "missing_dependency",
            FailureKind::BuildFailure => "build_failure",
            FailureKind::RunnerMissing => "runner_missing",
            FailureKind::PatchRejected => "patch_rejected",
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::Unknown => "unknown",
            FailureKind::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailureKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FailureKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(FailureKind::from_tag(&tag))
    }
}

/// Classifier output for one failed test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMeta {
    pub kind: FailureKind,
    pub hints: Vec<String>,
    /// Noise-normalized fingerprint used for stuck detection.
    pub signature: String,
    pub matched_rule_id: Option<String>,
}

/// Result of one loop pass, dispatched by the Decide stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Tests ran and the loop should keep going.
    Continue,
    /// The patch produced no file deltas; tests were skipped.
    NoChange,
    /// A policy check rejected the changes and they were reverted.
    PolicyReverted,
    /// Tests pass and every acceptance criterion is met.
    EarlyStop,
    /// The same failure repeated with the same changes too many times.
    Stuck,
}

impl IterationOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, IterationOutcome::EarlyStop | IterationOutcome::Stuck)
    }
}

/// Per-iteration bookkeeping kept for the life of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub changed_files: Vec<String>,
    pub test_exit_code: Option<i32>,
    /// Tail of the test output, capped.
    pub test_output: String,
    pub failure: Option<FailureMeta>,
    pub outcome: IterationOutcome,
    pub note: String,
    pub stuck_count: u32,
    pub started_at: String,
    pub duration_ms: u64,
}
