//! Structured-output contracts and their compiled JSON Schemas.

use std::fmt;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;

const RUN_REQUEST_SCHEMA: &str = include_str!("../../schemas/run_request.schema.json");
const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
const PATCH_SCHEMA: &str = include_str!("../../schemas/patch.schema.json");
const TEST_REPORT_SCHEMA: &str = include_str!("../../schemas/test_report.schema.json");

/// Structured-output contract names understood by the completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contract {
    Plan,
    Patch,
    TestReport,
    /// Generic repair variant: output must satisfy the schema it is sent with.
    Repair,
}

impl Contract {
    pub fn name(self) -> &'static str {
        match self {
            Contract::Plan => "plan",
            Contract::Patch => "patch",
            Contract::TestReport => "test_report",
            Contract::Repair => "repair",
        }
    }

    /// Raw JSON Schema source. `Repair` has none of its own.
    pub fn schema_source(self) -> Option<&'static str> {
        match self {
            Contract::Plan => Some(PLAN_SCHEMA),
            Contract::Patch => Some(PATCH_SCHEMA),
            Contract::TestReport => Some(TEST_REPORT_SCHEMA),
            Contract::Repair => None,
        }
    }

    /// Human-readable requirements sent along with repair requests.
    pub fn requirements(self) -> &'static str {
        match self {
            Contract::Plan => {
                "Plan: object with non-empty `summary`, non-empty `test_strategy`, and `tasks` \
                 (at least one) where every task has unique `id` (>= 2 chars), non-empty `title` \
                 and `description`. Optional string arrays: `files_to_touch`, `risks`, \
                 `assumptions`. No other fields."
            }
            Contract::Patch => {
                "Patch: object with either a non-empty `files` map of relative path -> \
                 {operation: add|modify|delete, content: full file text} or a non-empty \
                 `patches` list of {path, diff} unified diffs, plus optional `notes` (strings). \
                 Paths must be relative and must not contain `..`."
            }
            Contract::TestReport => {
                "TestReport: object with boolean `passed`, string `summary`, string array \
                 `failure_hints`, and `acceptance_criteria_status` listing every acceptance \
                 criterion as {criterion, met: boolean, evidence}. Optional \
                 `recommended_patch` follows the Patch contract."
            }
            Contract::Repair => "Return the corrected object only.",
        }
    }

    /// Single-key envelopes models tend to wrap their answer in.
    pub fn envelope_keys(self) -> &'static [&'static str] {
        match self {
            Contract::Plan => &["plan"],
            Contract::Patch => &["patch", "patch_object"],
            Contract::TestReport => &["test_report", "report"],
            Contract::Repair => &[],
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compiled validators, built once per process.
pub struct ContractSchemas {
    run_request: Validator,
    plan: Validator,
    patch: Validator,
    test_report: Validator,
}

impl fmt::Debug for ContractSchemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractSchemas").finish_non_exhaustive()
    }
}

impl ContractSchemas {
    pub fn compile() -> Result<Self> {
        Ok(Self {
            run_request: compile(RUN_REQUEST_SCHEMA).context("compile run_request schema")?,
            plan: compile(PLAN_SCHEMA).context("compile plan schema")?,
            patch: compile(PATCH_SCHEMA).context("compile patch schema")?,
            test_report: compile(TEST_REPORT_SCHEMA).context("compile test_report schema")?,
        })
    }

    /// Schema violations for `instance`, one message per error (empty when valid).
    pub fn errors(&self, contract: Contract, instance: &Value) -> Vec<String> {
        let validator = match contract {
            Contract::Plan => &self.plan,
            Contract::Patch => &self.patch,
            Contract::TestReport => &self.test_report,
            Contract::Repair => return Vec::new(),
        };
        collect_errors(validator, instance)
    }

    pub fn run_request_errors(&self, instance: &Value) -> Vec<String> {
        collect_errors(&self.run_request, instance)
    }
}

fn compile(source: &str) -> Result<Validator> {
    let schema: Value = serde_json::from_str(source).context("parse schema json")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow::anyhow!("invalid schema: {err}"))
}

fn collect_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|err| {
            let path = err.instance_path().to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("{path}: {err}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_patch_fails_schema() {
        let schemas = ContractSchemas::compile().expect("compile");
        let errors = schemas.errors(Contract::Patch, &json!({"files": {}, "patches": []}));
        assert!(!errors.is_empty());
    }

    #[test]
    fn minimal_plan_passes_schema() {
        let schemas = ContractSchemas::compile().expect("compile");
        let plan = json!({
            "summary": "add endpoint",
            "tasks": [{"id": "T1", "title": "route", "description": "add the route"}],
            "test_strategy": "pytest"
        });
        assert!(schemas.errors(Contract::Plan, &plan).is_empty());
    }

    #[test]
    fn plan_with_unknown_field_fails_schema() {
        let schemas = ContractSchemas::compile().expect("compile");
        let plan = json!({
            "summary": "s",
            "tasks": [{"id": "T1", "title": "t", "description": "d"}],
            "test_strategy": "pytest",
            "patches": []
        });
        assert!(!schemas.errors(Contract::Plan, &plan).is_empty());
    }
}
