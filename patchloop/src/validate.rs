//! Turn raw model output into a typed contract value.
//!
//! Every answer goes through the same pipeline: normalize, JSON Schema,
//! typed deserialization, semantic invariants. The first failure buys exactly
//! one repair round trip; a second failure is terminal and leaves the invalid
//! object, the error and the repair answer next to the other artifacts.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::invariants;
use crate::core::normalize::{NormalizeContext, normalize};
use crate::core::schema::{Contract, ContractSchemas};
use crate::core::types::{PatchObject, Plan, TestReport};
use crate::errors::SchemaRepairError;
use crate::io::completion::{CompletionRequest, CompletionService};
use crate::io::prompt::{PromptBuilder, RepairPromptInputs};

/// Where and how to validate one answer.
#[derive(Clone, Copy)]
pub struct Validation<'a> {
    pub schemas: &'a ContractSchemas,
    pub completion: &'a dyn CompletionService,
    pub prompts: &'a PromptBuilder,
    pub acceptance_criteria: &'a [String],
    /// Directory that receives the failure artifacts.
    pub artifacts_dir: &'a Path,
}

/// A value that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub value: T,
    /// The normalized JSON that was accepted.
    pub json: Value,
    pub repaired: bool,
}

pub fn validate_plan(v: &Validation<'_>, raw: Value) -> Result<Validated<Plan>> {
    validate_with_repair(v, Contract::Plan, raw, |plan: &Plan| invariants::validate_plan(plan))
}

pub fn validate_patch(v: &Validation<'_>, raw: Value) -> Result<Validated<PatchObject>> {
    validate_with_repair(v, Contract::Patch, raw, |patch: &PatchObject| {
        invariants::validate_patch(patch)
    })
}

pub fn validate_report(v: &Validation<'_>, raw: Value) -> Result<Validated<TestReport>> {
    let criteria = v.acceptance_criteria;
    validate_with_repair(v, Contract::TestReport, raw, |report: &TestReport| {
        invariants::validate_report(report, criteria)
    })
}

#[instrument(skip_all, fields(contract = %contract))]
fn validate_with_repair<T, F>(
    v: &Validation<'_>,
    contract: Contract,
    raw: Value,
    invariants: F,
) -> Result<Validated<T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Vec<String>,
{
    let ctx = NormalizeContext {
        acceptance_criteria: v.acceptance_criteria,
    };
    let normalized = normalize(raw, contract, &ctx);
    let first_error = match check(v.schemas, contract, &normalized, &invariants) {
        Ok(value) => {
            return Ok(Validated {
                value,
                json: normalized,
                repaired: false,
            });
        }
        Err(error) => error,
    };
    warn!(error = %first_error, "answer invalid, requesting repair");

    let pack = v.prompts.build_repair(&RepairPromptInputs {
        contract,
        error: &first_error,
        invalid: &normalized,
    })?;
    let request = CompletionRequest {
        contract: Contract::Repair,
        system: pack.system,
        user: pack.user,
        schema: contract.schema_source().map(str::to_string),
    };
    let repaired = match v.completion.complete(&request) {
        Ok(answer) => answer,
        Err(err) => {
            let repair_error = format!("repair request failed: {err:#}");
            return Err(terminal(v, contract, &normalized, &first_error, repair_error, None));
        }
    };

    let repaired = normalize(repaired, contract, &ctx);
    match check(v.schemas, contract, &repaired, &invariants) {
        Ok(value) => {
            info!("answer repaired");
            Ok(Validated {
                value,
                json: repaired,
                repaired: true,
            })
        }
        Err(repair_error) => Err(terminal(
            v,
            contract,
            &normalized,
            &first_error,
            repair_error,
            Some(&repaired),
        )),
    }
}

/// Schema, then shape, then invariants. The error lists every violation found
/// at the first failing layer.
fn check<T, F>(schemas: &ContractSchemas, contract: Contract, value: &Value, invariants: &F) -> Result<T, String>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Vec<String>,
{
    let errors = schemas.errors(contract, value);
    if !errors.is_empty() {
        return Err(format!("schema violations:\n- {}", errors.join("\n- ")));
    }
    let typed: T = serde_json::from_value(value.clone())
        .map_err(|err| format!("unexpected {} shape: {err}", contract.name()))?;
    let errors = invariants(&typed);
    if !errors.is_empty() {
        return Err(format!("invariant violations:\n- {}", errors.join("\n- ")));
    }
    Ok(typed)
}

fn terminal(
    v: &Validation<'_>,
    contract: Contract,
    invalid: &Value,
    first_error: &str,
    repair_error: String,
    repair: Option<&Value>,
) -> anyhow::Error {
    let name = contract.name();
    let error_text = format!("{first_error}\n\nafter repair:\n{repair_error}\n");
    let persisted = persist(v.artifacts_dir, &format!("{name}.invalid.json"), invalid)
        .and_then(|()| {
            std::fs::write(v.artifacts_dir.join(format!("{name}.validation_error.txt")), &error_text)
                .with_context(|| format!("write {name}.validation_error.txt"))
        })
        .and_then(|()| match repair {
            Some(repair) => persist(v.artifacts_dir, &format!("{name}.repair.json"), repair),
            None => Ok(()),
        });
    if let Err(err) = persisted {
        warn!(err = %format!("{err:#}"), "could not persist validation failure");
    }
    SchemaRepairError {
        contract: name.to_string(),
        first_error: first_error.to_string(),
        repair_error,
    }
    .into()
}

fn persist<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).with_context(|| format!("serialize {name}"))?;
    buf.push('\n');
    std::fs::write(dir.join(name), buf).with_context(|| format!("write {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCompletion;
    use serde_json::json;

    fn valid_plan() -> Value {
        json!({
            "summary": "Add an amortize helper",
            "tasks": [
                {"id": "task-amortize", "title": "Add amortize", "description": "Write the function"}
            ],
            "files_to_touch": ["src/loan.py"],
            "test_strategy": "pytest",
            "risks": [],
            "assumptions": []
        })
    }

    struct Fixture {
        schemas: ContractSchemas,
        prompts: PromptBuilder,
        completion: ScriptedCompletion,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                schemas: ContractSchemas::compile().expect("schemas"),
                prompts: PromptBuilder::new(20_000),
                completion: ScriptedCompletion::new(),
                dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        fn validation(&self) -> Validation<'_> {
            Validation {
                schemas: &self.schemas,
                completion: &self.completion,
                prompts: &self.prompts,
                acceptance_criteria: &[],
                artifacts_dir: self.dir.path(),
            }
        }
    }

    #[test]
    fn valid_plan_needs_no_repair() {
        let fx = Fixture::new();
        let validated = validate_plan(&fx.validation(), valid_plan()).expect("valid");
        assert!(!validated.repaired);
        assert_eq!(validated.value.tasks[0].id, "task-amortize");
        assert!(fx.completion.calls().is_empty());
    }

    #[test]
    fn invalid_plan_is_repaired_once() {
        let fx = Fixture::new();
        fx.completion.push(Contract::Repair, valid_plan());

        let validated = validate_plan(&fx.validation(), json!({"tasks": "nope"})).expect("repaired");
        assert!(validated.repaired);
        assert_eq!(fx.completion.calls(), vec![Contract::Repair]);

        let request = &fx.completion.requests()[0];
        assert!(request.user.contains("### Validation Error"));
        assert!(request.schema.is_some());
    }

    #[test]
    fn second_failure_is_terminal_and_persisted() {
        let fx = Fixture::new();
        fx.completion.push(Contract::Repair, json!({"tasks": 42}));

        let err = validate_plan(&fx.validation(), json!({"tasks": "nope"})).expect_err("terminal");
        let repair = err.downcast_ref::<SchemaRepairError>().expect("typed error");
        assert_eq!(repair.contract, "plan");
        assert_eq!(fx.completion.calls().len(), 1);

        for name in ["plan.invalid.json", "plan.validation_error.txt", "plan.repair.json"] {
            assert!(fx.dir.path().join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn failed_repair_request_is_terminal() {
        let fx = Fixture::new();
        let err = validate_patch(&fx.validation(), json!({})).expect_err("terminal");
        assert!(err.downcast_ref::<SchemaRepairError>().is_some());
        assert!(fx.dir.path().join("patch.invalid.json").exists());
        assert!(!fx.dir.path().join("patch.repair.json").exists());
    }
}
