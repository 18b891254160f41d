//! Change-request extraction from an issue comment.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::schema::ContractSchemas;
use crate::errors::InputError;

pub const DEFAULT_MAX_ITERATIONS: u32 = 2;

static AGENT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)/agent\s+run\s*(\{.*\})\s*$").expect("agent run regex should compile")
});
static FIRST_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(\{.*\})").expect("object regex should compile"));

/// Bounds applied to the requested iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationLimits {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

impl Default for IterationLimits {
    fn default() -> Self {
        Self {
            min: 1,
            max: 5,
            default: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl IterationLimits {
    pub fn clamp(&self, requested: Option<i64>) -> u32 {
        let value = requested.unwrap_or(i64::from(self.default));
        value.clamp(i64::from(self.min), i64::from(self.max)) as u32
    }
}

/// The resolved change request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Catalog stack id, or empty / `auto` for detection.
    pub stack: String,
    pub language: String,
    pub user_story: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub max_iterations: u32,
    /// Explicit test command; empty means "use the stack's".
    pub test_command: String,
}

impl RunRequest {
    pub fn is_auto_stack(&self) -> bool {
        self.stack.is_empty() || self.stack.eq_ignore_ascii_case("auto")
    }
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    language: Option<String>,
    user_story: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    max_iterations: Option<i64>,
    #[serde(default)]
    test_command: Option<String>,
}

/// Pull the JSON object out of a comment body and validate it.
///
/// Accepts `/agent run {...}` (object at the end of the body) and falls back
/// to the first `{...}` block anywhere in the text.
pub fn extract_run_request(
    body: &str,
    limits: &IterationLimits,
    schemas: &ContractSchemas,
) -> Result<RunRequest> {
    let body = body.trim();
    if body.is_empty() {
        return Err(InputError::new("comment body is empty").into());
    }
    let raw = AGENT_RUN_RE
        .captures(body)
        .or_else(|| FIRST_OBJECT_RE.captures(body))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| InputError::new("no JSON object found (use: /agent run { ... })"))?;

    let mut value: Value = serde_json::from_str(raw)
        .map_err(|err| InputError::new(format!("malformed JSON in comment: {err}")))?;
    coerce_numeric_string(&mut value, "max_iterations");

    let errors = schemas.run_request_errors(&value);
    if !errors.is_empty() {
        return Err(InputError::new(errors.join("; ")).into());
    }
    let raw: RawRequest = serde_json::from_value(value)
        .map_err(|err| InputError::new(format!("unexpected request shape: {err}")))?;

    let stack = raw.stack.unwrap_or_default().trim().to_string();
    let mut language = raw.language.unwrap_or_default().trim().to_ascii_lowercase();
    if language.is_empty() {
        language = language_from_stack_prefix(&stack).unwrap_or_default().to_string();
    }

    Ok(RunRequest {
        stack,
        language,
        user_story: raw.user_story.trim().to_string(),
        acceptance_criteria: raw
            .acceptance_criteria
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        constraints: raw.constraints,
        max_iterations: limits.clamp(raw.max_iterations),
        test_command: raw.test_command.unwrap_or_default().trim().to_string(),
    })
}

/// Infer a language from catalog-style stack ids (`python-fastapi`, `go-1.22`).
pub fn language_from_stack_prefix(stack: &str) -> Option<&'static str> {
    let prefix = stack.split('-').next()?;
    match prefix.to_ascii_lowercase().as_str() {
        "python" => Some("python"),
        "node" => Some("javascript"),
        "java" => Some("java"),
        "dotnet" => Some("dotnet"),
        "go" => Some("go"),
        _ => None,
    }
}

fn coerce_numeric_string(value: &mut Value, key: &str) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if let Some(Value::String(s)) = obj.get(key)
        && let Ok(n) = s.trim().parse::<i64>()
    {
        obj.insert(key.to_string(), Value::from(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;

    fn extract(body: &str) -> Result<RunRequest> {
        let schemas = ContractSchemas::compile().expect("schemas");
        extract_run_request(body, &IterationLimits::default(), &schemas)
    }

    #[test]
    fn parses_agent_run_payload_and_infers_language() {
        let body = r#"Please do this.
/agent run {"stack": "python-fastapi", "user_story": "Add /health", "acceptance_criteria": ["GET /health returns 200"]}"#;
        let req = extract(body).expect("extract");
        assert_eq!(req.stack, "python-fastapi");
        assert_eq!(req.language, "python");
        assert_eq!(req.acceptance_criteria, vec!["GET /health returns 200"]);
        assert_eq!(req.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(!req.is_auto_stack());
    }

    #[test]
    fn falls_back_to_first_object_and_clamps_iterations() {
        let body = "some text {\"user_story\": \"x\", \"max_iterations\": \"50\"} trailing";
        let req = extract(body).expect("extract");
        assert_eq!(req.max_iterations, IterationLimits::default().max);
        assert!(req.is_auto_stack());

        let req = extract("{\"user_story\": \"x\", \"max_iterations\": 0}").expect("extract");
        assert_eq!(req.max_iterations, 1);
    }

    #[test]
    fn missing_payload_is_input_error() {
        let err = extract("/agent run please").expect_err("no json");
        assert_eq!(ErrorClass::of(&err), ErrorClass::Input);

        let err = extract("/agent run {not json}").expect_err("bad json");
        assert!(err.to_string().contains("malformed JSON"));

        let err = extract("/agent run {\"stack\": \"auto\"}").expect_err("no story");
        assert_eq!(ErrorClass::of(&err), ErrorClass::Input);
    }

    #[test]
    fn explicit_language_wins_over_stack_prefix() {
        let req = extract(r#"{"stack": "node-express", "language": "TypeScript", "user_story": "x"}"#)
            .expect("extract");
        assert_eq!(req.language, "typescript");
    }
}
