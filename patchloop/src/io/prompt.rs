//! Prompt builder for the structured-output contracts.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections go
//! first (in `DROP_ORDER`), then the last remaining section is truncated.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::request::RunRequest;
use crate::core::schema::Contract;
use crate::core::types::{PatchObject, Plan};
use crate::io::github::Issue;
use crate::stack::spec::StackSpec;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const TEST_REPORT_TEMPLATE: &str = include_str!("prompts/test_report.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

const DROP_ORDER: &[&str] = &[
    "tree",
    "snapshot",
    "issue",
    "recommended",
    "previous",
    "hints",
];
const TRUNCATION_MARKER: &str = "\n[truncated]";
const SECTION_SEPARATOR: &str = "\n\n";
const TREE_LIMIT: usize = 200;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// A repository file quoted into a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFile {
    pub path: String,
    pub content: String,
}

/// Read the given repository files for quoting, skipping missing ones and
/// capping each at `per_file_limit` bytes.
pub fn read_snapshot(root: &Path, paths: &[String], per_file_limit: usize) -> Result<Vec<SnapshotFile>> {
    let mut files = Vec::new();
    for rel in paths {
        let path = root.join(rel);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let mut content = String::from_utf8_lossy(&bytes).into_owned();
        if content.len() > per_file_limit {
            truncate_at_boundary(&mut content, per_file_limit);
            content.push_str(TRUNCATION_MARKER);
        }
        files.push(SnapshotFile {
            path: rel.clone(),
            content,
        });
    }
    Ok(files)
}

#[derive(Debug, Clone, Serialize)]
struct StackContext {
    stack_id: String,
    language: String,
    toolchain: String,
    test_command: String,
}

impl StackContext {
    fn from_spec(spec: &StackSpec) -> Self {
        let toolchain = format!("{} {}", spec.toolchain.kind, spec.toolchain.version);
        Self {
            stack_id: spec.stack_id.clone(),
            language: spec.language.clone(),
            toolchain: toolchain.trim().to_string(),
            test_command: spec.test_command().to_string(),
        }
    }
}

/// Inputs for the planning prompt.
#[derive(Debug, Clone, Copy)]
pub struct PlanPromptInputs<'a> {
    pub request: &'a RunRequest,
    pub stack: &'a StackSpec,
    pub issue: Option<&'a Issue>,
    pub tree: &'a [String],
    pub snapshot: &'a [SnapshotFile],
}

/// Inputs for one implementation prompt.
#[derive(Debug, Clone, Copy)]
pub struct ImplementPromptInputs<'a> {
    pub iteration: u32,
    pub max_iterations: u32,
    pub request: &'a RunRequest,
    pub stack: &'a StackSpec,
    pub plan: &'a Plan,
    /// Hints from the classifier and the last test report.
    pub hints: &'a [String],
    pub recommended_patch: Option<&'a PatchObject>,
    pub snapshot: &'a [SnapshotFile],
    pub previous_output: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct TestReportPromptInputs<'a> {
    pub request: &'a RunRequest,
    pub test_command: &'a str,
    pub exit_code: i32,
    pub test_output: &'a str,
    pub hints: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct RepairPromptInputs<'a> {
    /// The contract the invalid object was meant to satisfy.
    pub contract: Contract,
    pub error: &'a str,
    pub invalid: &'a Value,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .context("load implement template")?;
        env.add_template("test_report", TEST_REPORT_TEMPLATE)
            .context("load test_report template")?;
        env.add_template("repair", REPAIR_TEMPLATE)
            .context("load repair template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in matches.iter().enumerate() {
        let required = &caps[2] == "required";
        let start = caps.get_match().end();
        let end = matches
            .get(i + 1)
            .map(|next| next.get_match().start())
            .unwrap_or(rendered.len());
        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize {
        let separators = SECTION_SEPARATOR.len() * secs.len().saturating_sub(1);
        secs.iter().map(|s| s.content.len()).sum::<usize>() + separators
    };
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len = total_len(sections)
        - sections.last().map(|s| s.content.len()).unwrap_or_default();
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(other_len);
    if last.content.len() <= allowed {
        return;
    }
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_at_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_at_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

fn system_prompt(contract: Contract) -> String {
    format!(
        "You are an autonomous software engineer working inside a git repository. \
         Reply with exactly one JSON object that satisfies the `{}` contract and nothing else.\n{}",
        contract.name(),
        contract.requirements()
    )
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// Builds contract prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_plan(&self, input: &PlanPromptInputs<'_>) -> Result<PromptPack> {
        let tree: Vec<&String> = input.tree.iter().take(TREE_LIMIT).collect();
        let rendered = PromptEngine::new()?.render(
            "plan",
            context! {
                request => input.request,
                stack => StackContext::from_spec(input.stack),
                issue => input.issue,
                tree => tree,
                snapshot => input.snapshot,
            },
        )?;
        Ok(self.pack(Contract::Plan, &rendered))
    }

    pub fn build_implement(&self, input: &ImplementPromptInputs<'_>) -> Result<PromptPack> {
        let plan = serde_json::to_string_pretty(input.plan).context("serialize plan")?;
        let recommended_patch = input
            .recommended_patch
            .filter(|p| !p.is_empty())
            .map(serde_json::to_string_pretty)
            .transpose()
            .context("serialize recommended patch")?;
        let rendered = PromptEngine::new()?.render(
            "implement",
            context! {
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                request => input.request,
                stack => StackContext::from_spec(input.stack),
                plan => plan,
                hints => input.hints,
                recommended_patch => recommended_patch,
                snapshot => input.snapshot,
                previous_output => non_empty(input.previous_output),
            },
        )?;
        Ok(self.pack(Contract::Patch, &rendered))
    }

    pub fn build_test_report(&self, input: &TestReportPromptInputs<'_>) -> Result<PromptPack> {
        let rendered = PromptEngine::new()?.render(
            "test_report",
            context! {
                request => input.request,
                test_command => input.test_command,
                exit_code => input.exit_code,
                test_output => non_empty(Some(input.test_output)).unwrap_or("(no output)"),
                hints => input.hints,
            },
        )?;
        Ok(self.pack(Contract::TestReport, &rendered))
    }

    pub fn build_repair(&self, input: &RepairPromptInputs<'_>) -> Result<PromptPack> {
        let invalid = serde_json::to_string_pretty(input.invalid).context("serialize invalid object")?;
        let rendered = PromptEngine::new()?.render(
            "repair",
            context! {
                contract => input.contract.name(),
                requirements => input.contract.requirements(),
                error => input.error.trim(),
                invalid => invalid,
            },
        )?;
        let mut pack = self.pack(Contract::Repair, &rendered);
        pack.system = system_prompt(input.contract);
        Ok(pack)
    }

    fn pack(&self, contract: Contract, rendered: &str) -> PromptPack {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        PromptPack {
            contract,
            system: system_prompt(contract),
            user: render_sections(&sections),
        }
    }
}

/// A rendered prompt ready for the completion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub contract: Contract,
    pub system: String,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PlanTask;
    use serde_json::json;

    fn request() -> RunRequest {
        RunRequest {
            stack: "python-pytest".to_string(),
            language: "python".to_string(),
            user_story: "Add a loan amortization helper".to_string(),
            acceptance_criteria: vec![
                "monthly payment is computed".to_string(),
                "schedule sums to principal".to_string(),
            ],
            constraints: vec!["no new dependencies".to_string()],
            max_iterations: 2,
            test_command: String::new(),
        }
    }

    fn stack() -> StackSpec {
        let mut spec = StackSpec {
            stack_id: "python-pytest".to_string(),
            language: "python".to_string(),
            ..StackSpec::default()
        };
        spec.commands.test = "pytest -q".to_string();
        spec
    }

    fn plan() -> Plan {
        Plan {
            summary: "add helper".to_string(),
            tasks: vec![PlanTask {
                id: "T1".to_string(),
                title: "helper".to_string(),
                description: "write amortize()".to_string(),
            }],
            files_to_touch: vec!["loans.py".to_string()],
            test_strategy: "pytest".to_string(),
            risks: Vec::new(),
            assumptions: Vec::new(),
            extra: None,
        }
    }

    #[test]
    fn plan_prompt_orders_sections() {
        let req = request();
        let spec = stack();
        let issue = Issue {
            number: 7,
            title: "Loans".to_string(),
            body: "please".to_string(),
        };
        let tree = vec!["app.py".to_string()];
        let snapshot = vec![SnapshotFile {
            path: "requirements.txt".to_string(),
            content: "pytest".to_string(),
        }];
        let pack = PromptBuilder::new(20_000)
            .build_plan(&PlanPromptInputs {
                request: &req,
                stack: &spec,
                issue: Some(&issue),
                tree: &tree,
                snapshot: &snapshot,
            })
            .expect("render");

        let contract = pack.user.find("### Planning Contract").expect("contract");
        let request_pos = pack.user.find("### Change Request").expect("request");
        let stack_pos = pack.user.find("### Stack").expect("stack");
        let issue_pos = pack.user.find("### Issue").expect("issue");
        let snapshot_pos = pack.user.find("### Repository Snapshot").expect("snapshot");
        assert!(contract < request_pos && request_pos < stack_pos);
        assert!(stack_pos < issue_pos && issue_pos < snapshot_pos);
        assert!(pack.user.contains("- schedule sums to principal"));
        assert!(pack.user.contains("`pytest -q`"));
        assert!(pack.system.contains("`plan` contract"));
    }

    #[test]
    fn budget_drops_snapshot_before_hints_and_keeps_plan() {
        let req = request();
        let spec = stack();
        let plan = plan();
        let hints = vec!["compare floats with a tolerance".to_string()];
        let snapshot = vec![SnapshotFile {
            path: "big.py".to_string(),
            content: "x = 1\n".repeat(500),
        }];
        let pack = PromptBuilder::new(3_000)
            .build_implement(&ImplementPromptInputs {
                iteration: 1,
                max_iterations: 2,
                request: &req,
                stack: &spec,
                plan: &plan,
                hints: &hints,
                recommended_patch: None,
                snapshot: &snapshot,
                previous_output: None,
            })
            .expect("render");

        assert!(!pack.user.contains("### Current Files"));
        assert!(pack.user.contains("### Failure Hints"));
        assert!(pack.user.contains("write amortize()"));
        assert!(pack.user.len() <= 3_000);
    }

    #[test]
    fn long_test_output_is_truncated_not_dropped() {
        let req = request();
        let output = "é FAILED test_x\n".repeat(2_000);
        let pack = PromptBuilder::new(2_500)
            .build_test_report(&TestReportPromptInputs {
                request: &req,
                test_command: "pytest -q",
                exit_code: 1,
                test_output: &output,
                hints: &[],
            })
            .expect("render");
        assert!(pack.user.contains("### Test Output"));
        assert!(pack.user.ends_with("[truncated]"));
        assert!(pack.user.len() <= 2_500);
    }

    #[test]
    fn repair_prompt_carries_error_and_object() {
        let invalid = json!({"summary": "", "tasks": []});
        let pack = PromptBuilder::new(10_000)
            .build_repair(&RepairPromptInputs {
                contract: Contract::Plan,
                error: "tasks: [] has less than 1 item",
                invalid: &invalid,
            })
            .expect("render");
        assert_eq!(pack.contract, Contract::Repair);
        assert!(pack.user.contains("<error>"));
        assert!(pack.user.contains("less than 1 item"));
        assert!(pack.user.contains("\"tasks\": []"));
        assert!(pack.system.contains("`plan` contract"));
    }

    #[test]
    fn snapshot_skips_missing_and_caps_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "a".repeat(100)).expect("write");
        let files = read_snapshot(
            temp.path(),
            &["a.py".to_string(), "missing.py".to_string()],
            10,
        )
        .expect("snapshot");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, format!("{}{}", "a".repeat(10), TRUNCATION_MARKER));
    }
}
