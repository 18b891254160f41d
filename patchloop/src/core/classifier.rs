//! Failure classification for raw test output.
//!
//! Rules come from TOML (embedded defaults or a file named by
//! `FAILURE_HINTS_RULES_PATH`) and are evaluated in priority order before the
//! built-in heuristics. Classification itself is pure; the rule set is built
//! once and passed by reference.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::{FailureKind, FailureMeta};

pub const DEFAULT_RULES_TOML: &str = include_str!("../../defaults/failure_rules.toml");
pub const DEFAULT_HINT_LIMIT: usize = 8;
const DEFAULT_PRIORITY: i64 = 1000;
const SIGNATURE_TEXT_LIMIT: usize = 2500;
const SIGNATURE_HASH_HEX: usize = 16;

const GENERIC_FLOAT_HINT: &str =
    "Possible floating-point precision mismatch: avoid exact equality on floats.";
const GENERIC_TOLERANCE_HINT: &str =
    "Compare floats with a tolerance (delta/epsilon) or a 'close to' assertion.";
const FINANCE_HINT: &str = "Financial domain: prefer Decimal or integer cents to avoid float drift.";
const FINANCE_WORDS: &[&str] = &["credit", "cuota", "interest", "interés", "amort", "installment"];

#[derive(Debug, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    language_hints: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    stop_on_match: Option<bool>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    hints: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
}

/// One compiled classification rule.
#[derive(Debug, Clone)]
pub struct FailureRule {
    pub id: String,
    pub kind: FailureKind,
    pub priority: i64,
    pub stop_on_match: bool,
    patterns: Vec<Regex>,
    pub hints: Vec<String>,
    /// Languages the rule applies to; empty means all.
    pub languages: Vec<String>,
}

impl FailureRule {
    fn applies_to(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }

    fn matches(&self, output: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(output))
    }
}

/// Priority-sorted rules plus per-language float hints.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<FailureRule>,
    language_hints: BTreeMap<String, Vec<String>>,
}

impl RuleSet {
    /// Parse a rule file. Rules whose patterns all fail to compile are dropped.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(source).context("parse failure rules toml")?;
        let mut rules = Vec::new();
        for raw in file.rules {
            let mut patterns = Vec::new();
            for pattern in raw.patterns.iter().filter(|p| !p.trim().is_empty()) {
                match Regex::new(pattern) {
                    Ok(re) => patterns.push(re),
                    Err(err) => warn!(rule = %raw.id, pattern = %pattern, err = %err, "skipping invalid rule pattern"),
                }
            }
            if patterns.is_empty() {
                continue;
            }
            rules.push(FailureRule {
                kind: FailureKind::from_tag(&raw.kind),
                priority: raw.priority.unwrap_or(DEFAULT_PRIORITY),
                stop_on_match: raw.stop_on_match.unwrap_or(true),
                patterns,
                hints: clean_strings(raw.hints),
                languages: raw
                    .languages
                    .iter()
                    .map(|l| l.trim().to_ascii_lowercase())
                    .collect(),
                id: raw.id,
            });
        }
        // Stable sort keeps file order for equal priorities.
        rules.sort_by_key(|r| r.priority);

        let language_hints = file
            .language_hints
            .into_iter()
            .map(|(lang, hints)| (lang.trim().to_ascii_lowercase(), clean_strings(hints)))
            .collect();
        Ok(Self {
            rules,
            language_hints,
        })
    }

    /// The embedded default rule file.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(DEFAULT_RULES_TOML).context("embedded failure rules")
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify one test run's combined output.
    pub fn classify(&self, output: &str, language: &str) -> FailureMeta {
        let language = language.trim().to_ascii_lowercase();

        let mut rule_kind: Option<FailureKind> = None;
        let mut hints: Vec<String> = Vec::new();
        let mut matched_rule_id: Option<String> = None;
        for rule in self.rules.iter().filter(|r| r.applies_to(&language)) {
            if !rule.matches(output) {
                continue;
            }
            debug!(rule = %rule.id, kind = %rule.kind, "failure rule matched");
            rule_kind = Some(rule.kind.clone());
            hints.extend(rule.hints.iter().cloned());
            matched_rule_id = (!rule.id.is_empty()).then(|| rule.id.clone());
            if rule.stop_on_match {
                break;
            }
        }

        // A rule tagged `unknown` only contributes hints.
        let kind = rule_kind
            .filter(|k| *k != FailureKind::Unknown)
            .unwrap_or_else(|| builtin_kind(output));
        match kind {
            FailureKind::FloatPrecisionMismatch => {
                hints.push(GENERIC_FLOAT_HINT.to_string());
                match self.language_hints.get(&language).filter(|h| !h.is_empty()) {
                    Some(configured) => hints.extend(configured.iter().cloned()),
                    None => {
                        if let Some(hint) = builtin_language_float_hint(&language) {
                            hints.push(hint.to_string());
                        }
                        hints.push(GENERIC_TOLERANCE_HINT.to_string());
                    }
                }
                let lower = output.to_lowercase();
                if FINANCE_WORDS.iter().any(|w| lower.contains(w)) {
                    hints.push(FINANCE_HINT.to_string());
                }
            }
            FailureKind::MissingDependency if hints.is_empty() => hints.push(
                "A module or package is missing: add it to the dependency manifest or fix the import path."
                    .to_string(),
            ),
            FailureKind::BuildFailure if hints.is_empty() => hints.push(
                "The build failed before tests ran: fix compilation or dependency resolution first."
                    .to_string(),
            ),
            FailureKind::RunnerMissing if hints.is_empty() => hints.push(
                "The test runner is not installed: declare it as a dev dependency of the project."
                    .to_string(),
            ),
            _ => {}
        }

        FailureMeta {
            signature: failure_signature(&kind, output),
            kind,
            hints,
            matched_rule_id,
        }
    }
}

fn clean_strings(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

static FLOAT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d+\.\d+\s*!=\s*\d+\.\d+",
        r"expected.*\d+\.\d+.*but.*\d+\.\d+",
        r"Expected:.*\d+\.\d+.*Received:.*\d+\.\d+",
        r"E\s+assert\s+.*\d+\.\d+.*==\s+.*\d+\.\d+",
        r"AssertionError:.*\d+\.\d+.*\d+\.\d+",
    ]
    .iter()
    .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
    .collect()
});

static BUILD_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"error NU\d{4}|error TS\d{4}|\[build failed\]|(?m)^# \S+\n.*: undefined: ")
        .expect("build failure regex should compile")
});

const MISSING_MODULE_MARKERS: &[&str] = &[
    "ModuleNotFoundError",
    "No module named",
    "Cannot find module",
    "ERR_MODULE_NOT_FOUND",
    "no required module provides package",
    "cannot find package",
];
const BUILD_FAILURE_MARKERS: &[&str] = &[
    "BUILD FAILURE",
    "Could not resolve dependencies",
    "Could not find artifact",
    "COMPILATION ERROR",
    "Build FAILED",
];
const RUNNER_MISSING_MARKERS: &[&str] = &[
    "pytest: not found",
    "pytest: command not found",
    "jest: not found",
    "jest command not found",
    "dotnet: command not found",
    "mvn: command not found",
    "go: command not found",
    "npm: command not found",
];

/// Built-in heuristics applied when no configured rule matched.
pub fn builtin_kind(output: &str) -> FailureKind {
    if FLOAT_PATTERNS.iter().any(|re| re.is_match(output)) {
        return FailureKind::FloatPrecisionMismatch;
    }
    // "No module named pytest" is a missing runner, not a missing app dependency.
    if output.contains("No module named pytest") {
        return FailureKind::RunnerMissing;
    }
    if MISSING_MODULE_MARKERS.iter().any(|m| output.contains(m)) {
        return FailureKind::MissingDependency;
    }
    if BUILD_FAILURE_MARKERS.iter().any(|m| output.contains(m)) || BUILD_FAILURE_RE.is_match(output)
    {
        return FailureKind::BuildFailure;
    }
    if RUNNER_MISSING_MARKERS.iter().any(|m| output.contains(m)) {
        return FailureKind::RunnerMissing;
    }
    FailureKind::Unknown
}

fn builtin_language_float_hint(language: &str) -> Option<&'static str> {
    match language {
        "python" => Some("Python: use pytest.approx(expected) or math.isclose(a, b)."),
        "javascript" | "typescript" => Some("JS/TS: use expect(actual).toBeCloseTo(expected, digits)."),
        "java" => Some("Java: use assertEquals(expected, actual, delta) or BigDecimal."),
        "dotnet" | "csharp" => Some(".NET: use Assert.Equal(expected, actual, precision) or decimal."),
        "go" => Some("Go: compare math.Abs(got-want) < epsilon instead of =="),
        _ => None,
    }
}

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/[A-Za-z0-9_\-./]+)+").expect("path regex should compile"));
static WIN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z]:\\[A-Za-z0-9_\-\\.]+").expect("windows path regex should compile")
});
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?Z?")
        .expect("timestamp regex should compile")
});
static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex regex should compile"));
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(\.\d+)?\s*(ms|s|sec|secs|seconds)\b").expect("duration regex should compile")
});
static LINE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+").expect("line regex should compile"));
static LINE_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"line\s+\d+")
        .case_insensitive(true)
        .build()
        .expect("line word regex should compile")
});
static WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

/// Strip volatile substrings so repeated failures compare equal.
pub fn normalize_for_signature(text: &str) -> String {
    let t = TIMESTAMP_RE.replace_all(text, "<TS>");
    let t = PATH_RE.replace_all(&t, "<PATH>");
    let t = WIN_PATH_RE.replace_all(&t, "<PATH>");
    let t = HEX_ADDR_RE.replace_all(&t, "<ADDR>");
    let t = DURATION_RE.replace_all(&t, "<DUR>");
    let t = LINE_COL_RE.replace_all(&t, ":<N>");
    let t = LINE_WORD_RE.replace_all(&t, "line <N>");
    let t = WS_RE.replace_all(&t, " ");
    let t = t.trim();

    let count = t.chars().count();
    if count <= SIGNATURE_TEXT_LIMIT {
        return t.to_string();
    }
    t.chars().skip(count - SIGNATURE_TEXT_LIMIT).collect()
}

/// `kind:` followed by a short hash of the normalized output tail.
pub fn failure_signature(kind: &FailureKind, output: &str) -> String {
    let normalized = normalize_for_signature(output);
    let digest = Sha256::digest(normalized.as_bytes());
    let hex = hex::encode(digest);
    format!("{kind}:{}", &hex[..SIGNATURE_HASH_HEX])
}

/// Dedupe and cap hints to keep prompts tight.
pub fn summarize_hints(hints: &[String], limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for hint in hints {
        let hint = hint.trim();
        if hint.is_empty() || out.iter().any(|h| h == hint) {
            continue;
        }
        out.push(hint.to_string());
        if out.len() >= limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_mismatch_gets_tolerance_hint() {
        let rules = RuleSet::default();
        let meta = rules.classify("E       assert 0.1 != 0.10000000001", "python");
        assert_eq!(meta.kind, FailureKind::FloatPrecisionMismatch);
        assert!(meta.hints.iter().any(|h| h.contains("tolerance")));
        assert!(meta.hints.iter().any(|h| h.contains("pytest.approx")));
        assert!(meta.signature.starts_with("float_precision_mismatch:"));
    }

    #[test]
    fn finance_words_add_domain_hint() {
        let meta = RuleSet::default().classify(
            "AssertionError: monthly interest 10.5 vs 10.499999",
            "python",
        );
        assert!(meta.hints.iter().any(|h| h.contains("Decimal")));
    }

    #[test]
    fn builtin_fallbacks_cover_common_kinds() {
        assert_eq!(
            builtin_kind("ModuleNotFoundError: No module named 'fastapi'"),
            FailureKind::MissingDependency
        );
        assert_eq!(
            builtin_kind("/bin/sh: 1: pytest: not found"),
            FailureKind::RunnerMissing
        );
        assert_eq!(
            builtin_kind("/usr/bin/python: No module named pytest"),
            FailureKind::RunnerMissing
        );
        assert_eq!(
            builtin_kind("[ERROR] BUILD FAILURE"),
            FailureKind::BuildFailure
        );
        assert_eq!(
            builtin_kind("src/app.ts(3,1): error TS2304: Cannot find name 'x'."),
            FailureKind::BuildFailure
        );
        assert_eq!(builtin_kind("1 failed, 2 passed"), FailureKind::Unknown);
    }

    #[test]
    fn configured_rules_run_in_priority_order() {
        let rules = RuleSet::from_toml_str(
            r#"
            [[rules]]
            id = "late"
            kind = "build_failure"
            priority = 50
            patterns = ["boom"]

            [[rules]]
            id = "early"
            kind = "flaky_network"
            priority = 10
            stop_on_match = false
            patterns = ["boom", "(unclosed"]
            hints = ["retry the network call"]

            [[rules]]
            id = "broken"
            kind = "unknown"
            patterns = ["(unclosed"]
            "#,
        )
        .expect("parse");
        // The rule with only an invalid pattern is dropped.
        assert_eq!(rules.len(), 2);

        let meta = rules.classify("boom happened", "go");
        assert_eq!(meta.kind, FailureKind::BuildFailure);
        assert_eq!(meta.matched_rule_id.as_deref(), Some("late"));
        assert!(meta.hints.contains(&"retry the network call".to_string()));
    }

    #[test]
    fn language_scoped_rules_only_apply_to_their_language() {
        let rules = RuleSet::from_toml_str(
            r#"
            [[rules]]
            id = "py-only"
            kind = "missing_module"
            languages = ["python"]
            patterns = ["boom"]
            "#,
        )
        .expect("parse");
        assert_eq!(
            rules.classify("boom", "python").kind,
            FailureKind::MissingDependency
        );
        assert_eq!(rules.classify("boom", "java").kind, FailureKind::Unknown);
    }

    #[test]
    fn signature_ignores_paths_lines_and_durations() {
        let a = "FAILED /tmp/run-1/tests/test_a.py:12 - assert 1 == 2\n1 failed in 0.31s";
        let b = "FAILED /tmp/run-2/tests/test_a.py:40 - assert 1 == 2\n1 failed in 1.02s";
        assert_eq!(
            failure_signature(&FailureKind::Unknown, a),
            failure_signature(&FailureKind::Unknown, b)
        );
        assert_ne!(
            failure_signature(&FailureKind::Unknown, a),
            failure_signature(&FailureKind::Unknown, "assert 3 == 4")
        );
    }

    #[test]
    fn summarize_hints_dedupes_and_caps() {
        let hints: Vec<String> = ["a", "b", "a", " ", "c", "d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(summarize_hints(&hints, 3), vec!["a", "b", "c"]);
    }

    #[test]
    fn embedded_rules_parse() {
        let rules = RuleSet::builtin().expect("builtin rules");
        assert!(!rules.is_empty());
    }
}
