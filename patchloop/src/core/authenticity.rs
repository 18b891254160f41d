//! Test-authenticity policies.
//!
//! A policy inspects test files the iteration added and reports violations.
//! The built-in policy catches expected values that were computed by hand and
//! pasted into the test instead of being derived in code.

use std::sync::LazyLock;

use regex::Regex;

/// A test file added by the current iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedTestFile {
    pub path: String,
    pub content: String,
}

pub trait AuthenticityPolicy {
    fn name(&self) -> &str;

    /// Violations found in the added test files; empty means accepted.
    fn check(&self, files: &[AddedTestFile]) -> Vec<String>;

    /// Hint fed to the next implementation prompt after a violation.
    fn remediation(&self) -> &str;
}

static MANUAL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(#|//|/\*|\*|--).*\b(manual(ly)?|by hand|hand[- ]?(computed|calculated)|a mano|derived|derivad[oa]|calculated offline)\b",
    )
    .expect("manual marker regex should compile")
});

static HARDCODED_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(=|==|\(|,)\s*-?\d+\.\d+\b").expect("hardcoded number regex should compile")
});

/// Flags a hardcoded decimal literal on the same line as, or the line right
/// after, a comment saying it was worked out manually.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualExpectedValuePolicy;

impl AuthenticityPolicy for ManualExpectedValuePolicy {
    fn name(&self) -> &str {
        "manual_expected_value"
    }

    fn check(&self, files: &[AddedTestFile]) -> Vec<String> {
        let mut violations = Vec::new();
        for file in files {
            let lines: Vec<&str> = file.content.lines().collect();
            for (i, line) in lines.iter().enumerate() {
                if !MANUAL_MARKER.is_match(line) {
                    continue;
                }
                let same_line = HARDCODED_NUMBER.is_match(line);
                let next_line = lines
                    .get(i + 1)
                    .is_some_and(|next| HARDCODED_NUMBER.is_match(next));
                if same_line || next_line {
                    violations.push(format!(
                        "{}:{}: expected value is hardcoded and marked as manually derived",
                        file.path,
                        i + 1
                    ));
                }
            }
        }
        violations
    }

    fn remediation(&self) -> &str {
        "Do not hardcode expected values computed by hand: derive them in the test from the documented formula."
    }
}

static TEST_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(^|/)(tests?|__tests__|spec)/|(^|/)test_[^/]+\.py$|_test\.(py|go)$|\.(test|spec)\.[jt]sx?$|Tests?\.(java|cs|kt)$",
    )
    .expect("test file regex should compile")
});

/// Whether a repository-relative path looks like a test file.
pub fn is_test_path(path: &str) -> bool {
    TEST_FILE.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> AddedTestFile {
        AddedTestFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn flags_manual_expected_values() {
        let policy = ManualExpectedValuePolicy;
        let added = file(
            "tests/test_calc.py",
            "def test_payment():\n    expected = 790.79  # manual calculation\n    assert pay() == expected\n",
        );
        let violations = policy.check(&[added]);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("tests/test_calc.py:2:"));

        let next_line = file(
            "tests/test_calc.py",
            "    # derivado a mano\n    cuota = 438.71\n",
        );
        assert_eq!(policy.check(&[next_line]).len(), 1);
    }

    #[test]
    fn accepts_formula_derived_values() {
        let policy = ManualExpectedValuePolicy;
        let added = file(
            "tests/test_calc.py",
            "# expected derived from the annuity formula in code\nexpected = principal * r / (1 - (1 + r) ** -n)\nassert got == pytest.approx(expected, abs=0.01)\n",
        );
        assert!(policy.check(&[added]).is_empty());
    }

    #[test]
    fn recognizes_test_paths() {
        for path in [
            "tests/test_api.py",
            "app/test_calc.py",
            "pkg/calc_test.go",
            "src/calc.test.ts",
            "src/test/java/CalcTest.java",
            "Calc.Tests/CalcTests.cs",
        ] {
            assert!(is_test_path(path), "{path}");
        }
        assert!(!is_test_path("app/calc.py"));
        assert!(!is_test_path("src/contest.js"));
    }
}
