//! Test-command safety check shared by stack resolution and test execution.
//!
//! Commands are never handed to a shell; they are split on whitespace and
//! executed directly. The check still rejects anything that looks like shell
//! syntax so a command that is "safe" here is safe under any runner.

use crate::errors::UnsafeCommandError;

/// Characters that carry meaning to a POSIX shell.
pub const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '>', '<', '\n', '\r'];

/// Leading executables accepted by default.
pub const DEFAULT_TEST_RUNNERS: &[&str] = &[
    "pytest",
    "python",
    "python3",
    "npm",
    "pnpm",
    "yarn",
    "node",
    "mvn",
    "./mvnw",
    "gradle",
    "./gradlew",
    "dotnet",
    "go",
];

/// General-purpose interpreters that must invoke a recognized test module.
const INTERPRETERS: &[&str] = &["python", "python3", "node"];

/// Validate `command` and return its argv on success.
///
/// `runners` is the leading-executable allow-list. `allowed_prefixes` are the
/// stack's accepted command prefixes, matched token-wise; an empty list skips
/// the prefix rule.
pub fn check_test_command(
    command: &str,
    runners: &[String],
    allowed_prefixes: &[String],
) -> Result<Vec<String>, UnsafeCommandError> {
    let reject = |reason: String| UnsafeCommandError {
        command: command.to_string(),
        reason,
    };

    if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(reject(format!(
            "shell metacharacter '{}' is not allowed",
            c.escape_debug()
        )));
    }
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    let Some(program) = argv.first() else {
        return Err(reject("command is empty".to_string()));
    };
    if !runners.iter().any(|r| r == program) {
        return Err(reject(format!("'{program}' is not an allowed test runner")));
    }
    if INTERPRETERS.contains(&program.as_str()) && !invokes_test_module(&argv) {
        return Err(reject(format!(
            "'{program}' must invoke a test module (python -m pytest|unittest, node --test)"
        )));
    }
    if !allowed_prefixes.is_empty()
        && !allowed_prefixes
            .iter()
            .any(|prefix| starts_with_tokens(&argv, prefix))
    {
        return Err(reject(format!(
            "command does not start with any allowed prefix ({})",
            allowed_prefixes.join(", ")
        )));
    }
    Ok(argv)
}

/// Convenience wrapper over [`DEFAULT_TEST_RUNNERS`].
pub fn default_runners() -> Vec<String> {
    DEFAULT_TEST_RUNNERS.iter().map(|s| s.to_string()).collect()
}

fn invokes_test_module(argv: &[String]) -> bool {
    match argv[0].as_str() {
        "python" | "python3" => {
            argv.get(1).map(String::as_str) == Some("-m")
                && matches!(argv.get(2).map(String::as_str), Some("pytest" | "unittest"))
        }
        "node" => argv.iter().skip(1).any(|arg| arg == "--test"),
        _ => true,
    }
}

fn starts_with_tokens(argv: &[String], prefix: &str) -> bool {
    let prefix: Vec<&str> = prefix.split_whitespace().collect();
    !prefix.is_empty()
        && prefix.len() <= argv.len()
        && prefix.iter().zip(argv).all(|(p, a)| *p == a.as_str())
}
