//! Typed errors that callers branch on.
//!
//! Everything travels as `anyhow::Error`; the orchestrator recovers the
//! concrete type with `downcast_ref` to decide between "feed back into the next
//! iteration" and "end the run".

use std::fmt;

/// Coarse error taxonomy used for summaries and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or missing change request; nothing was mutated.
    Input,
    /// Model output failed its schema after the single repair attempt.
    Contract,
    /// Breaking-contract or test-authenticity violation.
    Policy,
    /// Test runner, VCS or patch application failure.
    Execution,
    /// Unsafe test command or unsafe file path.
    Security,
    /// Anything else (I/O, serialization, bugs).
    Internal,
}

impl ErrorClass {
    /// Classify an error by the first typed error found in its chain.
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.is::<UnsafePathError>() || cause.is::<UnsafeCommandError>() {
                return ErrorClass::Security;
            }
            if cause.is::<InputError>() || cause.is::<StackResolutionError>() {
                return ErrorClass::Input;
            }
            if cause.is::<SchemaRepairError>() {
                return ErrorClass::Contract;
            }
            if cause.is::<ContractViolationError>() {
                return ErrorClass::Policy;
            }
            if cause.is::<PatchApplyError>() {
                return ErrorClass::Execution;
            }
        }
        ErrorClass::Internal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Input => "input",
            ErrorClass::Contract => "contract",
            ErrorClass::Policy => "policy",
            ErrorClass::Execution => "execution",
            ErrorClass::Security => "security",
            ErrorClass::Internal => "internal",
        }
    }
}

/// The change request payload is missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    pub message: String,
}

impl InputError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid change request: {}", self.message)
    }
}

impl std::error::Error for InputError {}

/// The requested stack cannot be used for this repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackResolutionError {
    pub stack_id: String,
    pub message: String,
}

impl fmt::Display for StackResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stack_id.is_empty() {
            write!(f, "stack resolution failed: {}", self.message)
        } else {
            write!(
                f,
                "stack resolution failed for '{}': {}",
                self.stack_id, self.message
            )
        }
    }
}

impl std::error::Error for StackResolutionError {}

/// A candidate test command failed the command-safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeCommandError {
    pub command: String,
    pub reason: String,
}

impl fmt::Display for UnsafeCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsafe test command '{}': {}",
            self.command.escape_debug(),
            self.reason
        )
    }
}

impl std::error::Error for UnsafeCommandError {}

/// A patch targeted a path outside the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafePathError {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for UnsafePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsafe patch path '{}': {}", self.path, self.reason)
    }
}

impl std::error::Error for UnsafePathError {}

/// A patch could not be applied (diff rejected, no path, bad shape).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchApplyError {
    pub path: Option<String>,
    pub message: String,
}

impl fmt::Display for PatchApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "cannot apply patch for '{path}': {}", self.message),
            None => write!(f, "cannot apply patch: {}", self.message),
        }
    }
}

impl std::error::Error for PatchApplyError {}

/// Model output stayed invalid after the repair round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRepairError {
    pub contract: String,
    pub first_error: String,
    pub repair_error: String,
}

impl fmt::Display for SchemaRepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} output invalid after repair: {} (before repair: {})",
            self.contract, self.repair_error, self.first_error
        )
    }
}

impl std::error::Error for SchemaRepairError {}

/// The working tree removed or changed a locked public symbol or endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractViolationError {
    pub iteration: u32,
    pub violations: Vec<String>,
}

impl fmt::Display for ContractViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "breaking change rejected in iteration {}: {}",
            self.iteration,
            self.violations.join("; ")
        )
    }
}

impl std::error::Error for ContractViolationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn classifies_typed_errors_through_context() {
        let err = anyhow::Error::new(UnsafePathError {
            path: "../etc/passwd".to_string(),
            reason: "parent traversal".to_string(),
        })
        .context("apply patch");
        assert_eq!(ErrorClass::of(&err), ErrorClass::Security);

        let err: anyhow::Error = Err::<(), _>(InputError::new("no json"))
            .context("parse comment")
            .unwrap_err();
        assert_eq!(ErrorClass::of(&err), ErrorClass::Input);
    }

    #[test]
    fn untyped_errors_are_internal() {
        assert_eq!(ErrorClass::of(&anyhow!("boom")), ErrorClass::Internal);
    }
}
