//! Stable exit codes for patchloop CLI commands.

/// Run verified (tests pass, every criterion met) or a helper command succeeded.
pub const OK: i32 = 0;
/// The run ended on an execution, contract, policy or internal error.
pub const FAILED: i32 = 1;
/// Invalid input: malformed request, unknown stack, unsafe command or config.
pub const INVALID: i32 = 2;
/// The same failure repeated with the same changes.
pub const STUCK: i32 = 3;
/// The iteration ceiling was reached without verification.
pub const EXHAUSTED: i32 = 4;
