//! Autonomous issue-to-pull-request agent.
//!
//! A run turns one `/agent run {...}` issue comment into a branch, a series of
//! model-written patches checked by the project's own tests, and a pull
//! request. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (request parsing, normalization,
//!   invariants, failure classification, stuck detection, contract locks).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes, the
//!   completion backend, the issue tracker). Isolated behind traits so tests
//!   can script them.
//! - **[`stack`]**: Stack resolution and preflight bootstrap.
//!
//! Orchestration modules ([`run`], [`start`], [`step`], [`looping`],
//! [`validate`], [`finalize`]) coordinate core logic with I/O.

pub mod core;
pub mod engine;
pub mod errors;
pub mod exit_codes;
pub mod finalize;
pub mod io;
pub mod logging;
pub mod looping;
pub mod run;
pub mod stack;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
