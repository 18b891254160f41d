//! Side-effecting collaborators: filesystem, git, processes and services.

pub mod artifacts;
pub mod completion;
pub mod config;
pub mod git;
pub mod github;
pub mod patch_apply;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod test_runner;
