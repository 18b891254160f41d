//! Test runner adapter. Commands run without a shell.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::command_safety::check_test_command;
use crate::io::process::run_command_with_timeout;

/// Exit code reported when the runner executable could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    pub command: String,
    pub runners: Vec<String>,
    pub allowed_prefixes: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRun {
    pub exit_code: i32,
    /// Stdout then stderr, with truncation and timeout notices.
    pub output: String,
    pub timed_out: bool,
}

impl TestRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

pub trait TestRunner {
    /// Run the suite. Unsafe commands are an `Err`; a failing or missing
    /// runner is an `Ok` with a nonzero exit code.
    fn run(&self, request: &TestRequest) -> Result<TestRun>;
}

pub struct CommandTestRunner;

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(command = %request.command, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        let argv = check_test_command(
            &request.command,
            &request.runners,
            &request.allowed_prefixes,
        )?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&request.workdir);

        info!("running tests");
        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "test runner failed to start");
                return Ok(TestRun {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    output: format!("{}: command not found ({err:#})", argv[0]),
                    timed_out: false,
                });
            }
        };
        let run = TestRun {
            exit_code: output.exit_code(),
            output: output.combined_text("tests"),
            timed_out: output.timed_out,
        };
        if run.timed_out {
            warn!("test command timed out");
        }
        info!(exit_code = run.exit_code, "tests finished");
        Ok(run)
    }
}
