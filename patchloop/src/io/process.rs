//! Shell-free child processes with a deadline and bounded output capture.
//!
//! Every external tool patchloop drives (git, gh, codex, test runners,
//! bootstrap commands) goes through [`run_command_with_timeout`].

use std::io::{Read, Write};
use std::process::{ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes drained but not kept once the limit was reached.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, `-1` when the child was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Stdout then stderr as lossy UTF-8, with a bracketed notice for every
    /// truncated stream and for a timeout. `label` names the tool in notices.
    pub fn combined_text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        push_notice(&mut text, label, "stdout", self.stdout_truncated);
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        push_notice(&mut text, label, "stderr", self.stderr_truncated);
        if self.timed_out {
            text.push_str(&format!("\n[{label} timed out]\n"));
        }
        text
    }
}

fn push_notice(text: &mut String, label: &str, stream: &str, dropped: usize) {
    if dropped > 0 {
        text.push_str(&format!("\n[{label} {stream} truncated {dropped} bytes]\n"));
    }
}

/// One captured stream: kept bytes plus the count of dropped ones.
type Captured = (Vec<u8>, usize);

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// Both pipes are drained on reader threads while the child runs, so a chatty
/// child cannot block on a full pipe. At most `output_limit_bytes` per stream
/// are kept; the rest is counted and discarded. A timed-out child is killed
/// and reported with `timed_out = true` rather than as an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
        anyhow::Error::new(e).context(format!("spawn {}", cmd.get_program().to_string_lossy()))
    })?;

    let stdout = spawn_reader::<ChildStdout>(child.stdout.take(), output_limit_bytes, "stdout")?;
    let stderr = spawn_reader::<ChildStderr>(child.stderr.take(), output_limit_bytes, "stderr")?;

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
        pipe.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let (stdout, stdout_truncated) = collect(stdout).context("join stdout")?;
    let (stderr, stderr_truncated) = collect(stderr).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    limit: usize,
    name: &str,
) -> Result<JoinHandle<Result<Captured>>> {
    let pipe = pipe.ok_or_else(|| anyhow!("{name} was not piped"))?;
    Ok(thread::spawn(move || drain(pipe, limit)))
}

fn collect(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Read `reader` to EOF, keeping the first `limit` bytes.
fn drain<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let keep = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_and_truncates_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdef'; printf 'err' >&2; exit 3"]);
        let out = run_command_with_timeout(cmd, None, Duration::from_secs(10), 4).expect("run");
        assert_eq!(out.exit_code(), 3);
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 2);
        let text = out.combined_text("test");
        assert!(text.starts_with("abcd"));
        assert!(text.contains("[test stdout truncated 2 bytes]"));
        assert!(text.contains("err"));
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(Command::new("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.exit_code(), 0);
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let out =
            run_command_with_timeout(cmd, None, Duration::from_millis(200), 1024).expect("run");
        assert!(out.timed_out);
        assert!(out.combined_text("test").contains("[test timed out]"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("patchloop-no-such-program"),
            None,
            Duration::from_secs(1),
            16,
        )
        .expect_err("spawn fails");
        assert!(format!("{err:#}").contains("patchloop-no-such-program"));
    }
}
