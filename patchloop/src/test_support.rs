//! Test-only helpers: throwaway git repositories and scripted collaborators.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::schema::Contract;
use crate::io::completion::{CompletionRequest, CompletionService};
use crate::io::github::{Issue, IssueTracker, PullRequestSpec};
use crate::io::test_runner::{TestRequest, TestRun, TestRunner};

/// A git repository in a temp dir with one commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "--quiet"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git(&["config", "user.email", "tests@example.com"]);
        repo.git(&["config", "user.name", "Tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# fixture\n");
        repo.commit("initial");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).expect("read file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "--quiet", "--allow-empty", "-m", message]);
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion service that replays queued answers per contract.
#[derive(Default)]
pub struct ScriptedCompletion {
    answers: RefCell<BTreeMap<&'static str, VecDeque<Value>>>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, contract: Contract, answer: Value) -> &Self {
        self.answers
            .borrow_mut()
            .entry(contract.name())
            .or_default()
            .push_back(answer);
        self
    }

    /// Contracts requested so far, in order.
    pub fn calls(&self) -> Vec<Contract> {
        self.requests.borrow().iter().map(|r| r.contract).collect()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }
}

impl CompletionService for ScriptedCompletion {
    fn complete(&self, request: &CompletionRequest) -> Result<Value> {
        self.requests.borrow_mut().push(request.clone());
        self.answers
            .borrow_mut()
            .get_mut(request.contract.name())
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted answer for contract {}", request.contract))
    }
}

/// Test runner that replays queued runs; the last one repeats.
pub struct ScriptedTestRunner {
    runs: RefCell<VecDeque<TestRun>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedTestRunner {
    pub fn new(runs: Vec<TestRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![run(0, "3 passed in 0.01s")])
    }

    /// Commands executed so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        self.commands.borrow_mut().push(request.command.clone());
        let mut runs = self.runs.borrow_mut();
        let next = if runs.len() > 1 {
            runs.pop_front()
        } else {
            runs.front().cloned()
        };
        next.ok_or_else(|| anyhow!("no scripted test run"))
    }
}

pub fn run(exit_code: i32, output: &str) -> TestRun {
    TestRun {
        exit_code,
        output: output.to_string(),
        timed_out: false,
    }
}

/// Issue tracker that serves one issue and records pull requests.
#[derive(Default)]
pub struct ScriptedTracker {
    pub issue: Issue,
    pull_requests: RefCell<Vec<PullRequestSpec>>,
}

impl ScriptedTracker {
    pub fn new(issue: Issue) -> Self {
        Self {
            issue,
            pull_requests: RefCell::new(Vec::new()),
        }
    }

    pub fn pull_requests(&self) -> Vec<PullRequestSpec> {
        self.pull_requests.borrow().clone()
    }
}

impl IssueTracker for ScriptedTracker {
    fn fetch_issue(&self, _repo: &str, _number: u64) -> Result<Issue> {
        Ok(self.issue.clone())
    }

    fn ensure_pull_request(&self, spec: &PullRequestSpec) -> Result<String> {
        let mut prs = self.pull_requests.borrow_mut();
        if !prs.iter().any(|pr| pr.head == spec.head) {
            prs.push(spec.clone());
        }
        Ok(format!("https://example.test/{}/pull/1", spec.repo))
    }
}
