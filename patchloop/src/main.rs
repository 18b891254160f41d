//! Autonomous issue-to-pull-request agent.
//!
//! `patchloop run` resolves the repository's stack, plans the change, then
//! iterates patch → tests → report until the acceptance criteria are met,
//! the loop is stuck, or the iteration ceiling is reached.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use patchloop::core::command_safety::{check_test_command, default_runners};
use patchloop::core::request::{DEFAULT_MAX_ITERATIONS, RunRequest, language_from_stack_prefix};
use patchloop::engine::{ConfigPaths, EngineConfig, load_rules};
use patchloop::errors::ErrorClass;
use patchloop::exit_codes;
use patchloop::io::artifacts::{RunArtifacts, new_run_id};
use patchloop::io::completion::CodexCompletion;
use patchloop::io::github::GhCli;
use patchloop::io::test_runner::CommandTestRunner;
use patchloop::logging;
use patchloop::run::{RunInput, Services, run_agent};
use patchloop::stack::catalog::load_catalog;
use patchloop::stack::resolve::{ResolveOptions, resolve_stack};

#[derive(Parser)]
#[command(
    name = "patchloop",
    version,
    about = "Turn an issue into a tested pull request"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent for one issue comment.
    Run {
        /// Repository as `owner/name`.
        #[arg(long, env = "REPO")]
        repo: String,
        #[arg(long, env = "ISSUE_NUMBER")]
        issue: u64,
        /// Comment carrying `/agent run { ... }`.
        #[arg(long, env = "COMMENT_BODY")]
        comment_body: String,
        /// Repository checkout to work in.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Agent settings (TOML).
        #[arg(long, env = "PATCHLOOP_CONFIG")]
        config: Option<PathBuf>,
        /// Stack catalog (TOML).
        #[arg(long, env = "PATCHLOOP_CATALOG")]
        catalog: Option<PathBuf>,
        /// Failure classifier rules (TOML).
        #[arg(long, env = "FAILURE_HINTS_RULES_PATH")]
        rules: Option<PathBuf>,
    },
    /// Print the resolved stack for a repository as JSON.
    ResolveStack {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Catalog stack id; empty or `auto` detects it.
        #[arg(long, default_value = "auto")]
        stack: String,
        #[arg(long, default_value = "")]
        language: String,
        #[arg(long, default_value = "")]
        test_command: String,
        #[arg(long, env = "PATCHLOOP_CATALOG")]
        catalog: Option<PathBuf>,
    },
    /// Classify test output read from a file (or stdin) and print the result.
    Classify {
        /// File with the test output; stdin when omitted.
        input: Option<PathBuf>,
        #[arg(long, default_value = "")]
        language: String,
        #[arg(long, env = "FAILURE_HINTS_RULES_PATH")]
        rules: Option<PathBuf>,
    },
    /// Check a test command against the safety rules and print its argv.
    CheckCommand {
        command: String,
        /// Allowed command prefix; repeatable.
        #[arg(long = "prefix")]
        prefixes: Vec<String>,
        #[arg(long, env = "PATCHLOOP_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            repo,
            issue,
            comment_body,
            workdir,
            config,
            catalog,
            rules,
        } => cmd_run(
            RunInput {
                repo,
                issue_number: issue,
                comment_body,
                workdir,
            },
            ConfigPaths {
                settings: config,
                catalog,
                rules,
            },
        ),
        Command::ResolveStack {
            workdir,
            stack,
            language,
            test_command,
            catalog,
        } => cmd_resolve_stack(&workdir, stack, language, test_command, catalog.as_deref()),
        Command::Classify {
            input,
            language,
            rules,
        } => cmd_classify(input.as_deref(), &language, rules.as_deref()),
        Command::CheckCommand {
            command,
            prefixes,
            config,
        } => cmd_check_command(&command, &prefixes, config),
    };
    match code {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit(match ErrorClass::of(&err) {
                ErrorClass::Input | ErrorClass::Security => exit_codes::INVALID,
                _ => exit_codes::FAILED,
            })
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn cmd_run(input: RunInput, paths: ConfigPaths) -> Result<i32> {
    let config = EngineConfig::load(&paths)?;
    let settings = &config.settings;
    let artifacts = RunArtifacts::create(&input.workdir, &new_run_id())?;

    let completion = CodexCompletion::new(
        &input.workdir,
        artifacts.completions_dir(),
        settings.completion_timeout(),
        settings.output_limit_bytes,
    );
    let tracker = GhCli::new(&input.workdir);
    let services = Services {
        completion: &completion,
        tests: &CommandTestRunner,
        tracker: &tracker,
    };

    let summary = run_agent(&input, &config, services, &artifacts)?;
    println!("{}", artifacts.path("summary.md").display());
    if let Some(url) = &summary.pull_request_url {
        println!("{url}");
    }
    if let Some(error) = &summary.error {
        eprintln!("{}: {}", error.class, error.message);
    }
    Ok(summary.exit_code)
}

fn cmd_resolve_stack(
    workdir: &Path,
    stack: String,
    language: String,
    test_command: String,
    catalog: Option<&Path>,
) -> Result<i32> {
    let catalog = load_catalog(catalog)?;
    let language = if language.trim().is_empty() {
        language_from_stack_prefix(&stack).unwrap_or_default().to_string()
    } else {
        language.trim().to_ascii_lowercase()
    };
    let request = RunRequest {
        stack,
        language,
        user_story: String::new(),
        acceptance_criteria: Vec::new(),
        constraints: Vec::new(),
        max_iterations: DEFAULT_MAX_ITERATIONS,
        test_command,
    };
    let resolution = resolve_stack(
        &request,
        workdir,
        &catalog,
        &ResolveOptions {
            require_test_command: false,
            runners: default_runners(),
        },
    )?;
    print_json(&resolution)?;
    Ok(exit_codes::OK)
}

fn cmd_classify(input: Option<&Path>, language: &str, rules: Option<&Path>) -> Result<i32> {
    let output = match input {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read test output from stdin")?;
            buf
        }
    };
    let rules = load_rules(rules)?;
    print_json(&rules.classify(&output, language))?;
    Ok(exit_codes::OK)
}

fn cmd_check_command(command: &str, prefixes: &[String], config: Option<PathBuf>) -> Result<i32> {
    let config = EngineConfig::load(&ConfigPaths {
        settings: config,
        ..ConfigPaths::default()
    })?;
    let argv = check_test_command(command, &config.settings.test_runners, prefixes)?;
    print_json(&argv)?;
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}
