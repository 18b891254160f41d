//! Stack resolution: request + catalog + detection into one `StackSpec`.
//!
//! Precedence for every field is explicit request > catalog entry > plugin
//! default. A requested stack whose markers are missing is either swapped for
//! the detected one (recorded in the trace), kept because it can bootstrap, or
//! rejected.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::command_safety::check_test_command;
use crate::core::request::RunRequest;
use crate::errors::StackResolutionError;
use crate::stack::catalog::{Catalog, CatalogEntry};
use crate::stack::markers::{exists_any, list_files};
use crate::stack::plugins::{Detection, RepoFiles, StackPlugin, detect};
use crate::stack::spec::{Commands, Markers, StackSpec, Toolchain};

/// Stack id recorded when the stack was auto-detected.
pub const AUTO_STACK_ID: &str = "auto";

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Fail when no test command can be determined.
    pub require_test_command: bool,
    /// Leading-executable allow-list for the command-safety check.
    pub runners: Vec<String>,
}

/// Why a requested stack was replaced by the detected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackSubstitution {
    pub requested: String,
    pub detected_language: String,
    pub reason: String,
}

/// Audit record of how the stack spec was assembled; persisted as `stack.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionTrace {
    pub requested_stack: String,
    pub requested_language: String,
    pub detection: Detection,
    pub catalog_entry: Option<String>,
    pub plugin: StackPlugin,
    pub substitution: Option<StackSubstitution>,
    /// Field name -> `request`, `catalog`, `plugin` or `detected`.
    pub sources: BTreeMap<String, String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub spec: StackSpec,
    pub trace: ResolutionTrace,
}

fn fail(stack_id: &str, message: impl Into<String>) -> anyhow::Error {
    StackResolutionError {
        stack_id: stack_id.to_string(),
        message: message.into(),
    }
    .into()
}

/// Pick the first non-empty candidate and record where it came from.
fn pick(
    sources: &mut BTreeMap<String, String>,
    field: &str,
    candidates: &[(&str, Option<&str>)],
) -> String {
    for (source, value) in candidates {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            sources.insert(field.to_string(), source.to_string());
            return value.to_string();
        }
    }
    String::new()
}

#[instrument(skip_all, fields(stack = %request.stack))]
pub fn resolve_stack(
    request: &RunRequest,
    root: &Path,
    catalog: &Catalog,
    options: &ResolveOptions,
) -> Result<Resolution> {
    let files = list_files(root)?;
    let repo = RepoFiles::new(&files);
    let detection = detect(&files);
    debug!(plugin = detection.plugin.name(), confidence = detection.confidence, "detected stack");

    let mut notes = Vec::new();
    let mut substitution = None;
    let mut stack_id = if request.is_auto_stack() {
        AUTO_STACK_ID.to_string()
    } else {
        request.stack.trim().to_string()
    };
    let mut request_language = request.language.as_str();
    let mut request_test = request.test_command.as_str();

    if !request.is_auto_stack() {
        let entry = catalog.get(&stack_id);
        if entry.is_none() {
            notes.push(format!("stack '{stack_id}' is not in the catalog; using plugin defaults"));
        }
        let markers = requested_markers(entry, request_language);
        if !markers.is_empty() && !exists_any(&files, &markers)? {
            if detection.confidence > 0 {
                warn!(
                    requested = %stack_id,
                    detected = %detection.language,
                    "requested stack markers missing; using detected stack"
                );
                substitution = Some(StackSubstitution {
                    requested: stack_id.clone(),
                    detected_language: detection.language.clone(),
                    reason: format!(
                        "none of [{}] found, but the repository looks like {}",
                        markers.join(", "),
                        detection.plugin.name()
                    ),
                });
                if !request_language.is_empty() || !request_test.is_empty() {
                    notes.push(
                        "ignored requested language and test command bound to the replaced stack"
                            .to_string(),
                    );
                }
                stack_id = AUTO_STACK_ID.to_string();
                request_language = "";
                request_test = "";
            } else if entry.is_some_and(|e| !e.bootstrap.is_none()) {
                notes.push(format!(
                    "no stack markers found; keeping '{stack_id}' for bootstrap"
                ));
            } else {
                return Err(fail(
                    &stack_id,
                    format!(
                        "none of [{}] exist and the stack declares no bootstrap; refusing to test the wrong project layout",
                        markers.join(", ")
                    ),
                ));
            }
        }
    }

    let entry = if stack_id == AUTO_STACK_ID {
        None
    } else {
        catalog.get(&stack_id)
    };
    let mut sources = BTreeMap::new();

    let language = pick(
        &mut sources,
        "language",
        &[
            ("request", Some(request_language)),
            ("catalog", entry.and_then(|e| e.language.as_deref())),
            ("detected", Some(detection.language.as_str())),
        ],
    )
    .to_ascii_lowercase();
    let plugin = if language.is_empty() {
        detection.plugin
    } else {
        StackPlugin::for_language(&language)
    };

    let plugin_toolchain = plugin.default_toolchain();
    let toolchain = Toolchain {
        kind: pick(
            &mut sources,
            "toolchain.kind",
            &[
                ("catalog", entry.and_then(|e| e.toolchain.kind.as_deref())),
                ("plugin", Some(plugin_toolchain.kind.as_str())),
            ],
        ),
        version: pick(
            &mut sources,
            "toolchain.version",
            &[
                ("catalog", entry.and_then(|e| e.toolchain.version.as_deref())),
                ("plugin", Some(plugin_toolchain.version.as_str())),
            ],
        ),
    };

    let defaults = plugin.default_commands(repo);
    let commands = Commands {
        install: pick(
            &mut sources,
            "commands.install",
            &[
                ("catalog", entry.and_then(|e| e.commands.install.as_deref())),
                ("plugin", Some(defaults.install.as_str())),
            ],
        ),
        build: pick(
            &mut sources,
            "commands.build",
            &[
                ("catalog", entry.and_then(|e| e.commands.build.as_deref())),
                ("plugin", Some(defaults.build.as_str())),
            ],
        ),
        test: pick(
            &mut sources,
            "commands.test",
            &[
                ("request", Some(request_test)),
                ("catalog", entry.and_then(|e| e.test_command.as_deref())),
                ("catalog", entry.and_then(|e| e.commands.test.as_deref())),
                ("plugin", Some(defaults.test.as_str())),
            ],
        ),
        lint: pick(
            &mut sources,
            "commands.lint",
            &[
                ("catalog", entry.and_then(|e| e.commands.lint.as_deref())),
                ("plugin", Some(defaults.lint.as_str())),
            ],
        ),
    };

    let allowed_test_prefixes = match entry {
        Some(e) if !e.allowed_test_prefixes.is_empty() => {
            sources.insert("allowed_test_prefixes".to_string(), "catalog".to_string());
            e.allowed_test_prefixes.clone()
        }
        _ => {
            sources.insert("allowed_test_prefixes".to_string(), "plugin".to_string());
            plugin.allowed_test_prefixes()
        }
    };

    let markers = match entry {
        Some(e) if !e.markers.any_of.is_empty() => e.markers.clone(),
        _ => Markers {
            any_of: plugin
                .marker_patterns()
                .iter()
                .map(|p| p.to_string())
                .collect(),
        },
    };

    let mut metadata = entry.map(|e| e.metadata.clone()).unwrap_or_default();
    metadata.extend(plugin.metadata(repo));

    let spec = StackSpec {
        stack_id: stack_id.clone(),
        language: if language.is_empty() {
            "generic".to_string()
        } else {
            language
        },
        toolchain,
        commands,
        dependencies: entry.map(|e| e.dependencies.clone()).unwrap_or_default(),
        allowed_test_prefixes,
        markers,
        bootstrap: entry.map(|e| e.bootstrap.clone()).unwrap_or_default(),
        metadata,
    };

    let test_command = spec.test_command();
    if test_command.is_empty() {
        if options.require_test_command {
            return Err(fail(
                &request.stack,
                format!(
                    "no test command for language '{}' (set test_command or pick a catalog stack)",
                    spec.language
                ),
            ));
        }
        notes.push("no test command resolved; the stack spec is degraded".to_string());
    } else {
        check_test_command(test_command, &options.runners, &spec.allowed_test_prefixes)?;
    }

    info!(
        stack_id = %spec.stack_id,
        language = %spec.language,
        test_command = %spec.commands.test,
        "stack resolved"
    );
    Ok(Resolution {
        trace: ResolutionTrace {
            requested_stack: request.stack.clone(),
            requested_language: request.language.clone(),
            detection,
            catalog_entry: entry.map(|_| stack_id),
            plugin,
            substitution,
            sources,
            notes,
        },
        spec,
    })
}

/// Markers of the requested stack: the catalog's, else its language plugin's.
fn requested_markers(entry: Option<&CatalogEntry>, request_language: &str) -> Vec<String> {
    if let Some(entry) = entry
        && !entry.markers.any_of.is_empty()
    {
        return entry.markers.any_of.clone();
    }
    let language = entry
        .and_then(|e| e.language.as_deref())
        .filter(|l| !l.is_empty())
        .unwrap_or(request_language);
    if language.is_empty() {
        return Vec::new();
    }
    StackPlugin::for_language(language)
        .marker_patterns()
        .iter()
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::command_safety::default_runners;
    use crate::errors::UnsafeCommandError;

    fn request(stack: &str, language: &str, test_command: &str) -> RunRequest {
        RunRequest {
            stack: stack.to_string(),
            language: language.to_string(),
            user_story: "story".to_string(),
            acceptance_criteria: vec!["X".to_string()],
            constraints: Vec::new(),
            max_iterations: 2,
            test_command: test_command.to_string(),
        }
    }

    fn options(require: bool) -> ResolveOptions {
        ResolveOptions {
            require_test_command: require,
            runners: default_runners(),
        }
    }

    #[test]
    fn explicit_request_beats_catalog_and_plugin() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("requirements.txt"), "pytest\n").expect("write");
        let catalog = Catalog::builtin().expect("catalog");

        let resolved = resolve_stack(
            &request("python-pytest", "python", "python -m pytest -q tests"),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect("resolve");
        assert_eq!(resolved.spec.commands.test, "python -m pytest -q tests");
        assert_eq!(resolved.trace.sources["commands.test"], "request");
        assert_eq!(resolved.spec.toolchain.version, "3.11");

        let resolved = resolve_stack(
            &request("python-pytest", "python", ""),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect("resolve");
        assert_eq!(resolved.spec.commands.test, "pytest -q");
        assert_eq!(resolved.trace.sources["commands.test"], "catalog");
    }

    #[test]
    fn missing_markers_fall_back_to_detected_stack() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("go.mod"), "module example\n").expect("write");
        let catalog = Catalog::builtin().expect("catalog");

        let resolved = resolve_stack(
            &request("java-maven", "java", "mvn -q test"),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect("resolve");
        assert_eq!(resolved.spec.language, "go");
        assert_eq!(resolved.spec.commands.test, "go test ./...");
        let substitution = resolved.trace.substitution.expect("substitution recorded");
        assert_eq!(substitution.requested, "java-maven");
    }

    #[test]
    fn no_markers_without_bootstrap_fails_fast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::builtin().expect("catalog");
        let err = resolve_stack(
            &request("java-maven", "java", ""),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect_err("no markers");
        assert!(err.downcast_ref::<StackResolutionError>().is_some());

        // With a bootstrap the requested stack is kept.
        let resolved = resolve_stack(
            &request("python-pytest", "python", ""),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect("bootstrap keeps stack");
        assert_eq!(resolved.spec.stack_id, "python-pytest");
    }

    #[test]
    fn auto_without_markers_needs_a_test_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::builtin().expect("catalog");

        let degraded = resolve_stack(&request("auto", "", ""), temp.path(), &catalog, &options(false))
            .expect("degraded spec");
        assert_eq!(degraded.spec.language, "generic");
        assert!(degraded.spec.commands.test.is_empty());

        let err = resolve_stack(&request("auto", "", ""), temp.path(), &catalog, &options(true))
            .expect_err("required");
        assert!(err.downcast_ref::<StackResolutionError>().is_some());
    }

    #[test]
    fn unsafe_test_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("requirements.txt"), "").expect("write");
        let catalog = Catalog::builtin().expect("catalog");
        let err = resolve_stack(
            &request("python-pytest", "python", "pytest -q; rm -rf /"),
            temp.path(),
            &catalog,
            &options(true),
        )
        .expect_err("unsafe");
        assert!(err.downcast_ref::<UnsafeCommandError>().is_some());
    }
}
