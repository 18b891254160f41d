//! Resolved stack description shared by the resolver, preflight and the loop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// `python`, `node`, `java`, `dotnet`, `go` or `generic`.
    pub kind: String,
    pub version: String,
}

/// Only `test` is executed by the loop; the rest is informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Commands {
    pub install: String,
    pub build: String,
    pub test: String,
    pub lint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependencies {
    /// OS packages (apt and similar).
    pub system: Vec<String>,
    /// Language packages (pip, npm, ...).
    pub language: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Markers {
    /// Glob patterns relative to the repo root; any match marks the stack present.
    pub any_of: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapTemplate {
    pub path: String,
    pub content: String,
}

/// How to scaffold a repository whose markers are missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Bootstrap {
    #[default]
    None,
    #[serde(alias = "template")]
    Templates {
        #[serde(default)]
        templates: Vec<BootstrapTemplate>,
    },
    #[serde(alias = "command")]
    Commands {
        #[serde(default)]
        commands: Vec<String>,
    },
}

impl Bootstrap {
    pub fn is_none(&self) -> bool {
        matches!(self, Bootstrap::None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Bootstrap::None => "none",
            Bootstrap::Templates { .. } => "templates",
            Bootstrap::Commands { .. } => "commands",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    pub stack_id: String,
    pub language: String,
    pub toolchain: Toolchain,
    pub commands: Commands,
    pub dependencies: Dependencies,
    pub allowed_test_prefixes: Vec<String>,
    pub markers: Markers,
    pub bootstrap: Bootstrap,
    pub metadata: BTreeMap<String, String>,
}

impl StackSpec {
    pub fn test_command(&self) -> &str {
        self.commands.test.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_accepts_singular_kind_aliases() {
        let parsed: Bootstrap = toml::from_str(
            r#"
kind = "template"
templates = [{ path = "requirements.txt", content = "pytest\n" }]
"#,
        )
        .expect("parse");
        assert_eq!(parsed.kind(), "templates");

        let parsed: Bootstrap =
            toml::from_str("kind = \"command\"\ncommands = [\"go mod init example\"]\n")
                .expect("parse");
        assert!(matches!(parsed, Bootstrap::Commands { ref commands } if commands.len() == 1));
    }
}
