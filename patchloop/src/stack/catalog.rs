//! Declarative stack catalog (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stack::spec::{Bootstrap, Dependencies, Markers};

pub const DEFAULT_CATALOG_TOML: &str = include_str!("../../defaults/catalog.toml");

/// Partial toolchain; empty fields fall back to the plugin default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainOverride {
    pub kind: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsOverride {
    pub install: Option<String>,
    pub build: Option<String>,
    pub test: Option<String>,
    pub lint: Option<String>,
}

/// One catalog entry; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogEntry {
    pub language: Option<String>,
    pub toolchain: ToolchainOverride,
    pub commands: CommandsOverride,
    /// Shorthand that wins over `commands.test`.
    pub test_command: Option<String>,
    pub dependencies: Dependencies,
    pub allowed_test_prefixes: Vec<String>,
    pub markers: Markers,
    pub bootstrap: Bootstrap,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub stacks: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let catalog: Catalog = toml::from_str(source).context("parse stack catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(DEFAULT_CATALOG_TOML)
    }

    pub fn get(&self, stack_id: &str) -> Option<&CatalogEntry> {
        self.stacks.get(stack_id)
    }

    pub fn validate(&self) -> Result<()> {
        for (id, entry) in &self.stacks {
            if id.trim().is_empty() || id != id.trim() {
                return Err(anyhow!("catalog stack id '{id}' must be non-empty and trimmed"));
            }
            if let Bootstrap::Templates { templates } = &entry.bootstrap
                && templates.iter().any(|t| t.path.trim().is_empty())
            {
                return Err(anyhow!("catalog stack '{id}': bootstrap template without path"));
            }
        }
        Ok(())
    }
}

/// Load the catalog from `path`, or the embedded default when `path` is
/// `None` or missing.
pub fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    let Some(path) = path.filter(|p| p.exists()) else {
        debug!("using embedded stack catalog");
        return Catalog::builtin();
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Catalog::from_toml_str(&contents).with_context(|| format!("load catalog {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_parses() {
        let catalog = Catalog::builtin().expect("builtin catalog");
        let entry = catalog.get("python-pytest").expect("python-pytest");
        assert_eq!(entry.language.as_deref(), Some("python"));
        assert_eq!(entry.bootstrap.kind(), "templates");
        assert!(catalog.get("java-maven").expect("java").bootstrap.is_none());
        assert_eq!(catalog.get("go-std").expect("go").bootstrap.kind(), "commands");
    }

    #[test]
    fn file_catalog_replaces_embedded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("catalog.toml");
        fs::write(
            &path,
            "[stacks.custom]\nlanguage = \"go\"\ntest_command = \"go test ./... -count=1\"\n",
        )
        .expect("write");
        let catalog = load_catalog(Some(&path)).expect("load");
        assert_eq!(catalog.stacks.len(), 1);
        assert_eq!(
            catalog.get("custom").and_then(|e| e.test_command.as_deref()),
            Some("go test ./... -count=1")
        );

        let missing = load_catalog(Some(&temp.path().join("nope.toml"))).expect("fallback");
        assert!(missing.get("python-pytest").is_some());
    }
}
