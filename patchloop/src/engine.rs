//! Everything a run needs that does not change while it runs.
//!
//! Settings, the stack catalog, the failure rules and the compiled contract
//! schemas are loaded once and passed by reference into every stage.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::authenticity::{AuthenticityPolicy, ManualExpectedValuePolicy};
use crate::core::classifier::RuleSet;
use crate::core::schema::ContractSchemas;
use crate::io::config::{AgentSettings, load_settings};
use crate::stack::catalog::{Catalog, load_catalog};

/// Optional override files; `None` or a missing file means "embedded default".
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub settings: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub rules: Option<PathBuf>,
}

pub struct EngineConfig {
    pub settings: AgentSettings,
    pub catalog: Catalog,
    pub rules: RuleSet,
    pub schemas: ContractSchemas,
    pub policies: Vec<Box<dyn AuthenticityPolicy>>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policies: Vec<&str> = self.policies.iter().map(|p| p.name()).collect();
        f.debug_struct("EngineConfig")
            .field("settings", &self.settings)
            .field("stacks", &self.catalog.stacks.len())
            .field("rules", &self.rules.len())
            .field("policies", &policies)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn load(paths: &ConfigPaths) -> Result<Self> {
        let settings = match &paths.settings {
            Some(path) => load_settings(path)?,
            None => {
                let settings = AgentSettings::default();
                settings.validate()?;
                settings
            }
        };
        Ok(Self {
            settings,
            catalog: load_catalog(paths.catalog.as_deref())?,
            rules: load_rules(paths.rules.as_deref())?,
            schemas: ContractSchemas::compile()?,
            policies: default_policies(),
        })
    }

    /// Embedded defaults only.
    pub fn builtin() -> Result<Self> {
        Self::load(&ConfigPaths::default())
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }
}

pub fn default_policies() -> Vec<Box<dyn AuthenticityPolicy>> {
    vec![Box::new(ManualExpectedValuePolicy)]
}

/// Load failure rules from `path`, or the embedded rules when `path` is `None`
/// or missing.
pub fn load_rules(path: Option<&Path>) -> Result<RuleSet> {
    let Some(path) = path.filter(|p| p.exists()) else {
        debug!("using embedded failure rules");
        return RuleSet::builtin();
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    RuleSet::from_toml_str(&contents).with_context(|| format!("load failure rules {}", path.display()))
}
