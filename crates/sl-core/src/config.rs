//! Configuration types and parsing for sluice.yml

use crate::error::{CoreError, CoreResult};
use crate::materialization::StrategyMismatchPolicy;
use crate::resolver::Resolver;
use crate::template::TemplateVars;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "sluice.yml";
const DEFAULT_DB_PATH: &str = ":memory:";
const DEFAULT_TARGET_DIR: &str = "target";
const DEFAULT_STATE_FILE: &str = "state.json";

/// Main project configuration from sluice.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Project name
    pub name: String,

    /// Schema applied to bare references
    #[serde(default = "default_schema")]
    pub default_schema: String,

    /// Database connection configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Where incremental state is persisted
    #[serde(default)]
    pub state: StateConfig,

    /// Variables available to filter templates
    #[serde(default)]
    pub vars: BTreeMap<String, serde_yaml::Value>,

    /// Project-wide reference aliases (`alias -> qualified id`)
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Maximum number of nodes executing at once
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Behaviour when recorded and configured strategies differ
    #[serde(default)]
    pub strategy_mismatch: StrategyMismatchPolicy,

    /// Per adapter call timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_secs: Option<u64>,

    /// Output directory for run results and the default state file
    #[serde(default = "default_target_path")]
    pub target_path: String,

    /// Named target configurations (e.g., dev, prod)
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

/// Target-specific configuration overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Database configuration override
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Default schema override
    #[serde(default)]
    pub default_schema: Option<String>,

    /// Variable overrides (merged over base vars)
    #[serde(default)]
    pub vars: BTreeMap<String, serde_yaml::Value>,
}

/// Database connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// DuckDB file path or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// State store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON file under the target directory (default)
    #[default]
    Json,
    /// Table inside the project database
    DuckDb,
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateBackend::Json => write!(f, "json"),
            StateBackend::DuckDb => write!(f, "duckdb"),
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Backend
    #[serde(default)]
    pub backend: StateBackend,

    /// JSON state file; defaults to `<target_path>/state.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_schema() -> String {
    "main".to_string()
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_threads() -> usize {
    1
}

fn default_target_path() -> String {
    DEFAULT_TARGET_DIR.to_string()
}

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| CoreError::ConfigParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a project directory.
    /// Looks for sluice.yml or sluice.yaml
    pub fn load_from_dir(dir: &Path) -> CoreResult<Self> {
        let yml_path = dir.join(CONFIG_FILE);
        let yaml_path = dir.join("sluice.yaml");

        if yml_path.exists() {
            Self::load(&yml_path)
        } else if yaml_path.exists() {
            Self::load(&yaml_path)
        } else {
            Err(CoreError::ConfigNotFound {
                path: yml_path.display().to_string(),
            })
        }
    }

    fn validate(&self) -> CoreResult<()> {
        let invalid = |message: &str| CoreError::ConfigInvalid {
            node: CONFIG_FILE.to_string(),
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("Project name cannot be empty"));
        }
        if self.default_schema.trim().is_empty() {
            return Err(invalid("default_schema cannot be empty"));
        }
        if self.threads == 0 {
            return Err(invalid("threads must be at least 1"));
        }
        if self.node_timeout_secs == Some(0) {
            return Err(invalid("node_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Absolute target directory relative to a project root
    pub fn target_path_absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.target_path)
    }

    /// Absolute JSON state file path relative to a project root
    pub fn state_path_absolute(&self, root: &Path) -> PathBuf {
        match &self.state.path {
            Some(path) => root.join(path),
            None => self.target_path_absolute(root).join(DEFAULT_STATE_FILE),
        }
    }

    /// Get target configuration by name
    pub fn get_target(&self, name: &str) -> CoreResult<&TargetConfig> {
        self.targets.get(name).ok_or_else(|| {
            let mut available: Vec<&str> = self.targets.keys().map(|k| k.as_str()).collect();
            available.sort_unstable();
            CoreError::ConfigInvalid {
                node: CONFIG_FILE.to_string(),
                message: format!(
                    "Target '{}' not found. Available targets: {}",
                    name,
                    available.join(", ")
                ),
            }
        })
    }

    /// Get database configuration, applying target overrides
    pub fn get_database_config(&self, target: Option<&str>) -> CoreResult<DatabaseConfig> {
        match target {
            Some(name) => Ok(self
                .get_target(name)?
                .database
                .clone()
                .unwrap_or_else(|| self.database.clone())),
            None => Ok(self.database.clone()),
        }
    }

    /// Get the default schema, applying target overrides
    pub fn get_default_schema(&self, target: Option<&str>) -> &str {
        target
            .and_then(|name| self.targets.get(name))
            .and_then(|tc| tc.default_schema.as_deref())
            .unwrap_or(&self.default_schema)
    }

    /// Get merged variables, with target overrides taking precedence
    pub fn get_merged_vars(
        &self,
        target: Option<&str>,
    ) -> Cow<'_, BTreeMap<String, serde_yaml::Value>> {
        let target_config = target.and_then(|name| self.targets.get(name));
        match target_config.filter(|tc| !tc.vars.is_empty()) {
            Some(tc) => {
                let mut vars = self.vars.clone();
                for (key, value) in &tc.vars {
                    vars.insert(key.clone(), value.clone());
                }
                Cow::Owned(vars)
            }
            None => Cow::Borrowed(&self.vars),
        }
    }

    /// Merged variables rendered as SQL text for template substitution.
    ///
    /// Scalars render as written; sequences and maps are rejected.
    pub fn template_vars(&self, target: Option<&str>) -> CoreResult<TemplateVars> {
        self.get_merged_vars(target)
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Null => "NULL".to_string(),
                    _ => {
                        return Err(CoreError::ConfigInvalid {
                            node: CONFIG_FILE.to_string(),
                            message: format!("variable '{}' must be a scalar", key),
                        })
                    }
                };
                Ok((key.clone(), text))
            })
            .collect()
    }

    /// Resolver seeded with the default schema and project aliases
    pub fn resolver(&self, target: Option<&str>) -> Resolver {
        let mut resolver = Resolver::new(self.get_default_schema(target));
        for (alias, id) in &self.aliases {
            resolver.add_alias(alias, id);
        }
        resolver
    }

    /// Resolve target from CLI flag or SL_TARGET environment variable.
    ///
    /// Priority: CLI flag > SL_TARGET env var > None
    pub fn resolve_target(cli_target: Option<&str>) -> Option<String> {
        cli_target
            .map(String::from)
            .or_else(|| std::env::var("SL_TARGET").ok())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
