//! Shared utilities for CLI commands

use anyhow::{bail, Context, Result};
use sl_core::{
    Config, DependencyGraph, JsonStateStore, NodeId, ProjectManifest, StateBackend, StateStore,
    TemplateVars,
};
use sl_db::{DuckDbBackend, DuckDbStateStore};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::GlobalArgs;

/// Error type representing a non-zero process exit code.
///
/// Use `return Err(ExitCode(N).into())` instead of `std::process::exit(N)`
/// so that RAII destructors run and cleanup happens properly.
#[derive(Debug)]
pub(crate) struct ExitCode(pub(crate) i32);

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Control flow only; main.rs prints nothing for it
        write!(f, "")
    }
}

impl std::error::Error for ExitCode {}

/// A loaded project: root directory, configuration and manifest
pub(crate) struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub target: Option<String>,
    pub manifest: ProjectManifest,
}

impl Project {
    /// Load `sluice.yml` (or `--config`) and the manifest from the project dir
    pub(crate) fn load(global: &GlobalArgs) -> Result<Self> {
        let root = PathBuf::from(&global.project_dir);
        let config = match &global.config {
            Some(path) => Config::load(Path::new(path)),
            None => Config::load_from_dir(&root),
        }
        .context("Failed to load project config")?;
        let manifest =
            ProjectManifest::load_from_dir(&root).context("Failed to load project manifest")?;
        let target = Config::resolve_target(global.target.as_deref());
        log::debug!(
            "Loaded project '{}' with {} node(s), target {:?}",
            config.name,
            manifest.len(),
            target
        );
        Ok(Self {
            root,
            config,
            target,
            manifest,
        })
    }

    pub(crate) fn graph(&self) -> Result<DependencyGraph> {
        self.manifest
            .build_graph(self.config.resolver(self.target.as_deref()))
            .context("Failed to build dependency graph")
    }

    /// Open the database for the active target
    pub(crate) fn backend(&self) -> Result<Arc<DuckDbBackend>> {
        let db = self.config.get_database_config(self.target.as_deref())?;
        let backend = if db.path == ":memory:" {
            DuckDbBackend::in_memory()
        } else {
            DuckDbBackend::from_path(&self.root.join(&db.path))
        }
        .with_context(|| format!("Failed to open database '{}'", db.path))?;
        Ok(Arc::new(backend))
    }

    /// Open the configured state store
    pub(crate) fn state_store(&self, backend: &DuckDbBackend) -> Result<Arc<dyn StateStore>> {
        Ok(match self.config.state.backend {
            StateBackend::Json => {
                let path = self.config.state_path_absolute(&self.root);
                Arc::new(JsonStateStore::open(path).context("Failed to open state file")?)
            }
            StateBackend::DuckDb => Arc::new(
                DuckDbStateStore::for_backend(backend).context("Failed to open state table")?,
            ),
        })
    }

    pub(crate) fn target_dir(&self) -> PathBuf {
        self.config.target_path_absolute(&self.root)
    }
}

/// Union of comma-separated selectors, or `None` to run everything
pub(crate) fn resolve_selection(
    graph: &DependencyGraph,
    select: Option<&str>,
) -> Result<Option<BTreeSet<NodeId>>> {
    let Some(select) = select else {
        return Ok(None);
    };
    let mut selected = BTreeSet::new();
    for selector in select.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        selected.extend(graph.select(selector)?);
    }
    if selected.is_empty() {
        bail!("Selection '{}' matched no nodes", select);
    }
    Ok(Some(selected))
}

/// Overlay `--vars-json` and then `--vars key=value` pairs on `base`
pub(crate) fn merge_cli_vars(
    mut base: TemplateVars,
    pairs: &[String],
    json: Option<&str>,
) -> Result<TemplateVars> {
    if let Some(json) = json {
        let value: serde_json::Value =
            serde_json::from_str(json).context("--vars-json is not valid JSON")?;
        let serde_json::Value::Object(map) = value else {
            bail!("--vars-json must be a JSON object");
        };
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => "NULL".to_string(),
                _ => bail!("variable '{}' must be a scalar", key),
            };
            base.insert(key, text);
        }
    }
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --vars '{}', expected KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --vars '{}', empty key", pair);
        }
        base.insert(key.to_string(), value.to_string());
    }
    Ok(base)
}
