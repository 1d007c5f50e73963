//! Project manifest: the parsed tables, functions and tests of one project.
//!
//! The manifest is produced by an upstream parser and read here as a single
//! YAML (or JSON) document. Record shape is validated once, at load.

use crate::dag::{DependencyGraph, GraphBuilder};
use crate::error::{CoreError, CoreResult};
use crate::node::{ParsedFunction, ParsedTable, ParsedTest};
use crate::resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MANIFEST_FILES: &[&str] = &["manifest.yml", "manifest.yaml", "manifest.json"];

/// Immutable input records for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectManifest {
    #[serde(default)]
    pub tables: Vec<ParsedTable>,
    #[serde(default)]
    pub functions: Vec<ParsedFunction>,
    #[serde(default)]
    pub tests: Vec<ParsedTest>,
}

impl ProjectManifest {
    /// Load a manifest file
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        let manifest: ProjectManifest =
            serde_yaml::from_str(&content).map_err(|e| CoreError::ConfigParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        log::debug!(
            "Loaded manifest {}: {} tables, {} functions, {} tests",
            path.display(),
            manifest.tables.len(),
            manifest.functions.len(),
            manifest.tests.len()
        );
        Ok(manifest)
    }

    /// Load the first manifest file found in `dir`
    pub fn load_from_dir(dir: &Path) -> CoreResult<Self> {
        MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .map(|path| Self::load(&path))
            .unwrap_or_else(|| {
                Err(CoreError::ConfigNotFound {
                    path: dir.join(MANIFEST_FILES[0]).display().to_string(),
                })
            })
    }

    /// Total number of records
    pub fn len(&self) -> usize {
        self.tables.len() + self.functions.len() + self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the dependency graph for these records
    pub fn build_graph(&self, resolver: Resolver) -> CoreResult<DependencyGraph> {
        GraphBuilder::from_records(resolver, &self.tables, &self.functions, &self.tests)
    }
}
