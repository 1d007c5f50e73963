//! Structured run results

use crate::incremental::RunMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sl_core::{CoreError, CoreResult, Diagnostic, NodeId, NodeKind, Severity};
use std::fmt;
use std::path::Path;

/// Terminal status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Succeeded => write!(f, "succeeded"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Absent for nodes that never started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Test severity, for test nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Table nodes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl NodeResult {
    pub(crate) fn new(node_id: NodeId, kind: NodeKind, status: NodeStatus) -> Self {
        Self {
            node_id,
            kind,
            status,
            error: None,
            started_at: None,
            finished_at: None,
            severity: None,
            run_mode: None,
            rows_affected: None,
            predicate: None,
        }
    }

    pub(crate) fn skipped(node_id: NodeId, kind: NodeKind, reason: String) -> Self {
        Self {
            error: Some(reason),
            ..Self::new(node_id, kind, NodeStatus::Skipped)
        }
    }

    /// Wall-clock duration, for nodes that ran
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// A failed node that does not fail the run: a `warning` test
    pub fn is_warning(&self) -> bool {
        self.status == NodeStatus::Failed && self.severity == Some(Severity::Warning)
    }
}

/// Status counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub warned: usize,
    pub skipped: usize,
}

/// Result of one orchestrator run, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<NodeResult>,
    /// Graph-build and strategy-mismatch warnings
    pub diagnostics: Vec<Diagnostic>,
    /// An `error` test failed and dispatch stopped
    pub halted: bool,
    pub cancelled: bool,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for result in &self.results {
            match result.status {
                NodeStatus::Succeeded => summary.succeeded += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Failed if result.is_warning() => summary.warned += 1,
                NodeStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// No node failed apart from `warning` tests
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.summary().failed == 0
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node_id.as_str() == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.result(node_id).map(|r| r.status)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::IoWithPath {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(results: Vec<NodeResult>) -> RunReport {
        RunReport {
            run_id: "r1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results,
            diagnostics: Vec::new(),
            halted: false,
            cancelled: false,
        }
    }

    #[test]
    fn test_summary_counts_warning_tests_separately() {
        let mut warned = NodeResult::new(NodeId::new("t_warn"), NodeKind::Test, NodeStatus::Failed);
        warned.severity = Some(Severity::Warning);
        let report = report(vec![
            NodeResult::new(NodeId::new("main.a"), NodeKind::Table, NodeStatus::Succeeded),
            warned,
            NodeResult::skipped(NodeId::new("main.b"), NodeKind::Table, "upstream".into()),
        ]);
        assert_eq!(
            report.summary(),
            RunSummary {
                succeeded: 1,
                failed: 0,
                warned: 1,
                skipped: 1,
            }
        );
        assert!(report.is_success());
        assert_eq!(report.status_of("main.b"), Some(NodeStatus::Skipped));
    }

    #[test]
    fn test_write_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target").join("run_results.json");
        let mut failed = NodeResult::new(NodeId::new("main.a"), NodeKind::Table, NodeStatus::Failed);
        failed.error = Some("boom".into());
        report(vec![failed]).write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"][0]["status"], "failed");
        assert_eq!(value["results"][0]["kind"], "table");
        assert_eq!(value["results"][0]["error"], "boom");
    }
}
