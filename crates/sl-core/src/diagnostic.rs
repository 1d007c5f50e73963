//! Non-fatal findings collected while building the graph or running nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a soft warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A reference matched no known node and is treated as an external leaf
    UnresolvedReference,
    /// A model referenced its own table; the self-edge was dropped
    SelfReference,
    /// Recorded and configured strategies differ (policy `warn`)
    StrategyMismatch,
    /// A test targets a table no node produces
    ExternalTestTarget,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::UnresolvedReference => write!(f, "unresolved_reference"),
            DiagnosticKind::SelfReference => write!(f, "self_reference"),
            DiagnosticKind::StrategyMismatch => write!(f, "strategy_mismatch"),
            DiagnosticKind::ExternalTestTarget => write!(f, "external_test_target"),
        }
    }
}

/// A soft warning tied to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub node: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            node: node.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.node, self.message)
    }
}
