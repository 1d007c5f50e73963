//! Parsed input records and the graph nodes built from them.
//!
//! The upstream parser produces an immutable list of [`ParsedTable`],
//! [`ParsedFunction`] and [`ParsedTest`] records. Their shape is validated
//! once when they are deserialized; the graph builder turns each one into a
//! [`Node`] whose `depends_on` set holds resolved ids.

use crate::materialization::MaterializationConfig;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Discriminator for the three node variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A model materialized into a table
    Table,
    /// A user-defined function
    Function,
    /// A data-quality test
    Test,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Table => write!(f, "table"),
            NodeKind::Function => write!(f, "function"),
            NodeKind::Test => write!(f, "test"),
        }
    }
}

/// Test criticality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A failure stops dispatch of new nodes (default)
    #[default]
    Error,
    /// A failure is reported but never stops the run
    #[serde(alias = "warn")]
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Per-record schema defaults used to qualify bare references
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefaults {
    /// Schema applied to unqualified references from this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Reference aliases (`alias -> qualified id`) local to this record
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,
}

/// A parsed model, ready to be scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParsedTable {
    /// Table id, qualified or bare
    pub id: String,

    /// Fully resolved query text
    pub sql: String,

    /// Tables read by the query, as written
    #[serde(default)]
    pub source_tables: Vec<String>,

    /// Functions called by the query, as written
    #[serde(default)]
    pub source_functions: Vec<String>,

    /// Write mode and incremental settings
    #[serde(default, alias = "materialization")]
    pub materialization_config: MaterializationConfig,

    /// Schema defaults for bare references
    #[serde(default)]
    pub schema_defaults: SchemaDefaults,
}

/// A parsed user-defined function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParsedFunction {
    /// Function id, qualified or bare
    pub id: String,

    /// Complete DDL statement that (re)creates the function
    pub definition: String,

    /// Tables referenced by the body
    #[serde(default)]
    pub depends_on_tables: Vec<String>,

    /// Other functions referenced by the body
    #[serde(default)]
    pub depends_on_functions: Vec<String>,

    /// Schema defaults for bare references
    #[serde(default)]
    pub schema_defaults: SchemaDefaults,
}

/// Assertion performed by a test node.
///
/// Every variant compiles to a query that returns the offending rows; zero
/// rows means the test passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestCheck {
    /// Column has no NULLs
    NotNull,
    /// Column values are unique
    Unique,
    /// Column only holds the listed values
    AcceptedValues {
        /// Allowed values
        values: Vec<String>,
    },
    /// Every column value exists in `to.field`
    Relationships {
        /// Referenced table
        to: String,
        /// Referenced column
        field: String,
    },
    /// Hand-written query returning failing rows
    Sql {
        /// Query text
        sql: String,
    },
}

/// A parsed data-quality test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParsedTest {
    /// Test id
    pub id: String,

    /// Table under test
    pub target_table: String,

    /// Column under test, when the check is column-scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,

    /// Criticality
    #[serde(default)]
    pub severity: Severity,

    /// Assertion
    pub check: TestCheck,

    /// Schema defaults for the target reference
    #[serde(default)]
    pub schema_defaults: SchemaDefaults,
}

/// Executable payload of a table node
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Query text producing the table rows
    pub sql: String,
    /// Materialization settings
    pub materialization: MaterializationConfig,
}

/// Executable payload of a function node
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    /// DDL statement
    pub definition: String,
}

/// Executable payload of a test node
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    /// Resolved table under test
    pub target_table: NodeId,
    /// Column under test
    pub target_column: Option<String>,
    /// Criticality
    pub severity: Severity,
    /// Assertion
    pub check: TestCheck,
}

/// Variant-specific node data
#[derive(Debug, Clone, PartialEq)]
pub enum NodeDetail {
    Table(TableSpec),
    Function(FunctionSpec),
    Test(TestSpec),
}

/// A unit of work in the dependency graph.
///
/// Immutable once built; the graph is rebuilt on every invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Fully-qualified, globally unique id
    pub id: NodeId,
    /// Tracked dependencies (ids of other nodes in the same graph)
    pub depends_on: BTreeSet<NodeId>,
    /// Variant payload
    pub detail: NodeDetail,
}

impl Node {
    /// Node variant
    pub fn kind(&self) -> NodeKind {
        match self.detail {
            NodeDetail::Table(_) => NodeKind::Table,
            NodeDetail::Function(_) => NodeKind::Function,
            NodeDetail::Test(_) => NodeKind::Test,
        }
    }

    /// The table this node materializes, for table nodes
    pub fn produces(&self) -> Option<&NodeId> {
        match self.detail {
            NodeDetail::Table(_) => Some(&self.id),
            _ => None,
        }
    }

    /// Table payload, if this is a table node
    pub fn as_table(&self) -> Option<&TableSpec> {
        match &self.detail {
            NodeDetail::Table(spec) => Some(spec),
            _ => None,
        }
    }

    /// Test payload, if this is a test node
    pub fn as_test(&self) -> Option<&TestSpec> {
        match &self.detail {
            NodeDetail::Test(spec) => Some(spec),
            _ => None,
        }
    }
}
