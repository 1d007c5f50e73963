//! sl-core - Core library for Sluice
//!
//! Shared types for the execution engine: node ids and parsed records,
//! materialization settings, reference resolution, dependency graph
//! building and ordering, incremental state and its stores, filter template
//! substitution, and project configuration.

pub mod config;
pub mod dag;
pub mod diagnostic;
pub mod error;
pub mod manifest;
pub mod materialization;
pub mod node;
pub mod node_id;
pub mod resolver;
pub mod sql_utils;
pub mod state;
pub mod template;

pub use config::{Config, DatabaseConfig, StateBackend, StateConfig, TargetConfig};
pub use dag::{DependencyGraph, ExecutionOrder, GraphBuilder};
pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use error::{CoreError, CoreResult};
pub use manifest::ProjectManifest;
pub use materialization::{
    IncrementalStrategy, LookbackWindow, MaterializationConfig, StrategyMismatchPolicy,
    TimeColumnType,
};
pub use node::{
    FunctionSpec, Node, NodeDetail, NodeKind, ParsedFunction, ParsedTable, ParsedTest,
    SchemaDefaults, Severity, TableSpec, TestCheck, TestSpec,
};
pub use node_id::NodeId;
pub use resolver::{Resolution, Resolver};
pub use state::{
    IncrementalState, JsonStateStore, MemoryStateStore, StateFile, StateStore, WatermarkValue,
};
pub use template::TemplateVars;
