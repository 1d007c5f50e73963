//! sl-run - Incremental execution and run orchestration for Sluice
//!
//! [`Orchestrator`] drives a built dependency graph through an adapter;
//! table nodes go through [`TableRunner`], which decides between a full and
//! an incremental load and keeps per-model state.

pub mod error;
pub mod incremental;
pub mod orchestrator;
pub mod report;

#[cfg(test)]
mod testing;

pub use error::{RunError, RunResult};
pub use incremental::{
    build_time_filter, execute_strategy, should_run_incremental, Decision, DecisionInput,
    ModelLocks, RunMode, TableOutcome, TableRunner,
};
pub use orchestrator::{CancellationFlag, Orchestrator, RunOptions};
pub use report::{NodeResult, NodeStatus, RunReport, RunSummary};
