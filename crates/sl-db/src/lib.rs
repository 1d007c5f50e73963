//! sl-db - Adapter boundary for Sluice
//!
//! This crate provides the `Adapter` trait the executor drives, its DuckDB
//! implementation, and a DuckDB-backed state store.

pub mod duckdb;
pub mod error;
pub mod state_store;
pub mod traits;

pub use duckdb::DuckDbBackend;
pub use error::{DbError, DbResult};
pub use state_store::DuckDbStateStore;
pub use traits::{Adapter, TestOutcome};
