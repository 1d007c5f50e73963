//! sl-test - Data test SQL generation for Sluice
//!
//! Turns a test node's check into a query returning the offending rows,
//! which the adapter's `run_test` counts.

pub mod generator;

pub use generator::{generate_test_sql, TestGenError, TestGenResult};
