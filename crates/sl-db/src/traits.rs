//! Adapter boundary trait definition

use crate::error::DbResult;
use async_trait::async_trait;

/// Result of running a data test query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    /// The query returned no rows
    Pass,
    /// The query returned offending rows
    Fail { failing_rows: u64 },
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Pass)
    }
}

/// Everything the executor asks of the warehouse.
///
/// `table_id` and `function_id` are fully-qualified, unquoted node ids;
/// implementations quote them. Queries arrive fully rendered. Handles are
/// shared across concurrently running nodes, so implementations must be
/// Send + Sync.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Replace (or create) the table from the unfiltered query
    async fn execute_full_materialization(&self, table_id: &str, query: &str) -> DbResult<u64>;

    /// Insert every row of `query`, no deduplication
    async fn execute_append(&self, table_id: &str, query: &str) -> DbResult<u64>;

    /// Upsert the rows of `query` by `unique_key`
    async fn execute_merge(&self, table_id: &str, query: &str, unique_key: &[String])
        -> DbResult<u64>;

    /// Delete rows matching `filter_predicate`, then insert the rows of `query`
    async fn execute_delete_insert(
        &self,
        table_id: &str,
        query: &str,
        filter_predicate: &str,
    ) -> DbResult<u64>;

    /// Run a function's DDL statement
    async fn create_function(&self, function_id: &str, definition: &str) -> DbResult<()>;

    /// Run a failing-rows query; zero rows passes
    async fn run_test(&self, test_id: &str, query: &str) -> DbResult<TestOutcome>;

    /// Check if a table or view exists
    async fn relation_exists(&self, table_id: &str) -> DbResult<bool>;

    /// `MAX(column)` over the rows of `query`, as text; `None` when empty
    async fn query_max(&self, query: &str, column: &str) -> DbResult<Option<String>>;

    /// Materialize `query` once into a session-local staging relation named
    /// `stage`, replacing any previous one. Returns the rows staged.
    ///
    /// Later calls on the same adapter can read the stage by its unqualified
    /// name, so a watermark and a write can both be taken from one snapshot.
    async fn create_stage(&self, stage: &str, query: &str) -> DbResult<u64>;

    /// Drop a staging relation, if it exists
    async fn drop_stage(&self, stage: &str) -> DbResult<()>;

    /// Create a schema if it does not exist
    async fn create_schema_if_not_exists(&self, schema: &str) -> DbResult<()>;

    /// Database type identifier for logging
    fn db_type(&self) -> &'static str;
}
