//! In-memory adapter for executor tests

use async_trait::async_trait;
use sl_db::{Adapter, DbError, DbResult, TestOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded adapter call
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub op: &'static str,
    pub target: String,
    pub query: String,
    pub extra: Option<String>,
}

/// Records every call; failures, test results and delays are scripted
#[derive(Debug, Default)]
pub(crate) struct FakeAdapter {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    failing_tests: Mutex<HashMap<String, u64>>,
    delays: Mutex<HashMap<String, Duration>>,
    relations: Mutex<HashSet<String>>,
    max_by_column: Mutex<HashMap<String, String>>,
    rows: Mutex<u64>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Self {
        let fake = Self::default();
        *fake.rows.lock().unwrap() = 1;
        fake
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_test(&self, id: &str, failing_rows: u64) {
        self.failing_tests
            .lock()
            .unwrap()
            .insert(id.to_string(), failing_rows);
    }

    pub fn delay(&self, id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(id.to_string(), delay);
    }

    pub fn set_max(&self, column: &str, value: &str) {
        self.max_by_column
            .lock()
            .unwrap()
            .insert(column.to_string(), value.to_string());
    }

    pub fn clear_max(&self, column: &str) {
        self.max_by_column.lock().unwrap().remove(column);
    }

    pub fn set_rows(&self, rows: u64) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn drop_relation(&self, id: &str) {
        self.relations.lock().unwrap().remove(id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Targets of calls named `op`, in call order
    pub fn targets(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.target)
            .collect()
    }

    /// Targets of every node-level call, in call order
    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                !matches!(
                    c.op,
                    "relation_exists" | "query_max" | "create_stage" | "drop_stage"
                )
            })
            .map(|c| c.target)
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(
        &self,
        op: &'static str,
        target: &str,
        query: &str,
        extra: Option<String>,
    ) -> DbResult<()> {
        self.calls.lock().unwrap().push(Call {
            op,
            target: target.to_string(),
            query: query.to_string(),
            extra,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(target).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(target) {
            return Err(DbError::ExecutionError(format!("{} failed for {}", op, target)));
        }
        Ok(())
    }

    /// Record a bookkeeping call that does not count towards concurrency
    fn record(&self, op: &'static str, target: &str, query: &str) {
        self.calls.lock().unwrap().push(Call {
            op,
            target: target.to_string(),
            query: query.to_string(),
            extra: None,
        });
    }

    fn write(&self, target: &str) -> u64 {
        self.relations.lock().unwrap().insert(target.to_string());
        *self.rows.lock().unwrap()
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn execute_full_materialization(&self, table_id: &str, query: &str) -> DbResult<u64> {
        self.enter("full", table_id, query, None).await?;
        Ok(self.write(table_id))
    }

    async fn execute_append(&self, table_id: &str, query: &str) -> DbResult<u64> {
        self.enter("append", table_id, query, None).await?;
        Ok(self.write(table_id))
    }

    async fn execute_merge(
        &self,
        table_id: &str,
        query: &str,
        unique_key: &[String],
    ) -> DbResult<u64> {
        self.enter("merge", table_id, query, Some(unique_key.join(",")))
            .await?;
        Ok(self.write(table_id))
    }

    async fn execute_delete_insert(
        &self,
        table_id: &str,
        query: &str,
        filter_predicate: &str,
    ) -> DbResult<u64> {
        self.enter(
            "delete_insert",
            table_id,
            query,
            Some(filter_predicate.to_string()),
        )
        .await?;
        Ok(self.write(table_id))
    }

    async fn create_function(&self, function_id: &str, definition: &str) -> DbResult<()> {
        self.enter("function", function_id, definition, None).await
    }

    async fn run_test(&self, test_id: &str, query: &str) -> DbResult<TestOutcome> {
        self.enter("test", test_id, query, None).await?;
        Ok(match self.failing_tests.lock().unwrap().get(test_id) {
            Some(&failing_rows) => TestOutcome::Fail { failing_rows },
            None => TestOutcome::Pass,
        })
    }

    async fn relation_exists(&self, table_id: &str) -> DbResult<bool> {
        self.record("relation_exists", table_id, "");
        Ok(self.relations.lock().unwrap().contains(table_id))
    }

    async fn query_max(&self, query: &str, column: &str) -> DbResult<Option<String>> {
        self.record("query_max", column, query);
        Ok(self.max_by_column.lock().unwrap().get(column).cloned())
    }

    async fn create_stage(&self, stage: &str, query: &str) -> DbResult<u64> {
        self.record("create_stage", stage, query);
        Ok(*self.rows.lock().unwrap())
    }

    async fn drop_stage(&self, stage: &str) -> DbResult<()> {
        self.record("drop_stage", stage, "");
        Ok(())
    }

    async fn create_schema_if_not_exists(&self, _schema: &str) -> DbResult<()> {
        Ok(())
    }

    fn db_type(&self) -> &'static str {
        "fake"
    }
}
