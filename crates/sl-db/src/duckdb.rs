//! DuckDB adapter implementation

use crate::error::{DbError, DbResult};
use crate::traits::{Adapter, TestOutcome};
use async_trait::async_trait;
use duckdb::Connection;
use sl_core::sql_utils::{quote_ident, quote_qualified, split_qualified_name, strip_trailing_semicolon};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MERGE_STAGE: &str = "__sl_merge_stage";

/// DuckDB adapter.
///
/// One connection guarded by a mutex; every call runs on the blocking
/// thread pool so a caller-side timeout can fire while DuckDB works.
pub struct DuckDbBackend {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Create a new in-memory DuckDB connection
    pub fn in_memory() -> DbResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Create a new DuckDB connection from a file path
    pub fn from_path(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::ConnectionError(format!("{}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Create from path string (handles :memory: special case)
    pub fn new(path: &str) -> DbResult<Self> {
        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::from_path(Path::new(path))
        }
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// A second connection to the same database
    pub(crate) fn clone_connection(&self) -> DbResult<Connection> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))?;
        conn.try_clone()
            .map_err(|e| DbError::ConnectionError(e.to_string()))
    }

    /// Run `body` against the connection on the blocking pool
    async fn with_conn<F, T>(&self, body: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| DbError::MutexPoisoned(e.to_string()))?;
            body(&conn)
        })
        .await
        .map_err(|e| DbError::Internal(format!("blocking task failed: {}", e)))?
    }
}

/// Execute one statement, attaching the SQL to execution errors
fn execute(conn: &Connection, sql: &str) -> DbResult<u64> {
    log::debug!("duckdb: {}", sql);
    conn.execute(sql, [])
        .map(|n| n as u64)
        .map_err(|e| with_sql(e, sql))
}

fn execute_batch(conn: &Connection, sql: &str) -> DbResult<()> {
    log::debug!("duckdb: {}", sql);
    conn.execute_batch(sql).map_err(|e| with_sql(e, sql))
}

fn with_sql(err: duckdb::Error, sql: &str) -> DbError {
    match DbError::from(err) {
        DbError::ExecutionError(msg) => DbError::ExecutionError(format!("{}: {}", msg, sql)),
        other => other,
    }
}

fn count_rows(conn: &Connection, sql: &str) -> DbResult<u64> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM ({}) AS __sl_count", sql),
            [],
            |row| row.get(0),
        )
        .map_err(|e| with_sql(e, sql))?;
    Ok(count as u64)
}

/// Create the schema part of a qualified id, if any
fn ensure_schema(conn: &Connection, id: &str) -> DbResult<()> {
    match split_qualified_name(id) {
        (Some(schema), _) => execute_batch(
            conn,
            &format!("CREATE SCHEMA IF NOT EXISTS {}", quote_qualified(schema)),
        ),
        (None, _) => Ok(()),
    }
}

/// Run `body` inside BEGIN/COMMIT, rolling back on any error
fn transaction<T>(conn: &Connection, body: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
    conn.execute_batch("BEGIN TRANSACTION")
        .map_err(|e| DbError::ExecutionError(format!("BEGIN failed: {e}")))?;

    let result = body(conn);

    match &result {
        Ok(_) => {
            if let Err(commit_err) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(DbError::ExecutionError(format!(
                    "COMMIT failed: {commit_err}"
                )));
            }
        }
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

fn merge_sync(conn: &Connection, table: &str, query: &str, unique_key: &[String]) -> DbResult<u64> {
    if unique_key.is_empty() {
        return Err(DbError::ExecutionError(format!(
            "merge into {} requires a unique key",
            table
        )));
    }
    let target = quote_qualified(table);
    let stage = quote_ident(MERGE_STAGE);
    let key_match = unique_key
        .iter()
        .map(|k| {
            let col = quote_ident(k);
            format!("{stage}.{col} = {target}.{col}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    execute_batch(
        conn,
        &format!("CREATE OR REPLACE TEMP TABLE {stage} AS {query}"),
    )?;
    let result = transaction(conn, |conn| {
        execute(
            conn,
            &format!("DELETE FROM {target} WHERE EXISTS (SELECT 1 FROM {stage} WHERE {key_match})"),
        )?;
        execute(
            conn,
            &format!("INSERT INTO {target} BY NAME SELECT * FROM {stage}"),
        )
    });
    let _ = execute_batch(conn, &format!("DROP TABLE IF EXISTS {stage}"));
    result
}

fn relation_exists_sync(conn: &Connection, table_id: &str) -> DbResult<bool> {
    let parts: Vec<&str> = table_id.split('.').collect();
    let (catalog, schema, table) = match parts.as_slice() {
        [table] => (None, "main", *table),
        [schema, table] => (None, *schema, *table),
        [catalog, schema, table] => (Some(*catalog), *schema, *table),
        _ => return Ok(false),
    };

    let count: i64 = match catalog {
        Some(catalog) => conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE lower(table_catalog) = ? AND lower(table_schema) = ? AND lower(table_name) = ?",
            duckdb::params![catalog, schema, table],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE lower(table_schema) = ? AND lower(table_name) = ?",
            duckdb::params![schema, table],
            |row| row.get(0),
        )?,
    };
    Ok(count > 0)
}

#[async_trait]
impl Adapter for DuckDbBackend {
    async fn execute_full_materialization(&self, table_id: &str, query: &str) -> DbResult<u64> {
        let table = table_id.to_string();
        let query = strip_trailing_semicolon(query).to_string();
        self.with_conn(move |conn| {
            ensure_schema(conn, &table)?;
            let target = quote_qualified(&table);
            execute(conn, &format!("CREATE OR REPLACE TABLE {target} AS {query}"))?;
            count_rows(conn, &format!("SELECT * FROM {target}"))
        })
        .await
    }

    async fn execute_append(&self, table_id: &str, query: &str) -> DbResult<u64> {
        let target = quote_qualified(table_id);
        let query = strip_trailing_semicolon(query).to_string();
        self.with_conn(move |conn| execute(conn, &format!("INSERT INTO {target} BY NAME {query}")))
            .await
    }

    async fn execute_merge(
        &self,
        table_id: &str,
        query: &str,
        unique_key: &[String],
    ) -> DbResult<u64> {
        let table = table_id.to_string();
        let query = strip_trailing_semicolon(query).to_string();
        let unique_key = unique_key.to_vec();
        self.with_conn(move |conn| merge_sync(conn, &table, &query, &unique_key))
            .await
    }

    async fn execute_delete_insert(
        &self,
        table_id: &str,
        query: &str,
        filter_predicate: &str,
    ) -> DbResult<u64> {
        let target = quote_qualified(table_id);
        let query = strip_trailing_semicolon(query).to_string();
        let predicate = filter_predicate.to_string();
        self.with_conn(move |conn| {
            transaction(conn, |conn| {
                let deleted = execute(conn, &format!("DELETE FROM {target} WHERE {predicate}"))?;
                log::debug!("Deleted {} row(s) from {}", deleted, target);
                execute(conn, &format!("INSERT INTO {target} BY NAME {query}"))
            })
        })
        .await
    }

    async fn create_function(&self, function_id: &str, definition: &str) -> DbResult<()> {
        let function_id = function_id.to_string();
        let definition = definition.to_string();
        self.with_conn(move |conn| {
            ensure_schema(conn, &function_id)?;
            execute_batch(conn, &definition)
        })
        .await
    }

    async fn run_test(&self, test_id: &str, query: &str) -> DbResult<TestOutcome> {
        let test_id = test_id.to_string();
        let query = strip_trailing_semicolon(query).to_string();
        self.with_conn(move |conn| {
            let failing_rows = count_rows(conn, &query)?;
            log::debug!("Test {} returned {} failing row(s)", test_id, failing_rows);
            Ok(match failing_rows {
                0 => TestOutcome::Pass,
                n => TestOutcome::Fail { failing_rows: n },
            })
        })
        .await
    }

    async fn relation_exists(&self, table_id: &str) -> DbResult<bool> {
        let table_id = table_id.to_lowercase();
        self.with_conn(move |conn| relation_exists_sync(conn, &table_id))
            .await
    }

    async fn query_max(&self, query: &str, column: &str) -> DbResult<Option<String>> {
        let sql = format!(
            "SELECT CAST(MAX({}) AS VARCHAR) FROM ({}) AS __sl_src",
            column,
            strip_trailing_semicolon(query)
        );
        self.with_conn(move |conn| {
            conn.query_row(&sql, [], |row| row.get::<_, Option<String>>(0))
                .map_err(|e| with_sql(e, &sql))
        })
        .await
    }

    async fn create_stage(&self, stage: &str, query: &str) -> DbResult<u64> {
        let stage = quote_ident(stage);
        let query = strip_trailing_semicolon(query).to_string();
        self.with_conn(move |conn| {
            execute_batch(
                conn,
                &format!("CREATE OR REPLACE TEMP TABLE {stage} AS {query}"),
            )?;
            count_rows(conn, &format!("SELECT * FROM {stage}"))
        })
        .await
    }

    async fn drop_stage(&self, stage: &str) -> DbResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(stage));
        self.with_conn(move |conn| execute_batch(conn, &sql)).await
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> DbResult<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_qualified(schema));
        self.with_conn(move |conn| execute_batch(conn, &sql)).await
    }

    fn db_type(&self) -> &'static str {
        "duckdb"
    }
}

#[cfg(test)]
#[path = "duckdb_test.rs"]
mod tests;
