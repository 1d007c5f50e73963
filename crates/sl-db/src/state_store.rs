//! Incremental state kept in a DuckDB table.
//!
//! Lives next to the models it describes so a warehouse restore brings its
//! state along. Each `put` is a single `INSERT OR REPLACE` inside a
//! transaction.

use crate::duckdb::DuckDbBackend;
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use sl_core::{CoreResult, IncrementalState, IncrementalStrategy, NodeId, StateStore};
use std::sync::Mutex;

const DDL: &str = "
CREATE SCHEMA IF NOT EXISTS sl_state;
CREATE TABLE IF NOT EXISTS sl_state.incremental_state (
    model_id           VARCHAR PRIMARY KEY,
    last_run_timestamp VARCHAR NOT NULL,
    strategy_used      VARCHAR NOT NULL,
    watermark_value    VARCHAR,
    row_count          BIGINT
);
";

const SELECT_COLUMNS: &str = "SELECT model_id, last_run_timestamp, strategy_used, watermark_value, row_count \
     FROM sl_state.incremental_state";

/// State store backed by a DuckDB table
pub struct DuckDbStateStore {
    conn: Mutex<Connection>,
}

type StateRow = (String, String, String, Option<String>, Option<i64>);

impl DuckDbStateStore {
    /// Open the store on a second connection to the adapter's database
    pub fn for_backend(backend: &DuckDbBackend) -> DbResult<Self> {
        Self::from_connection(backend.clone_connection()?)
    }

    /// Open the store on its own connection, creating the table if needed
    pub fn from_connection(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))
    }

    fn query(&self, filter: Option<&str>) -> DbResult<Vec<IncrementalState>> {
        let conn = self.lock()?;
        let rows: Vec<StateRow> = match filter {
            Some(model_id) => {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE model_id = ?"))?;
                let mapped = stmt.query_map(duckdb::params![model_id], read_row)?;
                mapped.collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY model_id"))?;
                let mapped = stmt.query_map([], read_row)?;
                mapped.collect::<Result<_, _>>()?
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    fn upsert(&self, state: &IncrementalState) -> DbResult<()> {
        let watermark = state
            .watermark_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Internal(format!("encode watermark: {}", e)))?;
        let row_count = state.row_count.map(|n| n as i64);

        let conn = self.lock()?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        let result = conn.execute(
            "INSERT OR REPLACE INTO sl_state.incremental_state \
             (model_id, last_run_timestamp, strategy_used, watermark_value, row_count) \
             VALUES (?, ?, ?, ?, ?)",
            duckdb::params![
                state.model_id.as_str(),
                state.last_run_timestamp.to_rfc3339(),
                state.strategy_used.to_string(),
                watermark,
                row_count,
            ],
        );
        match result {
            Ok(_) => {
                if let Err(commit_err) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(DbError::ExecutionError(format!(
                        "COMMIT failed: {commit_err}"
                    )));
                }
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }
}

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<StateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_row(row: StateRow) -> DbResult<IncrementalState> {
    let (model_id, last_run, strategy, watermark, row_count) = row;
    let corrupt = |what: &str, detail: String| {
        DbError::Internal(format!("corrupt state for '{}': {} ({})", model_id, what, detail))
    };

    let last_run_timestamp = DateTime::parse_from_rfc3339(&last_run)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt("last_run_timestamp", e.to_string()))?;
    let strategy_used: IncrementalStrategy =
        serde_json::from_value(serde_json::Value::String(strategy.clone()))
            .map_err(|e| corrupt("strategy_used", e.to_string()))?;
    let watermark_value = watermark
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| corrupt("watermark_value", e.to_string()))?;
    let model_id = NodeId::normalized(&model_id)
        .ok_or_else(|| corrupt("model_id", "empty".to_string()))?;

    Ok(IncrementalState {
        model_id,
        last_run_timestamp,
        strategy_used,
        watermark_value,
        row_count: row_count.map(|n| n as u64),
    })
}

impl StateStore for DuckDbStateStore {
    fn get(&self, model_id: &str) -> CoreResult<Option<IncrementalState>> {
        Ok(self.query(Some(model_id))?.into_iter().next())
    }

    fn put(&self, state: &IncrementalState) -> CoreResult<()> {
        self.upsert(state)?;
        log::debug!("Recorded state for {} in duckdb", state.model_id);
        Ok(())
    }

    fn all(&self) -> CoreResult<Vec<IncrementalState>> {
        Ok(self.query(None)?)
    }
}
