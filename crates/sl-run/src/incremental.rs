//! Incremental decision and strategy execution for table nodes.
//!
//! A table node goes through three steps each run:
//!
//! 1. [`should_run_incremental`] compares recorded state with the configured
//!    materialization and picks a [`RunMode`].
//! 2. [`build_time_filter`] renders the predicate that restricts the model
//!    query to new rows.
//! 3. [`execute_strategy`] hands the (filtered) query to the adapter.
//!
//! [`TableRunner`] ties the steps together. Incremental models with a time
//! column are staged once; the next watermark is taken from the stage before
//! the write reads from it, so the recorded watermark covers exactly the rows
//! written. State is written only after the adapter call succeeded.

use crate::error::{RunError, RunResult};
use serde::{Deserialize, Serialize};
use sl_core::sql_utils::{filter_query, quote_ident, quote_qualified};
use sl_core::template::{self, TemplateVars};
use sl_core::{
    CoreError, Diagnostic, DiagnosticKind, IncrementalState, IncrementalStrategy,
    MaterializationConfig, NodeId, StateStore, StrategyMismatchPolicy, TableSpec, WatermarkValue,
};
use sl_db::{Adapter, DbError, DbResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// How a table node is materialized in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Replace the whole table from the unfiltered query
    FullLoad,
    /// Apply the configured strategy to new rows only
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::FullLoad => write!(f, "full_load"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Outcome of [`should_run_incremental`]
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub mode: RunMode,
    /// Short human-readable reason, logged at debug level
    pub reason: &'static str,
    /// Set when a strategy mismatch was tolerated under the `warn` policy
    pub diagnostic: Option<Diagnostic>,
}

impl Decision {
    fn full(reason: &'static str) -> Self {
        Self {
            mode: RunMode::FullLoad,
            reason,
            diagnostic: None,
        }
    }
}

/// Inputs to the full-vs-incremental decision
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub model_id: &'a str,
    pub config: &'a MaterializationConfig,
    pub state: Option<&'a IncrementalState>,
    pub policy: StrategyMismatchPolicy,
    pub full_refresh: bool,
    /// Whether the target relation currently exists
    pub relation_exists: bool,
}

/// Decide whether a model runs incrementally.
///
/// Absent state always means a full load. A recorded strategy that differs
/// from the configured one is handled by `policy`: `ignore` and `warn`
/// continue incrementally with the configured strategy, `error` fails the
/// model with [`CoreError::StrategyMismatch`].
pub fn should_run_incremental(input: DecisionInput<'_>) -> RunResult<Decision> {
    let config = input.config;
    if !config.strategy.is_incremental() {
        return Ok(Decision::full("full strategy"));
    }
    if input.full_refresh {
        return Ok(Decision::full("full refresh requested"));
    }
    let Some(state) = input.state else {
        return Ok(Decision::full("no recorded state"));
    };
    if !input.relation_exists {
        return Ok(Decision::full("target relation missing, state is stale"));
    }

    let mut diagnostic = None;
    if state.strategy_used != config.strategy {
        match input.policy {
            StrategyMismatchPolicy::Ignore => {}
            StrategyMismatchPolicy::Warn => {
                log::warn!(
                    "Model '{}' was last run with '{}' but is configured as '{}'",
                    input.model_id,
                    state.strategy_used,
                    config.strategy
                );
                diagnostic = Some(Diagnostic::new(
                    DiagnosticKind::StrategyMismatch,
                    input.model_id,
                    format!(
                        "recorded strategy '{}' differs from configured '{}'",
                        state.strategy_used, config.strategy
                    ),
                ));
            }
            StrategyMismatchPolicy::Error => {
                return Err(CoreError::StrategyMismatch {
                    node: input.model_id.to_string(),
                    recorded: state.strategy_used.to_string(),
                    configured: config.strategy.to_string(),
                }
                .into());
            }
        }
    }

    if config.time_column.is_some() && state.watermark_value.is_none() {
        return Ok(Decision {
            mode: RunMode::FullLoad,
            reason: "no recorded watermark",
            diagnostic,
        });
    }

    Ok(Decision {
        mode: RunMode::Incremental,
        reason: "state present",
        diagnostic,
    })
}

/// Render the predicate selecting new rows, or `None` when the model has
/// neither a time column nor a filter template.
///
/// The watermark is moved back by the lookback window and rendered as a
/// typed literal. Built-ins `watermark`, `time_column` and `this` shadow
/// user variables of the same name. Without a template the predicate is
/// `<time_column> > @watermark`, or `>=` when a lookback window is set so
/// the overlap includes the boundary.
pub fn build_time_filter(
    model_id: &str,
    config: &MaterializationConfig,
    watermark: Option<&WatermarkValue>,
    vars: &TemplateVars,
) -> RunResult<Option<String>> {
    let template = match (&config.filter_template, &config.time_column) {
        (Some(template), _) => template.clone(),
        (None, Some(column)) => match config.lookback_window {
            Some(_) => format!("{} >= @watermark", column),
            None => format!("{} > @watermark", column),
        },
        (None, None) => return Ok(None),
    };

    let mut scope = vars.clone();
    if let Some(watermark) = watermark {
        let effective = match &config.lookback_window {
            Some(lookback) => watermark.minus(lookback)?,
            None => *watermark,
        };
        scope.insert("watermark".to_string(), effective.to_sql_literal());
    }
    if let Some(column) = &config.time_column {
        scope.insert("time_column".to_string(), column.clone());
    }
    scope.insert("this".to_string(), quote_qualified(model_id));

    Ok(Some(template::render(&template, &scope, model_id)?))
}

/// Run `query` against `table_id` with the configured strategy.
///
/// `predicate` is the rendered time filter; `delete_insert` uses it to clear
/// the window it is about to rewrite. `query` must already be filtered.
pub async fn execute_strategy(
    adapter: &dyn Adapter,
    table_id: &str,
    query: &str,
    config: &MaterializationConfig,
    predicate: Option<&str>,
) -> DbResult<u64> {
    match config.strategy {
        IncrementalStrategy::Full => adapter.execute_full_materialization(table_id, query).await,
        IncrementalStrategy::Append => adapter.execute_append(table_id, query).await,
        IncrementalStrategy::Merge => {
            adapter
                .execute_merge(table_id, query, &config.unique_key)
                .await
        }
        IncrementalStrategy::DeleteInsert => match predicate {
            Some(predicate) => {
                adapter
                    .execute_delete_insert(table_id, query, predicate)
                    .await
            }
            None => Err(DbError::ExecutionError(format!(
                "delete_insert into {} has no filter predicate",
                table_id
            ))),
        },
    }
}

/// Per-model locks serializing state read-modify-write.
///
/// Share one instance (behind an `Arc`) between orchestrators that may run
/// the same project concurrently.
#[derive(Debug, Default)]
pub struct ModelLocks {
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `model_id`
    pub async fn acquire(&self, model_id: &NodeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(model_id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// What happened to one table node
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    pub mode: RunMode,
    pub rows_affected: u64,
    pub predicate: Option<String>,
    pub watermark: Option<WatermarkValue>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Executes table nodes against one adapter and state store
#[derive(Clone)]
pub struct TableRunner {
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) locks: Arc<ModelLocks>,
    pub(crate) policy: StrategyMismatchPolicy,
    pub(crate) full_refresh: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) vars: Arc<TemplateVars>,
}

impl TableRunner {
    pub fn new(adapter: Arc<dyn Adapter>, store: Arc<dyn StateStore>) -> Self {
        Self {
            adapter,
            store,
            locks: Arc::new(ModelLocks::new()),
            policy: StrategyMismatchPolicy::default(),
            full_refresh: false,
            timeout: None,
            vars: Arc::new(TemplateVars::new()),
        }
    }

    /// Materialize one table node and record its state.
    ///
    /// State is written only after the adapter reports success, so a failed
    /// write never advances the watermark.
    pub async fn run(&self, model_id: &NodeId, spec: &TableSpec) -> RunResult<TableOutcome> {
        let _guard = self.locks.acquire(model_id).await;
        let config = &spec.materialization;
        let state = self.store.get(model_id)?;

        let relation_exists = match &state {
            Some(_) if config.strategy.is_incremental() && !self.full_refresh => {
                self.call("relation_exists", self.adapter.relation_exists(model_id))
                    .await?
            }
            _ => true,
        };

        let decision = should_run_incremental(DecisionInput {
            model_id,
            config,
            state: state.as_ref(),
            policy: self.policy,
            full_refresh: self.full_refresh,
            relation_exists,
        })?;
        log::debug!("{}: {} ({})", model_id, decision.mode, decision.reason);

        let previous = state.as_ref().and_then(|s| s.watermark_value);
        let (query, predicate) = match decision.mode {
            RunMode::FullLoad => (spec.sql.clone(), None),
            RunMode::Incremental => {
                let predicate =
                    build_time_filter(model_id, config, previous.as_ref(), &self.vars)?;
                let query = match &predicate {
                    Some(predicate) => filter_query(&spec.sql, predicate),
                    None => spec.sql.clone(),
                };
                (query, predicate)
            }
        };

        let staged_column = config
            .time_column
            .as_deref()
            .filter(|_| config.strategy.is_incremental());
        let (rows_affected, observed) = match staged_column {
            Some(column) => {
                self.write_staged(
                    model_id,
                    config,
                    decision.mode,
                    &query,
                    predicate.as_deref(),
                    column,
                )
                .await?
            }
            None => {
                let rows = self
                    .write(model_id, config, decision.mode, &query, predicate.as_deref())
                    .await?;
                (rows, None)
            }
        };

        let mut watermark = None;
        if config.strategy.is_incremental() {
            let carried = match decision.mode {
                RunMode::Incremental => previous,
                RunMode::FullLoad => None,
            };
            watermark = next_watermark(config, carried, observed);
            self.store.put(&IncrementalState::new(
                model_id.clone(),
                config.strategy,
                watermark,
                Some(rows_affected),
            ))?;
        }

        Ok(TableOutcome {
            mode: decision.mode,
            rows_affected,
            predicate,
            watermark,
            diagnostics: decision.diagnostic.into_iter().collect(),
        })
    }

    /// Write `query` into the model's table in the given mode
    async fn write(
        &self,
        model_id: &NodeId,
        config: &MaterializationConfig,
        mode: RunMode,
        query: &str,
        predicate: Option<&str>,
    ) -> RunResult<u64> {
        match mode {
            RunMode::FullLoad => {
                self.call(
                    "execute_full_materialization",
                    self.adapter.execute_full_materialization(model_id, query),
                )
                .await
            }
            RunMode::Incremental => {
                self.call(
                    "execute_strategy",
                    execute_strategy(self.adapter.as_ref(), model_id, query, config, predicate),
                )
                .await
            }
        }
    }

    /// Stage `query`, read `MAX(column)` from the stage, then write from the
    /// stage. Anything that can fail before the write (including parsing
    /// the max) leaves the table untouched.
    async fn write_staged(
        &self,
        model_id: &NodeId,
        config: &MaterializationConfig,
        mode: RunMode,
        query: &str,
        predicate: Option<&str>,
        column: &str,
    ) -> RunResult<(u64, Option<WatermarkValue>)> {
        let stage = stage_name(model_id);
        let staged = self
            .call("create_stage", self.adapter.create_stage(&stage, query))
            .await?;
        log::debug!("{}: staged {} row(s) in {}", model_id, staged, stage);

        let result: RunResult<(u64, Option<WatermarkValue>)> = async {
            let from_stage = format!("SELECT * FROM {}", quote_ident(&stage));
            let observed = self
                .call("query_max", self.adapter.query_max(&from_stage, column))
                .await?
                .map(|raw| WatermarkValue::parse(&raw, config.time_column_type))
                .transpose()?;
            let rows = self
                .write(model_id, config, mode, &from_stage, predicate)
                .await?;
            Ok((rows, observed))
        }
        .await;

        if let Err(e) = self.call("drop_stage", self.adapter.drop_stage(&stage)).await {
            log::warn!("{}: failed to drop stage {}: {}", model_id, stage, e);
        }
        result
    }

    /// Await an adapter call under the configured timeout
    pub(crate) async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = DbResult<T>>,
    ) -> RunResult<T> {
        with_timeout(self.timeout, operation, fut).await
    }
}

/// Session-local staging relation for one model
pub(crate) fn stage_name(model_id: &str) -> String {
    let suffix: String = model_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("__sl_stage_{}", suffix)
}

/// `max(previous, observed)`, or now when no time column is configured
fn next_watermark(
    config: &MaterializationConfig,
    previous: Option<WatermarkValue>,
    observed: Option<WatermarkValue>,
) -> Option<WatermarkValue> {
    if config.time_column.is_none() {
        return Some(WatermarkValue::Timestamp(chrono::Utc::now().naive_utc()));
    }
    match (previous, observed) {
        (Some(previous), Some(observed)) => Some(previous.max(observed)),
        (previous, observed) => observed.or(previous),
    }
}

/// Await `fut`, failing with [`DbError::Timeout`] once `timeout` elapses
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = DbResult<T>>,
) -> RunResult<T> {
    let Some(limit) = timeout else {
        return Ok(fut.await?);
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RunError::Db(DbError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        })),
    }
}

#[cfg(test)]
#[path = "incremental_test.rs"]
mod tests;
