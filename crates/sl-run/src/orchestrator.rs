//! Run orchestration.
//!
//! A single coordinator owns every status transition. Workers only execute
//! adapter calls and hand their result back, so skip propagation and the
//! severity halt are applied before the next dispatch decision is made.

use crate::error::{RunError, RunResult};
use crate::incremental::{ModelLocks, TableRunner};
use crate::report::{NodeResult, NodeStatus, RunReport};
use chrono::Utc;
use sl_core::{
    DependencyGraph, Diagnostic, Node, NodeDetail, NodeId, Severity, StateStore,
    StrategyMismatchPolicy, TemplateVars,
};
use sl_db::{Adapter, TestOutcome};
use sl_test::generate_test_sql;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Knobs for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of nodes executing at once
    pub threads: usize,
    /// Rebuild every table from its full query
    pub full_refresh: bool,
    pub strategy_mismatch: StrategyMismatchPolicy,
    /// Applied to each adapter call
    pub node_timeout: Option<Duration>,
    /// Variables for filter templates
    pub vars: TemplateVars,
    /// Run only these nodes; dependencies outside the set count as satisfied
    pub selection: Option<BTreeSet<NodeId>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            full_refresh: false,
            strategy_mismatch: StrategyMismatchPolicy::default(),
            node_timeout: None,
            vars: TemplateVars::new(),
            selection: None,
        }
    }
}

/// Shared flag asking a run to stop dispatching
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything checked before the first adapter call
struct Plan {
    /// Ranks in execution order
    order: Vec<usize>,
    selected: Vec<bool>,
    test_sql: HashMap<usize, String>,
}

/// Drives a [`DependencyGraph`] through an [`Adapter`]
pub struct Orchestrator {
    runner: TableRunner,
    threads: usize,
    selection: Option<BTreeSet<NodeId>>,
    cancel: CancellationFlag,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn Adapter>, store: Arc<dyn StateStore>, options: RunOptions) -> Self {
        let mut runner = TableRunner::new(adapter, store);
        runner.policy = options.strategy_mismatch;
        runner.full_refresh = options.full_refresh;
        runner.timeout = options.node_timeout;
        runner.vars = Arc::new(options.vars);
        Self {
            runner,
            threads: options.threads,
            selection: options.selection,
            cancel: CancellationFlag::new(),
        }
    }

    /// Share per-model locks with other orchestrators on the same project
    pub fn with_locks(mut self, locks: Arc<ModelLocks>) -> Self {
        self.runner.locks = locks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this run
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Validate the graph without executing anything.
    ///
    /// Cycles, invalid materialization configs and tests that cannot be
    /// turned into SQL abort the run here.
    pub fn preflight(&self, graph: &DependencyGraph) -> RunResult<Vec<NodeId>> {
        let plan = self.plan(graph)?;
        Ok(plan
            .order
            .iter()
            .filter(|&&r| plan.selected[r])
            .map(|&r| graph.nodes()[r].id.clone())
            .collect())
    }

    fn plan(&self, graph: &DependencyGraph) -> RunResult<Plan> {
        if self.threads == 0 {
            return Err(RunError::InvalidOptions(
                "threads must be at least 1".to_string(),
            ));
        }
        let order = graph.topological_order()?;

        let mut test_sql = HashMap::new();
        for (rank, node) in graph.nodes().iter().enumerate() {
            match &node.detail {
                NodeDetail::Table(spec) => spec.materialization.validate(&node.id)?,
                NodeDetail::Test(spec) => {
                    let sql = generate_test_sql(spec).map_err(|source| RunError::InvalidTest {
                        test: node.id.to_string(),
                        source,
                    })?;
                    test_sql.insert(rank, sql);
                }
                NodeDetail::Function(_) => {}
            }
        }

        let selected = match &self.selection {
            None => vec![true; graph.len()],
            Some(ids) => {
                let mut selected = vec![false; graph.len()];
                for id in ids {
                    let rank = graph
                        .rank_of(id)
                        .ok_or_else(|| RunError::UnknownSelection(id.to_string()))?;
                    selected[rank] = true;
                }
                selected
            }
        };

        Ok(Plan {
            order: order.ranks().to_vec(),
            selected,
            test_sql,
        })
    }

    /// Execute the graph.
    ///
    /// Only pre-flight problems return `Err`; node failures are recorded in
    /// the report.
    pub async fn run(&self, graph: &DependencyGraph) -> RunResult<RunReport> {
        let started_at = Utc::now();
        let mut plan = self.plan(graph)?;
        let n = graph.len();
        log::info!(
            "Running {} node(s) with {} thread(s) on {}",
            plan.selected.iter().filter(|&&s| s).count(),
            self.threads,
            self.runner.adapter.db_type()
        );

        let mut pending: Vec<usize> = (0..n)
            .map(|r| {
                graph
                    .dependency_ranks(r)
                    .into_iter()
                    .filter(|&d| plan.selected[d])
                    .count()
            })
            .collect();
        let mut results: Vec<Option<NodeResult>> = vec![None; n];
        let mut diagnostics: Vec<Diagnostic> = graph.diagnostics().to_vec();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&r| plan.selected[r] && pending[r] == 0)
            .map(Reverse)
            .collect();

        let mut tasks = JoinSet::new();
        let mut task_ranks = HashMap::new();
        let mut halted = false;

        loop {
            while let Some(&Reverse(rank)) = ready.peek() {
                if results[rank].is_some() {
                    // Already skipped; settles like any finished node
                    ready.pop();
                    release(graph, rank, &plan.selected, &mut pending, &mut ready);
                    continue;
                }
                if halted || self.cancel.is_cancelled() || tasks.len() >= self.threads {
                    break;
                }
                ready.pop();

                let node = graph.nodes()[rank].clone();
                log::debug!("Dispatching {}", node.id);
                let runner = self.runner.clone();
                let test_sql = plan.test_sql.remove(&rank);
                let handle = tasks.spawn(async move {
                    let outcome = execute_node(&runner, node, test_sql).await;
                    (rank, outcome)
                });
                task_ranks.insert(handle.id(), rank);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (rank, result) = match joined {
                Ok((id, (rank, (result, node_diagnostics)))) => {
                    task_ranks.remove(&id);
                    diagnostics.extend(node_diagnostics);
                    (rank, result)
                }
                Err(err) => {
                    let Some(rank) = task_ranks.remove(&err.id()) else {
                        continue;
                    };
                    let node = &graph.nodes()[rank];
                    let mut result =
                        NodeResult::new(node.id.clone(), node.kind(), NodeStatus::Failed);
                    result.error = Some(format!("node task aborted: {}", err));
                    (rank, result)
                }
            };

            if result.status == NodeStatus::Failed {
                for d in graph.descendant_ranks(rank) {
                    if plan.selected[d] && results[d].is_none() {
                        let node = &graph.nodes()[d];
                        log::info!("Skipping {} (upstream '{}' failed)", node.id, result.node_id);
                        results[d] = Some(NodeResult::skipped(
                            node.id.clone(),
                            node.kind(),
                            format!("upstream '{}' failed", result.node_id),
                        ));
                    }
                }
                if result.severity == Some(Severity::Error) && !halted {
                    log::warn!(
                        "Test '{}' failed with severity error; no new nodes will start",
                        result.node_id
                    );
                    halted = true;
                }
            }

            results[rank] = Some(result);
            release(graph, rank, &plan.selected, &mut pending, &mut ready);
        }

        let cancelled = self.cancel.is_cancelled();
        let reason = if halted {
            "run halted after a failing error-severity test"
        } else {
            "run cancelled"
        };
        let results: Vec<NodeResult> = plan
            .order
            .iter()
            .filter(|&&r| plan.selected[r])
            .map(|&r| {
                results[r].take().unwrap_or_else(|| {
                    let node = &graph.nodes()[r];
                    NodeResult::skipped(node.id.clone(), node.kind(), reason.to_string())
                })
            })
            .collect();

        let report = RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: Utc::now(),
            results,
            diagnostics,
            halted,
            cancelled,
        };
        let summary = report.summary();
        log::info!(
            "Run finished: {} succeeded, {} failed, {} warned, {} skipped",
            summary.succeeded,
            summary.failed,
            summary.warned,
            summary.skipped
        );
        Ok(report)
    }
}

/// Mark `rank` terminal for its dependents and queue the ones now ready
fn release(
    graph: &DependencyGraph,
    rank: usize,
    selected: &[bool],
    pending: &mut [usize],
    ready: &mut BinaryHeap<Reverse<usize>>,
) {
    for d in graph.dependent_ranks(rank) {
        if !selected[d] {
            continue;
        }
        pending[d] -= 1;
        if pending[d] == 0 {
            ready.push(Reverse(d));
        }
    }
}

/// Run one node and describe what happened
async fn execute_node(
    runner: &TableRunner,
    node: Node,
    test_sql: Option<String>,
) -> (NodeResult, Vec<Diagnostic>) {
    let kind = node.kind();
    let mut result = NodeResult::new(node.id.clone(), kind, NodeStatus::Succeeded);
    let mut diagnostics = Vec::new();
    result.started_at = Some(Utc::now());
    log::info!("Running {} {}", kind, node.id);

    let outcome = match &node.detail {
        NodeDetail::Function(spec) => {
            runner
                .call(
                    "create_function",
                    runner.adapter.create_function(&node.id, &spec.definition),
                )
                .await
        }
        NodeDetail::Table(spec) => runner.run(&node.id, spec).await.map(|outcome| {
            result.run_mode = Some(outcome.mode);
            result.rows_affected = Some(outcome.rows_affected);
            result.predicate = outcome.predicate;
            diagnostics = outcome.diagnostics;
        }),
        NodeDetail::Test(spec) => {
            result.severity = Some(spec.severity);
            let sql = test_sql.unwrap_or_default();
            match runner
                .call("run_test", runner.adapter.run_test(&node.id, &sql))
                .await
            {
                Ok(TestOutcome::Pass) => Ok(()),
                Ok(TestOutcome::Fail { failing_rows }) => {
                    Err(RunError::TestFailed { failing_rows })
                }
                Err(e) => Err(e),
            }
        }
    };

    result.finished_at = Some(Utc::now());
    match outcome {
        Ok(()) => log::info!("{} {} succeeded", kind, node.id),
        Err(e) => {
            if result.severity == Some(Severity::Warning) {
                log::warn!("{} {} failed: {}", kind, node.id, e);
            } else {
                log::error!("{} {} failed: {}", kind, node.id, e);
            }
            result.status = NodeStatus::Failed;
            result.error = Some(e.to_string());
        }
    }
    (result, diagnostics)
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
