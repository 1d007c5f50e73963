use super::*;
use crate::testing::FakeAdapter;
use sl_core::{
    CoreError, GraphBuilder, IncrementalState, IncrementalStrategy, MaterializationConfig,
    MemoryStateStore, NodeKind, ParsedFunction, ParsedTable, ParsedTest, Resolver,
    SchemaDefaults, TestCheck,
};

fn table(id: &str, sources: &[&str]) -> ParsedTable {
    ParsedTable {
        id: id.to_string(),
        sql: format!("SELECT * FROM {}", sources.first().unwrap_or(&"raw.seed")),
        source_tables: sources.iter().map(|s| s.to_string()).collect(),
        source_functions: vec![],
        materialization_config: MaterializationConfig::default(),
        schema_defaults: SchemaDefaults::default(),
    }
}

fn function(id: &str) -> ParsedFunction {
    ParsedFunction {
        id: id.to_string(),
        definition: format!("CREATE MACRO {}(x) AS x", id),
        depends_on_tables: vec![],
        depends_on_functions: vec![],
        schema_defaults: SchemaDefaults::default(),
    }
}

fn test(id: &str, target: &str, severity: Severity) -> ParsedTest {
    ParsedTest {
        id: id.to_string(),
        target_table: target.to_string(),
        target_column: Some("id".to_string()),
        severity,
        check: TestCheck::NotNull,
        schema_defaults: SchemaDefaults::default(),
    }
}

fn graph(
    tables: &[ParsedTable],
    functions: &[ParsedFunction],
    tests: &[ParsedTest],
) -> DependencyGraph {
    GraphBuilder::from_records(Resolver::new("main"), tables, functions, tests).unwrap()
}

fn orchestrator(adapter: &Arc<FakeAdapter>, options: RunOptions) -> Orchestrator {
    Orchestrator::new(
        adapter.clone(),
        Arc::new(MemoryStateStore::new()),
        options,
    )
}

fn statuses(report: &RunReport) -> Vec<(String, NodeStatus)> {
    report
        .results
        .iter()
        .map(|r| (r.node_id.to_string(), r.status))
        .collect()
}

fn scenario() -> DependencyGraph {
    graph(
        &[table("a", &[]), table("b", &["a"])],
        &[],
        &[
            test("t_a", "a", Severity::Error),
            test("t_b", "b", Severity::Error),
        ],
    )
}

#[tokio::test]
async fn test_everything_succeeds_in_order() {
    let adapter = Arc::new(FakeAdapter::new());
    let report = orchestrator(&adapter, RunOptions::default())
        .run(&scenario())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        adapter.executed(),
        vec!["main.a", "main.b", "t_a", "t_b"]
    );
    let a = report.result("main.a").unwrap();
    assert_eq!(a.kind, NodeKind::Table);
    assert!(a.started_at.is_some() && a.finished_at.is_some());
    assert_eq!(a.rows_affected, Some(1));
}

#[tokio::test]
async fn test_failure_skips_every_descendant() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail("main.a");
    let report = orchestrator(&adapter, RunOptions::default())
        .run(&scenario())
        .await
        .unwrap();

    assert_eq!(
        statuses(&report),
        vec![
            ("main.a".to_string(), NodeStatus::Failed),
            ("main.b".to_string(), NodeStatus::Skipped),
            ("t_a".to_string(), NodeStatus::Skipped),
            ("t_b".to_string(), NodeStatus::Skipped),
        ]
    );
    assert_eq!(adapter.executed(), vec!["main.a"]);
    assert!(report.result("main.a").unwrap().error.is_some());
    assert!(report.result("t_b").unwrap().started_at.is_none());
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_skip_propagates_transitively_but_not_sideways() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail("main.b");
    let g = graph(
        &[
            table("a", &[]),
            table("b", &["a"]),
            table("c", &["b"]),
            table("d", &["c"]),
            table("e", &["a"]),
        ],
        &[],
        &[],
    );
    let report = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap();

    assert_eq!(report.status_of("main.a"), Some(NodeStatus::Succeeded));
    assert_eq!(report.status_of("main.b"), Some(NodeStatus::Failed));
    assert_eq!(report.status_of("main.c"), Some(NodeStatus::Skipped));
    assert_eq!(report.status_of("main.d"), Some(NodeStatus::Skipped));
    assert_eq!(report.status_of("main.e"), Some(NodeStatus::Succeeded));
}

#[tokio::test]
async fn test_function_failure_does_not_abort_run() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail("main.f");
    let g = graph(&[table("a", &[])], &[function("f")], &[]);
    let report = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap();

    assert_eq!(report.status_of("main.f"), Some(NodeStatus::Failed));
    assert_eq!(report.status_of("main.a"), Some(NodeStatus::Succeeded));
    assert!(!report.halted);
}

#[tokio::test]
async fn test_error_severity_failure_stops_new_dispatch() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail_test("t_a", 2);
    // t_a is discovered before `b`, so it is dispatched first once `a` is done
    let mut builder = GraphBuilder::new(Resolver::new("main"));
    builder.add_table_node(&table("a", &[])).unwrap();
    builder
        .add_test_node(&test("t_a", "a", Severity::Error))
        .unwrap();
    builder.add_table_node(&table("b", &["a"])).unwrap();
    let g = builder.build().unwrap();

    let report = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap();

    assert!(report.halted);
    assert_eq!(
        statuses(&report),
        vec![
            ("main.a".to_string(), NodeStatus::Succeeded),
            ("t_a".to_string(), NodeStatus::Failed),
            ("main.b".to_string(), NodeStatus::Skipped),
        ]
    );
    assert_eq!(
        report.result("t_a").unwrap().error.as_deref(),
        Some("[R003] Test returned 2 failing row(s)")
    );
    assert_eq!(adapter.executed(), vec!["main.a", "t_a"]);
}

#[tokio::test]
async fn test_halt_lets_in_flight_nodes_finish() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail_test("t_a", 1);
    adapter.delay("main.b", Duration::from_millis(50));
    let g = graph(
        &[table("a", &[]), table("b", &["a"])],
        &[],
        &[
            test("t_a", "a", Severity::Error),
            test("t_b", "b", Severity::Error),
        ],
    );
    let report = orchestrator(
        &adapter,
        RunOptions {
            threads: 2,
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert!(report.halted);
    assert_eq!(report.status_of("main.b"), Some(NodeStatus::Succeeded));
    assert_eq!(report.status_of("t_b"), Some(NodeStatus::Skipped));
    assert!(!adapter.executed().contains(&"t_b".to_string()));
}

#[tokio::test]
async fn test_warning_severity_never_halts() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.fail_test("t_a", 4);
    adapter.delay("main.b", Duration::from_millis(50));
    let g = graph(
        &[table("a", &[]), table("b", &["a"])],
        &[],
        &[
            test("t_a", "a", Severity::Warning),
            test("t_b", "b", Severity::Error),
        ],
    );
    let report = orchestrator(
        &adapter,
        RunOptions {
            threads: 2,
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert!(!report.halted);
    assert_eq!(report.status_of("t_a"), Some(NodeStatus::Failed));
    assert_eq!(report.status_of("t_b"), Some(NodeStatus::Succeeded));
    assert!(report.is_success());
    assert_eq!(report.summary().warned, 1);
}

#[tokio::test]
async fn test_dispatch_order_is_deterministic() {
    let g = graph(
        &[
            table("c", &["a"]),
            table("a", &[]),
            table("b", &[]),
            table("d", &["b", "c"]),
        ],
        &[function("f")],
        &[test("t_d", "d", Severity::Error)],
    );
    let mut runs = Vec::new();
    for _ in 0..3 {
        let adapter = Arc::new(FakeAdapter::new());
        orchestrator(&adapter, RunOptions::default())
            .run(&g)
            .await
            .unwrap();
        runs.push(adapter.executed());
    }
    assert_eq!(
        runs[0],
        vec!["main.f", "main.a", "main.c", "main.b", "main.d", "t_d"]
    );
    assert!(runs.iter().all(|r| r == &runs[0]));
}

#[tokio::test]
async fn test_parallel_run_respects_dependencies_and_thread_limit() {
    let adapter = Arc::new(FakeAdapter::new());
    for id in ["main.a", "main.b", "main.c"] {
        adapter.delay(id, Duration::from_millis(30));
    }
    let g = graph(
        &[
            table("a", &[]),
            table("b", &[]),
            table("c", &[]),
            table("d", &["a", "b", "c"]),
        ],
        &[],
        &[],
    );
    let report = orchestrator(
        &adapter,
        RunOptions {
            threads: 2,
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert!(report.is_success());
    assert_eq!(adapter.peak_concurrency(), 2);
    assert_eq!(adapter.executed().last().map(String::as_str), Some("main.d"));
}

#[tokio::test]
async fn test_cycle_aborts_before_any_call() {
    let adapter = Arc::new(FakeAdapter::new());
    let g = graph(&[table("a", &["b"]), table("b", &["a"])], &[], &[]);
    let err = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Core(CoreError::CircularDependency { .. })
    ));
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_config_aborts_before_any_call() {
    let adapter = Arc::new(FakeAdapter::new());
    let mut merge = table("m", &[]);
    merge.materialization_config = MaterializationConfig::with_strategy(IncrementalStrategy::Merge);
    let g = graph(&[table("a", &[]), merge], &[], &[]);
    let err = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Core(CoreError::ConfigInvalid { .. })));
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_test_aborts_before_any_call() {
    let adapter = Arc::new(FakeAdapter::new());
    let mut unique = test("t_a", "a", Severity::Error);
    unique.check = TestCheck::Unique;
    unique.target_column = None;
    let g = graph(&[table("a", &[])], &[], &[unique]);
    let err = orchestrator(&adapter, RunOptions::default())
        .run(&g)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::InvalidTest { .. }));
}

#[tokio::test]
async fn test_strategy_mismatch_error_fails_only_that_model() {
    let adapter = Arc::new(FakeAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    store
        .put(&IncrementalState::new(
            NodeId::new("main.m"),
            IncrementalStrategy::Append,
            None,
            None,
        ))
        .unwrap();
    let mut m = table("m", &[]);
    m.materialization_config = MaterializationConfig {
        unique_key: vec!["id".to_string()],
        ..MaterializationConfig::with_strategy(IncrementalStrategy::Merge)
    };
    let g = graph(&[m, table("other", &[])], &[], &[]);
    // Relation must exist for the mismatch to be evaluated
    adapter
        .execute_full_materialization("main.m", "SELECT 1")
        .await
        .unwrap();

    let report = Orchestrator::new(
        adapter.clone(),
        store.clone(),
        RunOptions {
            strategy_mismatch: StrategyMismatchPolicy::Error,
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert_eq!(report.status_of("main.m"), Some(NodeStatus::Failed));
    assert!(report
        .result("main.m")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("[E018]"));
    assert_eq!(report.status_of("main.other"), Some(NodeStatus::Succeeded));
    assert_eq!(
        store.get("main.m").unwrap().unwrap().strategy_used,
        IncrementalStrategy::Append
    );
}

#[tokio::test]
async fn test_strategy_mismatch_warning_is_reported() {
    let adapter = Arc::new(FakeAdapter::new());
    let store = Arc::new(MemoryStateStore::new());
    store
        .put(&IncrementalState::new(
            NodeId::new("main.m"),
            IncrementalStrategy::Append,
            None,
            None,
        ))
        .unwrap();
    adapter
        .execute_full_materialization("main.m", "SELECT 1")
        .await
        .unwrap();
    let mut m = table("m", &[]);
    m.materialization_config = MaterializationConfig {
        unique_key: vec!["id".to_string()],
        ..MaterializationConfig::with_strategy(IncrementalStrategy::Merge)
    };

    let report = Orchestrator::new(adapter.clone(), store.clone(), RunOptions::default())
        .run(&graph(&[m], &[], &[]))
        .await
        .unwrap();

    assert_eq!(report.status_of("main.m"), Some(NodeStatus::Succeeded));
    assert_eq!(
        report.result("main.m").unwrap().run_mode,
        Some(crate::incremental::RunMode::Incremental)
    );
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == sl_core::DiagnosticKind::StrategyMismatch && d.node == "main.m"));
    assert_eq!(
        store.get("main.m").unwrap().unwrap().strategy_used,
        IncrementalStrategy::Merge
    );
}

#[tokio::test]
async fn test_timeout_marks_node_failed_and_skips_dependents() {
    let adapter = Arc::new(FakeAdapter::new());
    adapter.delay("main.slow", Duration::from_secs(5));
    let g = graph(&[table("slow", &[]), table("next", &["slow"])], &[], &[]);
    let report = orchestrator(
        &adapter,
        RunOptions {
            node_timeout: Some(Duration::from_millis(20)),
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert_eq!(report.status_of("main.slow"), Some(NodeStatus::Failed));
    assert!(report
        .result("main.slow")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("[D008]"));
    assert_eq!(report.status_of("main.next"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing_new() {
    let adapter = Arc::new(FakeAdapter::new());
    let orchestrator = orchestrator(&adapter, RunOptions::default());
    orchestrator.cancellation().cancel();
    let report = orchestrator.run(&scenario()).await.unwrap();

    assert!(report.cancelled);
    assert!(adapter.calls().is_empty());
    assert!(report
        .results
        .iter()
        .all(|r| r.status == NodeStatus::Skipped));
}

#[tokio::test]
async fn test_selection_limits_the_run() {
    let adapter = Arc::new(FakeAdapter::new());
    let g = scenario();
    let selection: BTreeSet<NodeId> = g.select("b+").unwrap().into_iter().collect();
    let report = orchestrator(
        &adapter,
        RunOptions {
            selection: Some(selection),
            ..RunOptions::default()
        },
    )
    .run(&g)
    .await
    .unwrap();

    assert_eq!(
        statuses(&report),
        vec![
            ("main.b".to_string(), NodeStatus::Succeeded),
            ("t_b".to_string(), NodeStatus::Succeeded),
        ]
    );
    assert_eq!(adapter.executed(), vec!["main.b", "t_b"]);
}

#[tokio::test]
async fn test_unknown_selection_rejected() {
    let adapter = Arc::new(FakeAdapter::new());
    let err = orchestrator(
        &adapter,
        RunOptions {
            selection: Some(BTreeSet::from([NodeId::new("main.nope")])),
            ..RunOptions::default()
        },
    )
    .run(&scenario())
    .await
    .unwrap_err();
    assert!(matches!(err, RunError::UnknownSelection(_)));
}

#[tokio::test]
async fn test_preflight_lists_selected_order() {
    let adapter = Arc::new(FakeAdapter::new());
    let ids = orchestrator(&adapter, RunOptions::default())
        .preflight(&scenario())
        .unwrap();
    let ids: Vec<_> = ids.iter().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["main.a", "main.b", "t_a", "t_b"]);
}
