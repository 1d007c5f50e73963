//! CLI integration tests against a file-backed DuckDB project

use sl_db::{Adapter, DuckDbBackend};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Path to the compiled sl binary (resolved at compile time)
fn sl_bin() -> String {
    env!("CARGO_BIN_EXE_sl").to_string()
}

const CONFIG: &str = r#"
name: shop
database:
  path: warehouse.duckdb
"#;

const MANIFEST: &str = r#"
tables:
  - id: events_clean
    sql: SELECT id, updated_at FROM raw.events
    source_tables: [raw.events]
    materialization:
      strategy: append
      time_column: updated_at
  - id: event_ids
    sql: SELECT id FROM events_clean
    source_tables: [events_clean]
tests:
  - id: events_clean_id_not_null
    target_table: events_clean
    target_column: id
    check:
      type: not_null
"#;

async fn seed(dir: &Path, values: &str) {
    let backend = DuckDbBackend::from_path(&dir.join("warehouse.duckdb")).unwrap();
    backend
        .execute_full_materialization(
            "raw.events",
            &format!("SELECT * FROM (VALUES {values}) AS t(id, updated_at)"),
        )
        .await
        .unwrap();
}

fn project(manifest: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("sluice.yml"), CONFIG).unwrap();
    std::fs::write(dir.path().join("manifest.yml"), manifest).unwrap();
    dir
}

fn sl(dir: &Path, args: &[&str]) -> Output {
    Command::new(sl_bin())
        .args(args)
        .arg("--project-dir")
        .arg(dir)
        .output()
        .expect("Failed to run sl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_order_lists_nodes_in_dependency_order() {
    let dir = project(MANIFEST);
    let output = sl(dir.path(), &["order"]);
    assert!(output.status.success(), "{:?}", output);

    let out = stdout(&output);
    let clean = out.find("main.events_clean").unwrap();
    let ids = out.find("main.event_ids").unwrap();
    let test = out.find("events_clean_id_not_null").unwrap();
    assert!(clean < ids && clean < test, "{}", out);
    assert!(out.contains("3 node(s)"));
}

#[test]
fn test_order_rejects_cycle() {
    let dir = project(
        r#"
tables:
  - id: a
    sql: SELECT * FROM b
    source_tables: [b]
  - id: b
    sql: SELECT * FROM a
    source_tables: [a]
"#,
    );
    let output = sl(dir.path(), &["order"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("E007"));
}

#[tokio::test]
async fn test_run_then_incremental_run_and_state_show() {
    let dir = project(MANIFEST);
    seed(
        dir.path(),
        "(1, TIMESTAMP '2024-01-01 10:00:00'), (2, TIMESTAMP '2024-01-01 11:00:00')",
    )
    .await;

    let first = sl(dir.path(), &["run"]);
    assert!(first.status.success(), "{:?}", first);
    let out = stdout(&first);
    assert!(out.contains("main.events_clean [table, full_load, 2 rows]"), "{}", out);
    assert!(out.contains("3 succeeded, 0 failed"), "{}", out);
    assert!(dir.path().join("target").join("run_results.json").exists());

    let second = sl(dir.path(), &["run", "--select", "events_clean"]);
    assert!(second.status.success(), "{:?}", second);
    assert!(stdout(&second).contains("main.events_clean [table, incremental"));

    let state = sl(dir.path(), &["state", "show", "events_clean"]);
    assert!(state.status.success(), "{:?}", state);
    let out = stdout(&state);
    assert!(out.contains("append"), "{}", out);
    assert!(out.contains("2024-01-01T11:00:00"), "{}", out);
}

#[tokio::test]
async fn test_failing_error_test_exits_nonzero() {
    let dir = project(MANIFEST);
    seed(dir.path(), "(CAST(NULL AS INTEGER), TIMESTAMP '2024-01-01 10:00:00')").await;

    let output = sl(dir.path(), &["run"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("Run halted"), "{:?}", output);

    let results: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("target").join("run_results.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(results["halted"], true);
}

#[test]
fn test_missing_manifest_reports_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("sluice.yml"), CONFIG).unwrap();
    let output = sl(dir.path(), &["order"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("manifest"));
}
