//! Run command implementation

use anyhow::{Context, Result};
use sl_core::{Diagnostic, NodeKind};
use sl_run::{CancellationFlag, NodeResult, NodeStatus, Orchestrator, RunOptions, RunReport};
use std::time::Duration;

use crate::cli::{GlobalArgs, RunArgs};
use crate::commands::common::{self, ExitCode, Project};

const RESULTS_FILE: &str = "run_results.json";

/// Execute the run command
pub(crate) async fn execute(args: &RunArgs, global: &GlobalArgs) -> Result<()> {
    let project = Project::load(global)?;
    let graph = project.graph()?;
    let selection = common::resolve_selection(&graph, args.select.as_deref())?;

    let base_vars = project
        .config
        .template_vars(project.target.as_deref())
        .context("Invalid project vars")?;
    let vars = common::merge_cli_vars(base_vars, &args.vars, args.vars_json.as_deref())?;

    let options = RunOptions {
        threads: args.threads.unwrap_or(project.config.threads),
        full_refresh: args.full_refresh,
        strategy_mismatch: project.config.strategy_mismatch,
        node_timeout: project.config.node_timeout_secs.map(Duration::from_secs),
        vars,
        selection,
    };

    let backend = project.backend()?;
    let store = project.state_store(&backend)?;
    let cancel = CancellationFlag::new();
    let orchestrator = Orchestrator::new(backend, store, options).with_cancellation(cancel.clone());

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; waiting for running nodes to finish");
            cancel.cancel();
        }
    });
    let report = orchestrator.run(&graph).await;
    ctrl_c.abort();
    let report = report.context("Run aborted before execution")?;

    print_report(&report);

    let results_path = project.target_dir().join(RESULTS_FILE);
    report
        .write_json(&results_path)
        .context("Failed to write run results")?;
    log::debug!("Wrote {}", results_path.display());

    if !report.is_success() {
        return Err(ExitCode(1).into());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        println!("{}", format_result(result));
    }
    print_diagnostics(&report.diagnostics);

    let summary = report.summary();
    println!();
    println!(
        "Done. {} succeeded, {} failed, {} warned, {} skipped ({:.2}s)",
        summary.succeeded,
        summary.failed,
        summary.warned,
        summary.skipped,
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    if report.halted {
        println!("Run halted after a failing error-severity test.");
    }
    if report.cancelled {
        println!("Run cancelled.");
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    println!();
    println!("Warnings:");
    for diagnostic in diagnostics {
        println!("  {}", diagnostic);
    }
}

fn format_result(result: &NodeResult) -> String {
    let icon = match result.status {
        NodeStatus::Succeeded => "✓",
        NodeStatus::Failed if result.is_warning() => "!",
        NodeStatus::Failed => "✗",
        NodeStatus::Skipped => "-",
    };
    let mut detail = result.kind.to_string();
    if let Some(mode) = result.run_mode {
        detail.push_str(&format!(", {}", mode));
    }
    if let Some(rows) = result.rows_affected {
        if result.kind == NodeKind::Table {
            detail.push_str(&format!(", {} rows", rows));
        }
    }
    let mut line = format!("  {} {} [{}]", icon, result.node_id, detail);
    if let Some(secs) = result.duration_secs() {
        line.push_str(&format!(" ({:.2}s)", secs));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(" - {}", error));
    }
    line
}
