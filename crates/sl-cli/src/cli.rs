//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Sluice - dependency-aware, incremental SQL pipeline runner
#[derive(Parser, Debug)]
#[command(name = "sl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to project directory
    #[arg(short = 'p', long, global = true, default_value = ".")]
    pub project_dir: String,

    /// Override config file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Target from sluice.yml (falls back to SL_TARGET)
    #[arg(short, long, global = true)]
    pub target: Option<String>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute functions, models and tests in dependency order
    Run(RunArgs),

    /// Print the execution order
    Order(OrderArgs),

    /// Inspect recorded incremental state
    State(StateArgs),
}

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Selectors (comma-separated; `+name` adds ancestors, `name+` descendants)
    #[arg(short, long)]
    pub select: Option<String>,

    /// Rebuild every model from its full query
    #[arg(long)]
    pub full_refresh: bool,

    /// Maximum nodes running at once (default: `threads` from sluice.yml)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,

    /// Template variable as key=value (repeatable)
    #[arg(long = "vars", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Template variables as a JSON object
    #[arg(long)]
    pub vars_json: Option<String>,
}

/// Arguments for the order command
#[derive(Args, Debug)]
pub struct OrderArgs {
    /// Selectors (comma-separated)
    #[arg(short, long)]
    pub select: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the state command
#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommands,
}

/// State subcommands
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show recorded state for one model or all of them
    Show(StateShowArgs),
}

/// Arguments for `state show`
#[derive(Args, Debug)]
pub struct StateShowArgs {
    /// Model id (default: all)
    pub model: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;
