//! State command implementation

use anyhow::{bail, Result};

use crate::cli::{GlobalArgs, OutputFormat, StateArgs, StateCommands, StateShowArgs};
use crate::commands::common::Project;

/// Execute the state command
pub(crate) async fn execute(args: &StateArgs, global: &GlobalArgs) -> Result<()> {
    match &args.command {
        StateCommands::Show(show) => execute_show(show, global),
    }
}

fn execute_show(args: &StateShowArgs, global: &GlobalArgs) -> Result<()> {
    let project = Project::load(global)?;
    let backend = project.backend()?;
    let store = project.state_store(&backend)?;

    let states = match &args.model {
        Some(model) => {
            let resolver = project.config.resolver(project.target.as_deref());
            let Some(id) = resolver.resolve(model, None).id().cloned() else {
                bail!("Invalid model id '{}'", model);
            };
            match store.get(&id)? {
                Some(state) => vec![state],
                None => bail!("No recorded state for '{}'", id),
            }
        }
        None => store.all()?,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&states)?),
        OutputFormat::Text => {
            if states.is_empty() {
                println!("No incremental state recorded.");
                return Ok(());
            }
            println!(
                "{:<32} {:<14} {:<28} {:>10}  LAST RUN",
                "MODEL", "STRATEGY", "WATERMARK", "ROWS"
            );
            for state in &states {
                println!(
                    "{:<32} {:<14} {:<28} {:>10}  {}",
                    state.model_id.to_string(),
                    state.strategy_used.to_string(),
                    state
                        .watermark_value
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |w| w.to_string()),
                    state
                        .row_count
                        .map_or_else(|| "-".to_string(), |n| n.to_string()),
                    state.last_run_timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}
