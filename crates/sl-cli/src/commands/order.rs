//! Order command implementation

use anyhow::Result;
use serde_json::json;

use crate::cli::{GlobalArgs, OrderArgs, OutputFormat};
use crate::commands::common::{self, Project};

/// Execute the order command
pub(crate) async fn execute(args: &OrderArgs, global: &GlobalArgs) -> Result<()> {
    let project = Project::load(global)?;
    let graph = project.graph()?;
    let selection = common::resolve_selection(&graph, args.select.as_deref())?;
    let order = graph.topological_order()?;

    let nodes: Vec<_> = order
        .ranks()
        .iter()
        .map(|&rank| &graph.nodes()[rank])
        .filter(|node| selection.as_ref().map_or(true, |s| s.contains(&node.id)))
        .collect();

    match args.output {
        OutputFormat::Json => {
            let entries: Vec<_> = nodes
                .iter()
                .map(|node| {
                    json!({
                        "id": node.id,
                        "kind": node.kind(),
                        "depends_on": graph.dependencies(node.id.as_str()),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            for (i, node) in nodes.iter().enumerate() {
                println!("{:>4}. {:<8} {}", i + 1, node.kind().to_string(), node.id);
            }
            println!();
            println!("{} node(s)", nodes.len());
        }
    }
    Ok(())
}
