use crate::builtins;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use flow_executor::{FlowGraph, FlowParser};

/// Validate a flow YAML file against the built-in tools
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the flow YAML file
    pub flow: PathBuf,

    /// Print nodes in execution order
    #[arg(long)]
    pub order: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let flow_path = &args.flow;

    if !flow_path.exists() {
        color_eyre::eyre::bail!("Flow file not found: {}", flow_path.display());
    }

    output::status("Validating", &format!("{}", flow_path.display()));

    let definition = match FlowParser::parse_file(flow_path) {
        Ok(d) => d,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if !e.context.is_empty() {
                output::dim(&e.context);
            }
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");

    let graph = match FlowGraph::load(&definition, &builtins::registry()) {
        Ok(g) => g,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    let aggregation_count = graph.aggregation_nodes().count();
    output::check(&format!(
        "Structure: {} inputs, {} outputs, {} nodes ({} aggregation)",
        graph.inputs.len(),
        graph.outputs.len(),
        graph.nodes().len(),
        aggregation_count
    ));
    output::check("Dependency graph is acyclic");

    if args.order {
        let ordered = graph
            .topological_order()
            .into_iter()
            .chain(graph.aggregation_nodes());
        for (index, node) in ordered.enumerate() {
            let marker = if node.aggregation { " [aggregation]" } else { "" };
            output::dim(&format!(
                "    {:>3}. {} ({}){}",
                index + 1,
                node.name,
                node.tool_name,
                marker
            ));
        }
    }

    eprintln!();
    output::success(&format!("Flow '{}' is valid", graph.name));

    Ok(())
}
