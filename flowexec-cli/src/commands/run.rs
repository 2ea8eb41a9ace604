use crate::builtins;
use crate::output;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use serde_json::Value;
use tracing::{debug, info};

use flow_executor::{
    cancel_pair, progress_channel, ExecutionEvent, ExecutorConfig, FlowExecutor, MemoryStorage,
    Row, Status,
};

/// Run a flow over every row of a JSON-lines data file
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the flow YAML file
    pub flow: PathBuf,

    /// JSON-lines file, one input row per line
    #[arg(long, short = 'd', value_name = "FILE")]
    pub data: PathBuf,

    /// Bind a flow input to a row column (can be repeated, format: input=${data.column})
    #[arg(long = "map", short = 'm', value_name = "INPUT=BINDING")]
    pub mappings: Vec<String>,

    /// Executor config file (YAML)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of lines run concurrently
    #[arg(long, short = 'w', value_name = "N")]
    pub workers: Option<usize>,

    /// Maximum concurrently running nodes per line (0 = unbounded)
    #[arg(long, value_name = "N")]
    pub node_concurrency: Option<usize>,

    /// Per-line timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop the batch at the first failing line
    #[arg(long)]
    pub raise: bool,

    /// Print node-level progress
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let flow_path = &args.flow;

    if !flow_path.exists() {
        bail!("Flow file not found: {}", flow_path.display());
    }

    let mapping = parse_mappings(&args.mappings)?;
    let config = build_config(&args)?;
    let rows = read_rows(&args.data)?;

    output::status("Loading", &format!("{}", flow_path.display()));
    let storage = Arc::new(MemoryStorage::new());
    let (tx, mut rx) = progress_channel();
    let executor = FlowExecutor::from_file(flow_path, &builtins::registry())
        .map_err(|e| eyre!("Failed to load flow: {}", e))?
        .with_config(config)
        .with_storage(storage.clone())
        .with_progress(tx);

    output::info(&format!(
        "Flow '{}': {} nodes, {} rows, {} workers",
        executor.graph().name,
        executor.graph().nodes().len(),
        rows.len(),
        executor.config().worker_count
    ));

    info!(
        flow = %executor.graph().name,
        rows = rows.len(),
        mappings = mapping.len(),
        "starting batch"
    );

    let (cancel, signal) = cancel_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, canceling remaining lines");
            info!("ctrl-c received, canceling batch");
            cancel.cancel();
        }
    });

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move {
        executor
            .run_batch_with_cancel(rows, &mapping, &signal)
            .await
    });

    // Process events in the foreground
    let verbose = args.verbose;
    while let Some(event) = rx.recv().await {
        print_event(&event, verbose);
    }

    let result = exec_handle.await?;
    interrupt.abort();
    let result = result.map_err(|e| eyre!("Batch aborted: {}", e))?;
    info!(run_id = %result.run_id, status = %result.status, "batch finished");

    for line in &result.line_results {
        let record = serde_json::json!({
            "line_number": line.line_number(),
            "status": line.status(),
            "output": line.output,
        });
        println!("{}", record);
    }
    if !result.aggregation.outputs.is_empty() {
        println!(
            "{}",
            serde_json::json!({ "aggregation": result.aggregation.outputs })
        );
    }

    output::batch_summary(&result);
    output::dim(&format!(
        "  {} node runs and {} line runs recorded",
        storage.node_runs().len(),
        storage.line_runs().len()
    ));

    if result.status != Status::Completed {
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent, verbose: bool) {
    match event {
        ExecutionEvent::BatchStarted {
            flow_name,
            total_lines,
            ..
        } => {
            eprintln!();
            output::header(&format!("Flow '{}' ({} lines)", flow_name, total_lines));
        }

        ExecutionEvent::LineCompleted {
            line_number,
            status,
            duration,
        } => output::line_finished(*line_number, *status, *duration),

        ExecutionEvent::NodeCompleted {
            node,
            line_number,
            cached,
            duration,
        } if verbose => {
            let cached = if *cached { " (cached)" } else { "" };
            output::dim(&format!(
                "      {} @ {:?}: OK{} ({}ms)",
                node,
                line_number,
                cached,
                duration.as_millis()
            ));
        }

        ExecutionEvent::NodeBypassed { node, line_number } if verbose => {
            output::dim(&format!("      {} @ {:?}: bypassed", node, line_number));
        }

        ExecutionEvent::NodeFailed {
            node,
            line_number,
            error,
        } => {
            let at = line_number
                .map(|n| format!("line {}", n))
                .unwrap_or_else(|| "aggregation".to_string());
            output::warning(&format!("{} ({}): {}", node, at, error));
        }

        ExecutionEvent::AggregationStarted { nodes } => {
            output::status("Aggregating", &nodes.join(", "));
        }

        ExecutionEvent::AggregationCompleted {
            failed_nodes,
            duration,
        } => {
            let text = format!(
                "  Aggregation {} ({:.2}s)",
                if *failed_nodes == 0 { "OK" } else { "FAIL" },
                duration.as_secs_f64()
            );
            if *failed_nodes == 0 {
                output::dim(&text);
            } else {
                output::failure(&text);
            }
        }

        _ => {}
    }
}

/// Config file (or defaults), then environment, then flags
fn build_config(args: &RunArgs) -> Result<ExecutorConfig> {
    let base = match &args.config {
        Some(path) => ExecutorConfig::from_yaml_file(path)?,
        None => ExecutorConfig::default(),
    };
    let mut config = base.merge_env(|key| std::env::var(key).ok())?;

    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(limit) = args.node_concurrency {
        config = config.with_node_concurrency(limit);
    }
    if let Some(secs) = args.timeout {
        config = config.with_line_timeout(Duration::from_secs(secs));
    }
    if args.raise {
        config = config.with_raise_on_error(true);
    }

    config.validate()?;
    debug!(?config, "executor config resolved");
    Ok(config)
}

fn parse_mappings(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut mapping = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((name, binding)) if !name.trim().is_empty() => {
                mapping.insert(name.trim().to_string(), Value::String(binding.to_string()));
            }
            _ => bail!("Invalid mapping '{}'. Expected input=binding", pair),
        }
    }
    Ok(mapping)
}

/// Read one JSON object per non-blank line
fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read data file {}", path.display()))?;

    let mut rows = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(line)
            .wrap_err_with(|| format!("{}:{}: expected a JSON object", path.display(), index + 1))?;
        rows.push(row);
    }
    Ok(rows)
}
